mod config;
mod demo;
mod trace;

use clap::Parser;
use log::info;

use config::DemoConfig;

#[derive(Debug, Parser)]
#[command(version, author, about = "Demo driver for the client-side record store")]
struct Args {
    #[clap(short, long, help = "print the resolved config before running")]
    debug: bool,

    /// Configuration file path, default 'config/store-cli.yaml'
    #[clap(short = 'c', long = "config", default_value = "config/store-cli.yaml")]
    config: String,

    /// Overrides the config file's log level.
    #[clap(short = 'l', long)]
    log_level: Option<String>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    eprintln!();
    eprintln!("██  ██  █        █");
    eprintln!("██ ██   ██      ██");
    eprintln!("███      ██    ██   record-store demo");
    eprintln!("██ ██     ██  ██");
    eprintln!("██  ██     ████");
    eprintln!();

    let args = Args::parse();
    let mut cfg = DemoConfig::load(&args.config);
    if let Some(level) = &args.log_level {
        cfg.log_level = Some(level.clone());
    }
    if args.debug {
        println!("{:?}", &cfg);
    }

    let _guards = trace::init_logging(&cfg.log_dir(), &cfg.log_level())?;
    info!("store-cli starting with config: {:?}", &cfg);

    demo::run(cfg.store_config()).await;

    Ok(())
}
