use serde_derive::{Deserialize, Serialize};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Demo-binary configuration, loaded from a small YAML file. Unlike
/// [`store::StoreConfig`] (which a library consumer constructs directly),
/// this is CLI-facing plumbing: where to write logs, at what level, and
/// which `StoreConfig` fields to override from their defaults.
///
/// Following the teacher's `ConfigLoad` pattern: a `Default` impl carrying
/// the documented defaults, loaded from a path with a fallback to
/// `Default` on any read/parse error (logged, not fatal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Directory the rolling log file is written under.
    pub log_dir: Option<String>,

    /// `log` level filter name (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// Overrides `StoreConfig::auto_commit` (default `true`).
    pub auto_commit: Option<bool>,

    /// Overrides `StoreConfig::rebase_conflicts` (default `true`).
    pub rebase_conflicts: Option<bool>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            log_dir: None,
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            auto_commit: None,
            rebase_conflicts: None,
        }
    }
}

impl DemoConfig {
    /// Loads from `path`; falls back to `Default::default()` on any
    /// read/parse error, logging the fallback at `warn!` rather than
    /// failing the process over a missing or malformed demo config.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    log::warn!("failed to parse config {}: {}, using defaults", path, err);
                    DemoConfig::default()
                }
            },
            Err(err) => {
                log::warn!("failed to read config {}: {}, using defaults", path, err);
                DemoConfig::default()
            }
        }
    }

    pub fn log_dir(&self) -> String {
        self.log_dir.clone().unwrap_or_else(|| {
            format!("{}/.store-cli", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
        })
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn store_config(&self) -> store::StoreConfig {
        let defaults = store::StoreConfig::default();
        store::StoreConfig {
            auto_commit: self.auto_commit.unwrap_or(defaults.auto_commit),
            rebase_conflicts: self.rebase_conflicts.unwrap_or(defaults.rebase_conflicts),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = DemoConfig::load("/nonexistent/store-cli-demo-config.yaml");
        assert_eq!(cfg.log_level(), "info");
        assert!(cfg.store_config().auto_commit);
    }
}
