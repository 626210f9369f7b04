//! A client-side record store: an in-memory cache of structured records
//! that mediates between user code and an asynchronous remote [`Source`].
//!
//! The store guarantees a well-defined per-record lifecycle (see
//! [`status::Status`]), coalesces local mutations into batched commits
//! ([`Store::commit_changes`]), reconciles concurrent local edits against
//! server-originated updates (the `source_did_*` family on [`Store`]), and
//! supports nested transactional overlay stores ([`Store::new_nested`]).
//!
//! [`Source`]: source::Source

pub mod config;
pub mod data;
pub mod error;
pub mod hash;
pub mod journal;
pub mod key;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod source;
pub mod status;
pub mod store;

pub use config::StoreConfig;
pub use error::{Error, StoreResult};
pub use hash::AttrHash;
pub use key::{StoreKey, TypeName};
pub use query::{LocalQuery, QueryId, RemoteQuery};
pub use record::{LoggingObserver, NoopObserver, RecordObserver, TypeMeta};
pub use source::{CommitAck, CreateOutcome, MockSource, Source, TypeChangeset};
pub use status::Status;
pub use store::Store;
