use std::fmt;

/// Result alias used throughout the store for the handful of operations that
/// can fail at the public API boundary. Most of the reconciliation engine
/// reports failure only through logging (see [`crate::status`]) since it must
/// stay idempotent against benign races; `Error` is reserved for illegal
/// client operations that a caller can plausibly react to.
pub type StoreResult<T> = Result<T, Error>;

/// Errors a [`crate::store::Store`] can return to a caller.
///
/// These are never raised for server-originated events: reconciliation
/// callbacks are idempotent against stale or unknown store
/// keys and only ever log. `Error` is for client misuse.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// `createRecord` called on a record whose status is neither `EMPTY` nor
    /// `DESTROYED`.
    AlreadyExists(String),

    /// `updateHash` called with `changeIsDirty = true` against a record whose
    /// status lacks `READY`.
    WriteToUnready(String),

    /// `getStoreKey`/`setIdForStoreKey` would map two store keys to the same
    /// `(Type, id)` pair.
    DuplicateId(String),

    /// `unloadRecord` called against a record that cannot legally be
    /// unloaded (modifier bit set, observers attached, or nested stores
    /// still holding a reference).
    NotUnloadable(String),

    /// Any other internal invariant violation.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyExists(msg) => write!(f, "record already exists: {}", msg),
            Error::WriteToUnready(msg) => write!(f, "write to unready record: {}", msg),
            Error::DuplicateId(msg) => write!(f, "duplicate id: {}", msg),
            Error::NotUnloadable(msg) => write!(f, "record is not unloadable: {}", msg),
            Error::Internal(msg) => write!(f, "internal store error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
