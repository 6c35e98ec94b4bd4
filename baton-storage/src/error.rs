//! Error types for storage operations

use thiserror::Error;

/// Storage layer error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted snapshot: {0}")]
    Corrupted(String),

    #[error("Core domain error: {0}")]
    Core(#[from] baton_core::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

// The `SnapshotStore` trait lives in the core crate and speaks the core
// error taxonomy, so the store impl folds storage errors back into it.
impl From<Error> for baton_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => baton_core::Error::Io(e.to_string()),
            Error::Serialization(e) => baton_core::Error::Serialization(e.to_string()),
            Error::Corrupted(message) => baton_core::Error::corrupted_snapshot(message),
            Error::Core(e) => e,
            Error::Internal(e) => baton_core::Error::Internal(e.to_string()),
        }
    }
}
