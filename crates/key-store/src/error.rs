//! Error types for key store operations

/// Errors from key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    Duplicate(String),

    #[error("conflicting update on key {id}: expected revision {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
