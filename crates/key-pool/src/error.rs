//! Error types for pool operations

use key_store::KeyKind;

/// Errors from pool, ledger and sweeper operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A leased key disappeared before its outcome was committed.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key {id} is {actual}, not {expected}")]
    KindMismatch {
        id: String,
        expected: KeyKind,
        actual: KeyKind,
    },

    #[error("a {0} key with this secret already exists")]
    DuplicateSecret(KeyKind),

    #[error("secret must not be empty")]
    EmptySecret,

    #[error("daily limit of {limit} searches reached")]
    DailyLimitReached { limit: u32 },

    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("key store error: {0}")]
    Store(#[from] key_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
