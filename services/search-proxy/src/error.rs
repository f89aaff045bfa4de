//! Service-specific error types

use key_store::KeyKind;
use thiserror::Error;

/// Terminal search failures surfaced to the caller.
///
/// Provider rejections and proxy suspensions are handled inside the
/// orchestrator (the key is penalized and the next attempt starts); only
/// these variants ever leave it.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("no usable {0} key, try again later")]
    PoolExhausted(KeyKind),

    #[error("search failed after {attempts} attempts")]
    AllAttemptsExhausted { attempts: u32 },

    /// An ordinary user has used up today's searches.
    #[error("daily limit of {limit} searches reached, try again tomorrow")]
    DailyLimitReached { limit: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A leased key vanished before its outcome was recorded.
    #[error("key store inconsistency: key {0} not found")]
    KeyNotFound(String),

    #[error("key store failure: {0}")]
    Store(String),
}

impl SearchError {
    /// Short label for metrics and response bodies.
    pub fn label(&self) -> &'static str {
        match self {
            SearchError::PoolExhausted(_) => "pool_exhausted",
            SearchError::AllAttemptsExhausted { .. } => "all_attempts_exhausted",
            SearchError::DailyLimitReached { .. } => "daily_limit_reached",
            SearchError::InvalidRequest(_) => "invalid_request",
            SearchError::KeyNotFound(_) => "key_not_found",
            SearchError::Store(_) => "store_error",
        }
    }
}

impl From<key_pool::Error> for SearchError {
    fn from(err: key_pool::Error) -> Self {
        match err {
            key_pool::Error::KeyNotFound(id) => SearchError::KeyNotFound(id),
            key_pool::Error::DailyLimitReached { limit } => SearchError::DailyLimitReached { limit },
            key_pool::Error::EmptyUserId => {
                SearchError::InvalidRequest("user_id must not be empty".into())
            }
            other => SearchError::Store(other.to_string()),
        }
    }
}
