//! Search provider abstraction for the reverse-search proxy
//!
//! Defines the `SearchBackend` trait that decouples the orchestrator from the
//! concrete two-stage chain (image-search provider reached through an HTTP
//! scraping proxy). The reqwest implementation lives in `proxied`; payload
//! parsing and shape-based classification live in `payload`.

pub mod payload;
pub mod proxied;

pub use payload::{Payload, SearchMatch, classify_payload};
pub use proxied::ProxiedSearchBackend;

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Classification of a failed proxy-stage call, driving what happens to keys.
///
/// - RateLimited suspends the PROXY key for a fixed delay
/// - QuotaExceeded suspends the PROXY key until the monthly reset
/// - Rejected blames the SEARCH key and deactivates it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    RateLimited,
    QuotaExceeded,
    Rejected,
}

impl ErrorClassification {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Rejected => "rejected",
        }
    }
}

/// Transport-level failure of one provider call.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("proxy returned HTTP {status}")]
    Status { status: u16, body: String },

    #[error("provider call timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// HTTP status from the proxy stage, if the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Timeout | FetchError::Transport(_) => None,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Status { .. } => "status",
            FetchError::Timeout => "timeout",
            FetchError::Transport(_) => "transport",
        }
    }
}

/// Everything one provider call needs. Secrets stay wrapped until the URL is built.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub image_url: &'a str,
    pub search_key: &'a Secret<String>,
    pub proxy_key: &'a Secret<String>,
}

/// The two-stage provider chain, treated as one network operation.
///
/// Implementations return the raw response body on a 2xx from the proxy and
/// leave payload interpretation to [`classify_payload`], since the search
/// provider's own failures arrive as 2xx error pages.
pub trait SearchBackend: Send + Sync {
    /// Identifier for logging (e.g. "proxied").
    fn id(&self) -> &str;

    fn fetch<'a>(
        &'a self,
        request: FetchRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, FetchError>> + Send + 'a>>;
}
