//! Classification of proxy-stage failures
//!
//! The proxy reports its own limits through HTTP status codes, independent of
//! whatever the wrapped search call returned. 429 means the proxy key is being
//! rate limited, 403 means its monthly allowance is spent. Anything else
//! (other statuses, timeouts, connection failures) is blamed on the SEARCH key.

use key_store::KeyKind;
use provider::{ErrorClassification, FetchError};

use crate::ledger::Outcome;

/// Classify a non-success HTTP status from the proxy stage.
pub fn classify_proxy_status(status: u16) -> ErrorClassification {
    match status {
        429 => ErrorClassification::RateLimited,
        403 => ErrorClassification::QuotaExceeded,
        _ => ErrorClassification::Rejected,
    }
}

/// Classify a failed provider call. Failures without a status follow the
/// "other" path.
pub fn classify_fetch_error(err: &FetchError) -> ErrorClassification {
    match err.status() {
        Some(status) => classify_proxy_status(status),
        None => ErrorClassification::Rejected,
    }
}

/// Which key pays for a classified failure, and how.
pub fn penalty(classification: ErrorClassification) -> (KeyKind, Outcome) {
    match classification {
        ErrorClassification::RateLimited => (KeyKind::Proxy, Outcome::RateLimited),
        ErrorClassification::QuotaExceeded => (KeyKind::Proxy, Outcome::QuotaExceeded),
        ErrorClassification::Rejected => (
            KeyKind::Search,
            Outcome::Rejected {
                cause: "proxy_failure",
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_quota_codes() {
        assert_eq!(classify_proxy_status(429), ErrorClassification::RateLimited);
        assert_eq!(classify_proxy_status(403), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn other_codes_are_rejected() {
        for status in [400, 401, 404, 500, 502, 503] {
            assert_eq!(
                classify_proxy_status(status),
                ErrorClassification::Rejected,
                "status {status}"
            );
        }
    }

    #[test]
    fn statusless_failures_are_rejected() {
        assert_eq!(
            classify_fetch_error(&FetchError::Timeout),
            ErrorClassification::Rejected
        );
        assert_eq!(
            classify_fetch_error(&FetchError::Transport("refused".into())),
            ErrorClassification::Rejected
        );
        assert_eq!(
            classify_fetch_error(&FetchError::Status {
                status: 429,
                body: String::new()
            }),
            ErrorClassification::RateLimited
        );
    }

    #[test]
    fn penalties_target_the_right_kind() {
        assert_eq!(
            penalty(ErrorClassification::RateLimited),
            (KeyKind::Proxy, Outcome::RateLimited)
        );
        assert_eq!(
            penalty(ErrorClassification::QuotaExceeded),
            (KeyKind::Proxy, Outcome::QuotaExceeded)
        );
        assert_eq!(penalty(ErrorClassification::Rejected).0, KeyKind::Search);
    }
}
