//! Prometheus metrics exposition
//!
//! Service-level series recorded here:
//!
//! - `search_requests_total` (counter): label `outcome`
//! - `search_duration_seconds` (histogram): label `outcome`
//! - `search_attempts_total` (counter): label `result`
//!
//! `key_deactivations_total` and `keys_reactivated_total` are recorded by the
//! key-pool crate through the same global recorder.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 50ms to 60s: one search makes up to three provider
/// calls, each bounded by the provider timeout.
const DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("search_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished search with its terminal outcome label.
pub fn record_search(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("search_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("search_duration_seconds", "outcome" => outcome).record(duration_secs);
}

/// Record one provider attempt and how it ended.
pub fn record_attempt(result: &'static str) {
    metrics::counter!("search_attempts_total", "result" => result).increment(1);
}

/// In-process counters reported by the health endpoint.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}
