//! Reactivation sweep
//!
//! Puts parked keys back into rotation:
//! - SEARCH keys drained to zero come back once the grace window after their
//!   first lease has passed, with `first_leased_at` cleared
//! - PROXY keys whose timed suspension has run out come back
//! - once per calendar month every inactive PROXY key comes back; the first
//!   sweep against a store without a reset marker only records the baseline
//!
//! Reactivated PROXY keys past their fresh window drop to the standard tier.
//! Only inactive rows are examined, each under its own key lock, so a sweep
//! never touches a key that a live request is committing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use key_store::{ApiKey, KeyKind, KeyStore};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::locks::{LockTable, SWEEP_SCOPE, key_scope};
use crate::tier::QuotaPolicy;

/// Store marker holding the last calendar period (`YYYY-MM`) reset.
pub const PROXY_RESET_MARKER: &str = "proxy_reset_period";

pub struct Sweeper {
    store: Arc<dyn KeyStore>,
    locks: Arc<LockTable>,
    policy: QuotaPolicy,
}

impl Sweeper {
    pub fn new(store: Arc<dyn KeyStore>, locks: Arc<LockTable>, policy: QuotaPolicy) -> Self {
        Self {
            store,
            locks,
            policy,
        }
    }

    /// Run one pass. Returns how many keys were reactivated.
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let _sweep = self.locks.acquire(SWEEP_SCOPE).await;
        let period = now.format("%Y-%m").to_string();

        let (candidates, last_period) = {
            let mut tx = self.store.begin().await?;
            let mut inactive = tx.scan(KeyKind::Search, false).await?;
            inactive.extend(tx.scan(KeyKind::Proxy, false).await?);
            (inactive, tx.marker(PROXY_RESET_MARKER).await?)
        };
        // Without a marker there is no record of when the last reset ran, so
        // the current period becomes the baseline and the first reset waits
        // for the next month
        let calendar_due = last_period.as_deref().is_some_and(|last| last != period);

        let mut reactivated = 0usize;
        for candidate in candidates {
            let _guard = self.locks.acquire(&key_scope(&candidate.id)).await;
            let mut tx = self.store.begin().await?;

            // Re-read under the lock: a lease or commit may have moved it
            let Some(mut key) = tx.get(&candidate.id).await? else {
                continue;
            };
            let Some(reason) = self.reactivation_reason(&key, now, calendar_due) else {
                continue;
            };

            self.policy.reactivate(&mut key, now);
            tx.update(&key).await?;
            tx.commit().await?;

            info!(
                key_id = %key.id,
                kind = %key.kind,
                reason,
                quota_remaining = key.quota_remaining,
                fresh = key.is_fresh_allowance,
                "key reactivated"
            );
            metrics::counter!("keys_reactivated_total", "kind" => key.kind.label()).increment(1);
            reactivated += 1;
        }

        if last_period.as_deref() != Some(period.as_str()) {
            let mut tx = self.store.begin().await?;
            tx.set_marker(PROXY_RESET_MARKER, period.clone()).await?;
            tx.commit().await?;
            if calendar_due {
                info!(period, "monthly proxy reset recorded");
            } else {
                info!(period, "no previous proxy reset on record, baseline set");
            }
        }

        debug!(reactivated, "sweep finished");
        Ok(reactivated)
    }

    fn reactivation_reason(
        &self,
        key: &ApiKey,
        now: DateTime<Utc>,
        calendar_due: bool,
    ) -> Option<&'static str> {
        if key.is_active {
            return None;
        }
        match key.kind {
            KeyKind::Search => {
                let grace_over = key
                    .first_leased_at
                    .is_some_and(|first| self.policy.search_grace_over(first, now));
                (key.quota_remaining == 0 && grace_over).then_some("grace_elapsed")
            }
            KeyKind::Proxy if key.suspension_elapsed(now) => Some("suspension_elapsed"),
            KeyKind::Proxy if calendar_due => Some("monthly_reset"),
            KeyKind::Proxy => None,
        }
    }
}

/// Spawn a background task that sweeps every `interval`.
///
/// The first tick fires immediately so anything that fell due while the
/// service was down is picked up at startup. Failures are logged and the next
/// tick tries again.
pub fn spawn_sweep_task(sweeper: Arc<Sweeper>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep().await {
                warn!(error = %e, "scheduled sweep failed, will retry next tick");
            }
        }
    })
}
