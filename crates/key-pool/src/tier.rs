//! Quota tiers and timing policy

use chrono::{DateTime, Months, TimeDelta, Utc};
use key_store::{ApiKey, KeyKind};

/// Quota amounts and timing windows shared by pool, ledger and sweeper.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    /// Allowance a SEARCH key is reset to.
    pub search_quota: u32,
    /// Monthly allowance of a PROXY key past its fresh window.
    pub proxy_standard_quota: u32,
    /// Monthly allowance of a PROXY key inside its fresh window.
    pub proxy_fresh_quota: u32,
    /// Calendar months after creation during which the fresh tier applies.
    pub fresh_window_months: u32,
    /// How long after first lease an exhausted SEARCH key stays parked.
    pub search_grace: TimeDelta,
    /// How long a rate-limited PROXY key is suspended.
    pub rate_limit_delay: TimeDelta,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            search_quota: 100,
            proxy_standard_quota: 1000,
            proxy_fresh_quota: 5000,
            fresh_window_months: 1,
            search_grace: TimeDelta::hours(24),
            rate_limit_delay: TimeDelta::seconds(60),
        }
    }
}

impl QuotaPolicy {
    /// Starting quota for a key created now.
    pub fn initial_quota(&self, kind: KeyKind, fresh: bool) -> u32 {
        match kind {
            KeyKind::Search => self.search_quota,
            KeyKind::Proxy if fresh => self.proxy_fresh_quota,
            KeyKind::Proxy => self.proxy_standard_quota,
        }
    }

    /// Whether a key created at `created_at` is still inside its fresh window.
    pub fn fresh_window_open(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        created_at
            .checked_add_months(Months::new(self.fresh_window_months))
            .is_some_and(|end| now < end)
    }

    /// Tier a key is entitled to at `now`: (quota, still fresh).
    ///
    /// A PROXY key whose fresh window has lapsed drops to the standard tier.
    pub fn tier_for(&self, key: &ApiKey, now: DateTime<Utc>) -> (u32, bool) {
        match key.kind {
            KeyKind::Search => (self.search_quota, key.is_fresh_allowance),
            KeyKind::Proxy => {
                let fresh = key.is_fresh_allowance && self.fresh_window_open(key.created_at, now);
                (self.initial_quota(KeyKind::Proxy, fresh), fresh)
            }
        }
    }

    /// When a PROXY key rate-limited at `now` becomes eligible again.
    pub fn rate_limit_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.rate_limit_delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the grace window after a SEARCH key's first lease has passed.
    pub fn search_grace_over(&self, first_leased_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        first_leased_at
            .checked_add_signed(self.search_grace)
            .is_some_and(|end| end <= now)
    }

    /// Put `key` back into rotation with its current tier quota.
    pub fn reactivate(&self, key: &mut ApiKey, now: DateTime<Utc>) {
        let (quota, fresh) = self.tier_for(key, now);
        key.is_active = true;
        key.quota_remaining = quota;
        key.is_fresh_allowance = fresh;
        key.suspended_until = None;
        if key.kind == KeyKind::Search {
            key.first_leased_at = None;
        }
    }
}
