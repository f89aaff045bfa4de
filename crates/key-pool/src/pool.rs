//! Key selection
//!
//! Leasing reads the eligible keys of one kind and picks one uniformly at
//! random. Keys are interchangeable, so random choice spreads load without any
//! coordination between callers. The kind lock is held only for the
//! read-then-write of lease bookkeeping, never across the provider call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::Secret;
use key_store::{ApiKey, KeyKind, KeyStore};
use rand::RngExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::locks::{LockTable, kind_scope};
use crate::tier::QuotaPolicy;

/// A key handed out for one request.
#[derive(Debug, Clone)]
pub struct LeasedKey {
    pub id: String,
    pub kind: KeyKind,
    pub secret: Secret<String>,
    pub quota_remaining: u32,
    /// True when this lease stamped `first_leased_at`.
    pub first_lease: bool,
}

pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    locks: Arc<LockTable>,
    policy: QuotaPolicy,
}

impl KeyPool {
    pub fn new(store: Arc<dyn KeyStore>, locks: Arc<LockTable>, policy: QuotaPolicy) -> Self {
        Self {
            store,
            locks,
            policy,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub(crate) fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub(crate) fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Lease one eligible key of `kind`, or `None` when the pool is exhausted.
    pub async fn lease(&self, kind: KeyKind) -> Result<Option<LeasedKey>> {
        self.lease_at(kind, Utc::now()).await
    }

    /// Eligible means active (with quota left, for SEARCH), or inactive with an
    /// elapsed timed suspension. A suspended key picked here is revived in the
    /// same transaction.
    pub async fn lease_at(&self, kind: KeyKind, now: DateTime<Utc>) -> Result<Option<LeasedKey>> {
        let _guard = self.locks.acquire(&kind_scope(kind)).await;
        let mut tx = self.store.begin().await?;

        let mut candidates: Vec<ApiKey> = tx
            .scan(kind, true)
            .await?
            .into_iter()
            .filter(|key| {
                let usable = kind != KeyKind::Search || key.quota_remaining > 0;
                if !usable {
                    debug!(key_id = %key.id, kind = %kind, "skipping active key with no quota");
                }
                usable
            })
            .collect();
        candidates.extend(
            tx.scan(kind, false)
                .await?
                .into_iter()
                .filter(|key| key.suspension_elapsed(now)),
        );

        if candidates.is_empty() {
            debug!(kind = %kind, "no eligible key");
            return Ok(None);
        }

        let index = rand::rng().random_range(0..candidates.len());
        let mut key = candidates.swap_remove(index);
        let mut changed = false;

        if !key.is_active {
            key.is_active = true;
            key.suspended_until = None;
            changed = true;
            info!(key_id = %key.id, kind = %kind, "suspension elapsed, key back in rotation");
        }

        let first_lease = key.first_leased_at.is_none();
        if first_lease {
            key.first_leased_at = Some(now);
            changed = true;
        }

        if changed {
            tx.update(&key).await?;
            tx.commit().await?;
        }

        debug!(key_id = %key.id, kind = %kind, first_lease, "key leased");
        Ok(Some(LeasedKey {
            id: key.id,
            kind,
            secret: key.secret.into(),
            quota_remaining: key.quota_remaining,
            first_lease,
        }))
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: every key usable → healthy, at least one usable key of
    /// each kind → degraded, any kind with none → unhealthy.
    pub async fn health(&self) -> Result<serde_json::Value> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let keys = tx.all().await?;
        drop(tx);

        let mut kinds = serde_json::Map::new();
        let mut all_usable = true;
        let mut every_kind_usable = true;

        for kind in KeyKind::ALL {
            let of_kind: Vec<&ApiKey> = keys.iter().filter(|k| k.kind == kind).collect();
            let usable = of_kind
                .iter()
                .filter(|k| is_usable(k, now))
                .count();
            let suspended = of_kind
                .iter()
                .filter(|k| !k.is_active && k.suspended_until.is_some())
                .count();
            let inactive = of_kind.iter().filter(|k| !k.is_active).count();
            let quota: u64 = of_kind
                .iter()
                .filter(|k| k.is_active)
                .map(|k| u64::from(k.quota_remaining))
                .sum();

            all_usable &= usable == of_kind.len();
            every_kind_usable &= usable > 0;

            kinds.insert(
                kind.label().to_string(),
                serde_json::json!({
                    "keys_total": of_kind.len(),
                    "keys_usable": usable,
                    "keys_inactive": inactive,
                    "keys_suspended": suspended,
                    "quota_remaining": quota,
                }),
            );
        }

        let status = if !every_kind_usable {
            "unhealthy"
        } else if all_usable {
            "healthy"
        } else {
            "degraded"
        };

        Ok(serde_json::json!({
            "status": status,
            "kinds": kinds,
        }))
    }
}

/// Whether `lease` could hand out this key at `now`.
fn is_usable(key: &ApiKey, now: DateTime<Utc>) -> bool {
    if key.suspension_elapsed(now) {
        return true;
    }
    key.is_active && (key.kind != KeyKind::Search || key.quota_remaining > 0)
}
