//! Quota accounting after a provider call
//!
//! SEARCH keys mirror the provider's own remaining counter; the ledger never
//! decrements locally and never raises the stored value, so quota only goes up
//! through the sweeper. PROXY keys carry no per-call accounting; the ledger
//! only suspends them when the proxy signals rate limiting or quota exhaustion.
//!
//! Every mutation runs under the key's lock and inside one store transaction,
//! together with any usage records it belongs to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use key_store::{ApiKey, KeyKind, KeyStore, KeyTransaction, UsageRecord};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::locks::{LockTable, key_scope};
use crate::tier::QuotaPolicy;

/// Effect of one provider call on one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call went through. `remaining` is the provider-reported counter.
    Completed { remaining: Option<i64> },
    /// The key is considered broken: quota zeroed, deactivated.
    Rejected { cause: &'static str },
    /// Timed suspension for the configured delay.
    RateLimited,
    /// Suspended until the periodic reset.
    QuotaExceeded,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match *self {
            Outcome::Completed { .. } => "completed",
            Outcome::Rejected { cause } => cause,
            Outcome::RateLimited => "rate_limited",
            Outcome::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// One key's share of a settled request.
#[derive(Debug, Clone, Copy)]
pub struct Settlement<'a> {
    pub key_id: &'a str,
    pub kind: KeyKind,
    pub outcome: Outcome,
}

pub struct QuotaLedger {
    store: Arc<dyn KeyStore>,
    locks: Arc<LockTable>,
    policy: QuotaPolicy,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn KeyStore>, locks: Arc<LockTable>, policy: QuotaPolicy) -> Self {
        Self {
            store,
            locks,
            policy,
        }
    }

    /// Apply `outcome` to one key and return the stored result.
    pub async fn commit(&self, key_id: &str, kind: KeyKind, outcome: Outcome) -> Result<ApiKey> {
        self.commit_at(key_id, kind, outcome, Utc::now()).await
    }

    pub async fn commit_at(
        &self,
        key_id: &str,
        kind: KeyKind,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<ApiKey> {
        let _guard = self.locks.acquire(&key_scope(key_id)).await;
        let mut tx = self.store.begin().await?;
        let key = self.apply(&mut tx, key_id, kind, outcome, now).await?;
        tx.commit().await?;
        Ok(key)
    }

    /// Settle a successful request: apply every entry and record one usage
    /// row per key for `user_id`, all in a single transaction. If any entry
    /// fails nothing is written.
    pub async fn settle(&self, user_id: &str, entries: &[Settlement<'_>]) -> Result<Vec<ApiKey>> {
        self.settle_at(user_id, entries, Utc::now()).await
    }

    pub async fn settle_at(
        &self,
        user_id: &str,
        entries: &[Settlement<'_>],
        now: DateTime<Utc>,
    ) -> Result<Vec<ApiKey>> {
        let scopes: Vec<String> = entries.iter().map(|e| key_scope(e.key_id)).collect();
        let _guards = self.locks.acquire_many(&scopes).await;

        let mut tx = self.store.begin().await?;
        let mut settled = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = self
                .apply(&mut tx, entry.key_id, entry.kind, entry.outcome, now)
                .await?;
            tx.insert_usage(UsageRecord::new(user_id, entry.key_id, entry.kind, now))
                .await?;
            settled.push(key);
        }
        tx.commit().await?;
        Ok(settled)
    }

    async fn apply(
        &self,
        tx: &mut Box<dyn KeyTransaction>,
        key_id: &str,
        kind: KeyKind,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<ApiKey> {
        let Some(mut key) = tx.get(key_id).await? else {
            error!(key_id, kind = %kind, "leased key no longer exists");
            return Err(Error::KeyNotFound(key_id.to_string()));
        };
        if key.kind != kind {
            return Err(Error::KindMismatch {
                id: key.id,
                expected: kind,
                actual: key.kind,
            });
        }

        let before = key.clone();
        if let Some(cause) = apply_outcome(&mut key, outcome, &self.policy, now) {
            warn!(
                key_id,
                kind = %kind,
                cause,
                quota_remaining = key.quota_remaining,
                suspended_until = ?key.suspended_until,
                "key deactivated"
            );
            metrics::counter!("key_deactivations_total", "kind" => kind.label(), "cause" => cause)
                .increment(1);
        }

        if key != before {
            tx.update(&key).await?;
            key.revision += 1;
        }
        Ok(key)
    }
}

/// Mutate `key` for `outcome`. Returns the cause when an active key was
/// taken out of rotation.
fn apply_outcome(
    key: &mut ApiKey,
    outcome: Outcome,
    policy: &QuotaPolicy,
    now: DateTime<Utc>,
) -> Option<&'static str> {
    let was_active = key.is_active;

    match (key.kind, outcome) {
        (KeyKind::Search, Outcome::Completed { remaining }) => {
            if let Some(reported) = remaining {
                let reported = u32::try_from(reported.max(0)).unwrap_or(u32::MAX);
                key.quota_remaining = key.quota_remaining.min(reported);
            }
            key.is_active = key.quota_remaining > 0;
            return (was_active && !key.is_active).then_some("exhausted");
        }
        (KeyKind::Proxy, Outcome::Completed { .. }) => return None,
        (KeyKind::Search, other) => {
            key.quota_remaining = 0;
            key.is_active = false;
            key.suspended_until = None;
            return was_active.then_some(other.label());
        }
        (KeyKind::Proxy, Outcome::RateLimited) => {
            // Parked until the periodic reset already; a timed deadline would
            // bring it back early
            if !was_active && key.suspended_until.is_none() {
                return None;
            }
            let deadline = policy.rate_limit_deadline(now);
            key.is_active = false;
            key.suspended_until = Some(key.suspended_until.map_or(deadline, |d| d.max(deadline)));
        }
        (KeyKind::Proxy, Outcome::QuotaExceeded | Outcome::Rejected { .. }) => {
            key.is_active = false;
            key.suspended_until = None;
        }
    }

    was_active.then_some(outcome.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use key_store::FileKeyStore;

    async fn test_store(dir: &tempfile::TempDir, keys: &[ApiKey]) -> Arc<FileKeyStore> {
        let store = FileKeyStore::load(dir.path().join("keys.json")).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        for key in keys {
            tx.insert(key.clone()).await.unwrap();
        }
        tx.commit().await.unwrap();
        Arc::new(store)
    }

    fn test_ledger(store: Arc<FileKeyStore>) -> QuotaLedger {
        QuotaLedger::new(store, Arc::new(LockTable::new()), QuotaPolicy::default())
    }

    fn completed(remaining: i64) -> Outcome {
        Outcome::Completed {
            remaining: Some(remaining),
        }
    }

    #[tokio::test]
    async fn search_mirrors_reported_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Search, "s".into(), 100, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        let updated = ledger
            .commit(&key.id, KeyKind::Search, completed(87))
            .await
            .unwrap();
        assert_eq!(updated.quota_remaining, 87);
        assert!(updated.is_active);
        assert_eq!(store.get(&key.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn search_reaching_zero_is_deactivated() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Search, "s".into(), 1, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        ledger
            .commit(&key.id, KeyKind::Search, completed(0))
            .await
            .unwrap();
        let stored = store.get(&key.id).await.unwrap();
        assert_eq!(stored.quota_remaining, 0);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn search_quota_never_rises_or_goes_negative() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Search, "s".into(), 50, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        let up = ledger
            .commit(&key.id, KeyKind::Search, completed(90))
            .await
            .unwrap();
        assert_eq!(up.quota_remaining, 50);
        assert_eq!(up.revision, 0, "unchanged key is not rewritten");

        let negative = ledger
            .commit(&key.id, KeyKind::Search, completed(-3))
            .await
            .unwrap();
        assert_eq!(negative.quota_remaining, 0);
        assert!(!negative.is_active);
    }

    #[tokio::test]
    async fn search_without_report_keeps_quota() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Search, "s".into(), 12, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store);

        let updated = ledger
            .commit(&key.id, KeyKind::Search, Outcome::Completed { remaining: None })
            .await
            .unwrap();
        assert_eq!(updated.quota_remaining, 12);
        assert!(updated.is_active);
    }

    #[tokio::test]
    async fn rejected_search_key_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Search, "s".into(), 70, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        ledger
            .commit(
                &key.id,
                KeyKind::Search,
                Outcome::Rejected {
                    cause: "provider_error",
                },
            )
            .await
            .unwrap();
        let stored = store.get(&key.id).await.unwrap();
        assert_eq!(stored.quota_remaining, 0);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn rate_limited_proxy_gets_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        let now = Utc::now();
        ledger
            .commit_at(&key.id, KeyKind::Proxy, Outcome::RateLimited, now)
            .await
            .unwrap();
        let stored = store.get(&key.id).await.unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.suspended_until, Some(now + TimeDelta::seconds(60)));
        assert_eq!(stored.quota_remaining, 1000, "proxy quota untouched");
    }

    #[tokio::test]
    async fn quota_exceeded_proxy_waits_for_sweeper() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        ledger
            .commit(&key.id, KeyKind::Proxy, Outcome::QuotaExceeded)
            .await
            .unwrap();
        let stored = store.get(&key.id).await.unwrap();
        assert!(!stored.is_active);
        assert!(stored.suspended_until.is_none());
    }

    #[tokio::test]
    async fn rate_limit_never_shortens_quota_exceeded_suspension() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());
        let now = Utc::now();

        // Two requests shared the lease: one saw 403, the other 429 afterwards
        ledger
            .commit_at(&key.id, KeyKind::Proxy, Outcome::QuotaExceeded, now)
            .await
            .unwrap();
        ledger
            .commit_at(&key.id, KeyKind::Proxy, Outcome::RateLimited, now)
            .await
            .unwrap();

        let stored = store.get(&key.id).await.unwrap();
        assert!(!stored.is_active);
        assert!(stored.suspended_until.is_none(), "still waits for the reset");

        let pool = crate::KeyPool::new(store, Arc::new(LockTable::new()), QuotaPolicy::default());
        let leased = pool
            .lease_at(KeyKind::Proxy, now + TimeDelta::seconds(61))
            .await
            .unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn repeated_rate_limit_keeps_later_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());
        let now = Utc::now();

        ledger
            .commit_at(&key.id, KeyKind::Proxy, Outcome::RateLimited, now + TimeDelta::seconds(30))
            .await
            .unwrap();
        ledger
            .commit_at(&key.id, KeyKind::Proxy, Outcome::RateLimited, now)
            .await
            .unwrap();

        let stored = store.get(&key.id).await.unwrap();
        assert_eq!(stored.suspended_until, Some(now + TimeDelta::seconds(90)));
    }

    #[tokio::test]
    async fn proxy_success_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = test_ledger(store.clone());

        ledger
            .commit(&key.id, KeyKind::Proxy, completed(5))
            .await
            .unwrap();
        assert_eq!(store.get(&key.id).await.unwrap(), key);
    }

    #[tokio::test]
    async fn vanished_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = test_ledger(test_store(&dir, &[]).await);

        let err = ledger
            .commit("gone", KeyKind::Search, completed(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(id) if id == "gone"));
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let ledger = test_ledger(test_store(&dir, &[key.clone()]).await);

        let err = ledger
            .commit(&key.id, KeyKind::Search, completed(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KindMismatch { .. }));
    }

    #[tokio::test]
    async fn settle_writes_keys_and_usage_together() {
        let dir = tempfile::tempdir().unwrap();
        let search = ApiKey::new(KeyKind::Search, "s".into(), 100, false);
        let proxy = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let store = test_store(&dir, &[search.clone(), proxy.clone()]).await;
        let ledger = test_ledger(store.clone());

        let settled = ledger
            .settle(
                "user-1",
                &[
                    Settlement {
                        key_id: &search.id,
                        kind: KeyKind::Search,
                        outcome: completed(64),
                    },
                    Settlement {
                        key_id: &proxy.id,
                        kind: KeyKind::Proxy,
                        outcome: Outcome::Completed { remaining: None },
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(settled[0].quota_remaining, 64);

        let mut tx = store.begin().await.unwrap();
        let usage = tx.usage_since(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(usage.len(), 2);
        assert!(usage.iter().all(|u| u.user_id == "user-1"));
        assert_eq!(usage[0].key_id, search.id);
        assert_eq!(usage[1].kind, KeyKind::Proxy);
    }

    #[tokio::test]
    async fn failed_settle_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let search = ApiKey::new(KeyKind::Search, "s".into(), 100, false);
        let store = test_store(&dir, &[search.clone()]).await;
        let ledger = test_ledger(store.clone());

        let err = ledger
            .settle(
                "user-1",
                &[
                    Settlement {
                        key_id: &search.id,
                        kind: KeyKind::Search,
                        outcome: completed(10),
                    },
                    Settlement {
                        key_id: "missing-proxy",
                        kind: KeyKind::Proxy,
                        outcome: Outcome::Completed { remaining: None },
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(_)));

        assert_eq!(store.get(&search.id).await.unwrap().quota_remaining, 100);
        let mut tx = store.begin().await.unwrap();
        assert!(tx.usage_since(DateTime::<Utc>::MIN_UTC).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_commits_serialize_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Search, "s".into(), 100, false);
        let store = test_store(&dir, &[key.clone()]).await;
        let ledger = Arc::new(test_ledger(store.clone()));

        let mut handles = Vec::new();
        for reported in 80..100 {
            let ledger = ledger.clone();
            let id = key.id.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .commit(&id, KeyKind::Search, completed(reported))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stored = store.get(&key.id).await.unwrap();
        assert_eq!(stored.quota_remaining, 80);
        assert!(stored.is_active);
    }

    #[test]
    fn deactivation_cause_only_reported_for_active_keys() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();

        let mut key = ApiKey::new(KeyKind::Search, "s".into(), 5, false);
        assert_eq!(
            apply_outcome(&mut key, Outcome::Rejected { cause: "unstructured" }, &policy, now),
            Some("unstructured")
        );
        assert_eq!(
            apply_outcome(&mut key, Outcome::Rejected { cause: "unstructured" }, &policy, now),
            None,
            "already inactive"
        );
    }

    #[tokio::test]
    async fn deactivation_is_counted() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let dir = tempfile::tempdir().unwrap();
        let key = ApiKey::new(KeyKind::Proxy, "p".into(), 1000, false);
        let ledger = test_ledger(test_store(&dir, &[key.clone()]).await);
        ledger
            .commit(&key.id, KeyKind::Proxy, Outcome::QuotaExceeded)
            .await
            .unwrap();

        let output = handle.render();
        assert!(output.contains("key_deactivations_total"));
        assert!(output.contains("cause=\"quota_exceeded\""));
        assert!(output.contains("kind=\"PROXY\""));
    }
}
