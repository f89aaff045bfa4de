//! Administrative view of the pool: adding keys, listing them, usage stats

use chrono::{DateTime, Utc};
use key_store::{ApiKey, KeyKind};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::pool::KeyPool;
use crate::users::start_of_day;

/// A key as shown to admins. Never carries the secret.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub id: String,
    pub kind: KeyKind,
    pub fingerprint: String,
    pub quota_remaining: u32,
    pub is_active: bool,
    pub is_fresh_allowance: bool,
    pub first_leased_at: Option<DateTime<Utc>>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&ApiKey> for KeySummary {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.clone(),
            kind: key.kind,
            fingerprint: key.fingerprint(),
            quota_remaining: key.quota_remaining,
            is_active: key.is_active,
            is_fresh_allowance: key.is_fresh_allowance,
            first_leased_at: key.first_leased_at,
            suspended_until: key.suspended_until,
            created_at: key.created_at,
        }
    }
}

/// Usage today and what the active keys can still serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Usage records since midnight UTC.
    pub usage_today: usize,
    /// Users first seen since midnight UTC.
    pub new_users_today: usize,
    /// Sum of remaining SEARCH quota over active keys.
    pub search_quota_remaining: u64,
    /// Sum of the monthly tier allowance over active PROXY keys.
    pub proxy_quota_remaining: u64,
    pub search_keys_active: usize,
    pub proxy_keys_active: usize,
}

impl KeyPool {
    /// Store a new active key at its tier's starting quota.
    ///
    /// Rejects a secret already registered for the same kind.
    pub async fn add_key(&self, kind: KeyKind, secret: &str, fresh: bool) -> Result<KeySummary> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(Error::EmptySecret);
        }

        let quota = self.policy().initial_quota(kind, fresh);
        let key = ApiKey::new(kind, secret.to_string(), quota, fresh);

        let mut tx = self.store().begin().await?;
        let fingerprint = key.fingerprint();
        if tx
            .all()
            .await?
            .iter()
            .any(|k| k.kind == kind && k.fingerprint() == fingerprint)
        {
            return Err(Error::DuplicateSecret(kind));
        }
        tx.insert(key.clone()).await?;
        tx.commit().await?;

        info!(key_id = %key.id, kind = %kind, fingerprint = %fingerprint, quota, fresh, "key added");
        Ok(KeySummary::from(&key))
    }

    /// Every key, both kinds, oldest first.
    pub async fn list(&self) -> Result<Vec<KeySummary>> {
        let mut tx = self.store().begin().await?;
        let mut keys = tx.all().await?;
        keys.sort_by_key(|k| k.created_at);
        Ok(keys.iter().map(KeySummary::from).collect())
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.stats_at(Utc::now()).await
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<PoolStats> {
        let today = start_of_day(now);
        let mut tx = self.store().begin().await?;
        let keys = tx.all().await?;
        let usage_today = tx
            .usage_since(today)
            .await?
            .iter()
            .filter(|u| u.timestamp.date_naive() == today.date_naive())
            .count();
        let new_users_today = tx.new_users_since(today).await?;
        drop(tx);

        let mut stats = PoolStats {
            usage_today,
            new_users_today,
            search_quota_remaining: 0,
            proxy_quota_remaining: 0,
            search_keys_active: 0,
            proxy_keys_active: 0,
        };
        for key in keys.iter().filter(|k| k.is_active) {
            match key.kind {
                KeyKind::Search => {
                    stats.search_keys_active += 1;
                    stats.search_quota_remaining += u64::from(key.quota_remaining);
                }
                KeyKind::Proxy => {
                    stats.proxy_keys_active += 1;
                    let (allowance, _) = self.policy().tier_for(key, now);
                    stats.proxy_quota_remaining += u64::from(allowance);
                }
            }
        }
        Ok(stats)
    }
}
