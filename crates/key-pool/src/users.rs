//! End users: daily search limit and service level
//!
//! Ordinary users get a fixed number of searches per UTC day, counted from
//! the SEARCH usage rows the ledger writes on every settled request. Premium
//! and admin users are never limited. The admission holds the user's lock for
//! as long as it lives, so one user's searches run one at a time and the count
//! cannot be raced past the limit.

use chrono::{DateTime, NaiveTime, Utc};
use key_store::{KeyKind, UserRecord, UserStatus};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::locks::{ScopeGuard, user_scope};
use crate::pool::KeyPool;

/// Permission to run one search. Keep it alive until the request is settled.
pub struct Admission {
    pub status: UserStatus,
    /// Searches already settled today, before this one.
    pub used_today: u32,
    /// `None` for users the limit does not apply to.
    pub daily_limit: Option<u32>,
    _guard: ScopeGuard,
}

impl Admission {
    /// Searches left today including this one, for limited users.
    pub fn left_today(&self) -> Option<u32> {
        self.daily_limit
            .map(|limit| limit.saturating_sub(self.used_today))
    }
}

/// A user as shown to admins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub id: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

impl From<UserRecord> for UserSummary {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            status: user.status,
            created_at: user.created_at,
        }
    }
}

/// Midnight UTC of the day `now` falls in.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl KeyPool {
    /// Admit `user_id` for one search, creating the user on first contact.
    pub async fn admit(&self, user_id: &str, daily_limit: u32) -> Result<Admission> {
        self.admit_at(user_id, daily_limit, Utc::now()).await
    }

    pub async fn admit_at(
        &self,
        user_id: &str,
        daily_limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::EmptyUserId);
        }
        let guard = self.locks().acquire(&user_scope(user_id)).await;
        let mut tx = self.store().begin().await?;

        let status = match tx.user(user_id).await? {
            Some(user) => user.status,
            None => {
                tx.put_user(UserRecord::new(user_id, now)).await?;
                tx.commit().await?;
                info!(user_id, "new user");
                return Ok(Admission {
                    status: UserStatus::Ordinary,
                    used_today: 0,
                    daily_limit: Some(daily_limit),
                    _guard: guard,
                });
            }
        };

        if !status.is_capped() {
            return Ok(Admission {
                status,
                used_today: 0,
                daily_limit: None,
                _guard: guard,
            });
        }

        let used = tx
            .usage_since(start_of_day(now))
            .await?
            .iter()
            .filter(|u| u.user_id == user_id && u.kind == KeyKind::Search)
            .count();
        let used_today = u32::try_from(used).unwrap_or(u32::MAX);
        if used_today >= daily_limit {
            debug!(user_id, used_today, daily_limit, "daily limit reached");
            return Err(Error::DailyLimitReached { limit: daily_limit });
        }

        Ok(Admission {
            status,
            used_today,
            daily_limit: Some(daily_limit),
            _guard: guard,
        })
    }

    /// Set a user's service level. Unknown users are created with it.
    pub async fn set_user_status(&self, user_id: &str, status: UserStatus) -> Result<UserSummary> {
        self.set_user_status_at(user_id, status, Utc::now()).await
    }

    pub async fn set_user_status_at(
        &self,
        user_id: &str,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Result<UserSummary> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::EmptyUserId);
        }
        let _guard = self.locks().acquire(&user_scope(user_id)).await;
        let mut tx = self.store().begin().await?;

        let mut user = tx
            .user(user_id)
            .await?
            .unwrap_or_else(|| UserRecord::new(user_id, now));
        let previous = user.status;
        user.status = status;
        tx.put_user(user.clone()).await?;
        tx.commit().await?;

        info!(user_id, from = %previous, to = %status, "user status changed");
        Ok(UserSummary::from(user))
    }
}
