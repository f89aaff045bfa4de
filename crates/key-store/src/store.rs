//! Storage contract consumed by the pool, ledger and sweeper
//!
//! Uses `Pin<Box<dyn Future>>` return types so both traits stay dyn-compatible
//! (`Arc<dyn KeyStore>`, `Box<dyn KeyTransaction>`).

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{ApiKey, KeyKind, UsageRecord, UserRecord};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A transactional record store holding keys, users, usage records and markers.
pub trait KeyStore: Send + Sync {
    /// Open a transaction. Writes become visible to other transactions only
    /// after `commit`.
    fn begin(&self) -> StoreFuture<'_, Box<dyn KeyTransaction>>;
}

/// One unit of work against the store.
///
/// A single-process store may serialize transactions entirely; a shared
/// relational store relies on `update` being a conditional write so that
/// concurrent processes cannot silently overwrite each other.
pub trait KeyTransaction: Send {
    /// Point lookup by id.
    fn get<'a>(&'a mut self, id: &'a str) -> StoreFuture<'a, Option<ApiKey>>;

    /// All keys of `kind` whose `is_active` equals `active`.
    fn scan(&mut self, kind: KeyKind, active: bool) -> StoreFuture<'_, Vec<ApiKey>>;

    /// Every key, both kinds, any state.
    fn all(&mut self) -> StoreFuture<'_, Vec<ApiKey>>;

    /// Insert a new key. Fails with `Duplicate` if the id is taken.
    fn insert(&mut self, key: ApiKey) -> StoreFuture<'_, ()>;

    /// Conditional single-row update.
    ///
    /// Succeeds only if the stored row still carries `key.revision`; the
    /// stored revision is then incremented. Fails with `NotFound` if the row
    /// is gone and `Conflict` if someone else wrote it first.
    fn update<'a>(&'a mut self, key: &'a ApiKey) -> StoreFuture<'a, ()>;

    /// Append an audit record.
    fn insert_usage(&mut self, record: UsageRecord) -> StoreFuture<'_, ()>;

    /// Usage records at or after `since`, oldest first.
    ///
    /// Stores may move records out of the live set after a retention window;
    /// callers only ask about recent activity.
    fn usage_since(&mut self, since: DateTime<Utc>) -> StoreFuture<'_, Vec<UsageRecord>>;

    /// Point lookup of a user.
    fn user<'a>(&'a mut self, id: &'a str) -> StoreFuture<'a, Option<UserRecord>>;

    /// Insert or replace a user.
    fn put_user(&mut self, user: UserRecord) -> StoreFuture<'_, ()>;

    /// Number of users created at or after `since`.
    fn new_users_since(&mut self, since: DateTime<Utc>) -> StoreFuture<'_, usize>;

    /// Read a named marker value.
    fn marker<'a>(&'a mut self, name: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Write a named marker value.
    fn set_marker(&mut self, name: &str, value: String) -> StoreFuture<'_, ()>;

    /// Publish all writes atomically.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;
}
