//! JSON file backed key store
//!
//! Keeps one JSON document (keys, users, recent usage, markers) in memory and
//! on disk. A transaction holds the document's tokio Mutex for its whole
//! lifetime and works on a private copy, so transactions are fully serialized
//! within the process. Commits use atomic temp-file + rename so a crash
//! mid-write never leaves a torn file behind.
//!
//! Usage records stay in the document only for a retention window measured
//! back from the newest record. Older ones are appended to a JSON-lines
//! archive next to the store (`keys.json` → `keys.usage.jsonl`) during the
//! commit that pushes them out, so the document rewritten on every commit
//! stays proportional to recent traffic. Archiving happens before the
//! document is replaced: a failed write can leave a record in both places,
//! never in neither.
//!
//! This backend is single-process. Running several service instances against
//! shared storage needs a relational backend whose `update` is a real
//! conditional write (`UPDATE .. WHERE id = ? AND revision = ?`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{ApiKey, KeyKind, UsageRecord, UserRecord};
use crate::store::{KeyStore, KeyTransaction, StoreFuture};

/// Default live usage window. Long enough to cover the whole current UTC day.
pub const DEFAULT_USAGE_RETENTION_HOURS: i64 = 48;

/// On-disk document layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    keys: BTreeMap<String, ApiKey>,
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
    #[serde(default)]
    usage: Vec<UsageRecord>,
    #[serde(default)]
    markers: BTreeMap<String, String>,
}

impl Document {
    /// Remove and return usage records older than `retention` before the
    /// newest record.
    fn expire_usage(&mut self, retention: TimeDelta) -> Vec<UsageRecord> {
        let Some(newest) = self.usage.iter().map(|u| u.timestamp).max() else {
            return Vec::new();
        };
        let Some(cutoff) = newest.checked_sub_signed(retention) else {
            return Vec::new();
        };
        if self.usage.iter().all(|u| u.timestamp >= cutoff) {
            return Vec::new();
        }

        let (live, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut self.usage)
            .into_iter()
            .partition(|u| u.timestamp >= cutoff);
        self.usage = live;
        expired
    }
}

/// Key store persisted as a single JSON file plus a usage archive.
pub struct FileKeyStore {
    path: PathBuf,
    archive_path: PathBuf,
    usage_retention: TimeDelta,
    state: Arc<Mutex<Document>>,
}

impl FileKeyStore {
    /// Load the store from `path`.
    ///
    /// A missing file is created as an empty document (cold start with zero
    /// keys); keys are then added through the admin API.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let document = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading key store: {e}")))?;
            let document: Document = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing key store: {e}")))?;
            info!(
                path = %path.display(),
                keys = document.keys.len(),
                users = document.users.len(),
                usage_records = document.usage.len(),
                "loaded key store"
            );
            document
        } else {
            info!(path = %path.display(), "key store not found, starting empty");
            let document = Document::default();
            write_atomic(&path, &document).await?;
            document
        };

        Ok(Self {
            archive_path: path.with_extension("usage.jsonl"),
            path,
            usage_retention: TimeDelta::hours(DEFAULT_USAGE_RETENTION_HOURS),
            state: Arc::new(Mutex::new(document)),
        })
    }

    /// Override how long usage records stay in the live document.
    pub fn with_usage_retention(mut self, retention: TimeDelta) -> Self {
        self.usage_retention = retention;
        self
    }

    /// JSON-lines file receiving usage records past the retention window.
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Clone of one key as currently committed.
    pub async fn get(&self, id: &str) -> Option<ApiKey> {
        self.state.lock().await.keys.get(id).cloned()
    }

    /// Clone of one user as currently committed.
    pub async fn user(&self, id: &str) -> Option<UserRecord> {
        self.state.lock().await.users.get(id).cloned()
    }

    /// Clone of every committed key.
    pub async fn keys(&self) -> Vec<ApiKey> {
        self.state.lock().await.keys.values().cloned().collect()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KeyStore for FileKeyStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn KeyTransaction>> {
        Box::pin(async move {
            let guard = self.state.clone().lock_owned().await;
            let working = guard.clone();
            let tx: Box<dyn KeyTransaction> = Box::new(FileTransaction {
                path: self.path.clone(),
                archive_path: self.archive_path.clone(),
                usage_retention: self.usage_retention,
                guard,
                working,
                dirty: false,
            });
            Ok(tx)
        })
    }
}

/// Open transaction on a [`FileKeyStore`]. Dropping it rolls back.
struct FileTransaction {
    path: PathBuf,
    archive_path: PathBuf,
    usage_retention: TimeDelta,
    guard: OwnedMutexGuard<Document>,
    working: Document,
    dirty: bool,
}

impl FileTransaction {
    fn apply_insert(&mut self, key: ApiKey) -> Result<()> {
        if self.working.keys.contains_key(&key.id) {
            return Err(Error::Duplicate(key.id));
        }
        self.working.keys.insert(key.id.clone(), key);
        self.dirty = true;
        Ok(())
    }

    fn apply_update(&mut self, key: &ApiKey) -> Result<()> {
        let stored = self
            .working
            .keys
            .get_mut(&key.id)
            .ok_or_else(|| Error::NotFound(key.id.clone()))?;
        if stored.revision != key.revision {
            return Err(Error::Conflict {
                id: key.id.clone(),
                expected: key.revision,
                found: stored.revision,
            });
        }
        let mut next = key.clone();
        next.revision = key.revision + 1;
        *stored = next;
        self.dirty = true;
        Ok(())
    }
}

impl KeyTransaction for FileTransaction {
    fn get<'a>(&'a mut self, id: &'a str) -> StoreFuture<'a, Option<ApiKey>> {
        let found = self.working.keys.get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn scan(&mut self, kind: KeyKind, active: bool) -> StoreFuture<'_, Vec<ApiKey>> {
        let keys: Vec<ApiKey> = self
            .working
            .keys
            .values()
            .filter(|k| k.kind == kind && k.is_active == active)
            .cloned()
            .collect();
        Box::pin(async move { Ok(keys) })
    }

    fn all(&mut self) -> StoreFuture<'_, Vec<ApiKey>> {
        let keys: Vec<ApiKey> = self.working.keys.values().cloned().collect();
        Box::pin(async move { Ok(keys) })
    }

    fn insert(&mut self, key: ApiKey) -> StoreFuture<'_, ()> {
        let result = self.apply_insert(key);
        Box::pin(std::future::ready(result))
    }

    fn update<'a>(&'a mut self, key: &'a ApiKey) -> StoreFuture<'a, ()> {
        let result = self.apply_update(key);
        Box::pin(std::future::ready(result))
    }

    fn insert_usage(&mut self, record: UsageRecord) -> StoreFuture<'_, ()> {
        self.working.usage.push(record);
        self.dirty = true;
        Box::pin(async { Ok(()) })
    }

    fn usage_since(&mut self, since: DateTime<Utc>) -> StoreFuture<'_, Vec<UsageRecord>> {
        let records: Vec<UsageRecord> = self
            .working
            .usage
            .iter()
            .filter(|u| u.timestamp >= since)
            .cloned()
            .collect();
        Box::pin(async move { Ok(records) })
    }

    fn user<'a>(&'a mut self, id: &'a str) -> StoreFuture<'a, Option<UserRecord>> {
        let found = self.working.users.get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn put_user(&mut self, user: UserRecord) -> StoreFuture<'_, ()> {
        self.working.users.insert(user.id.clone(), user);
        self.dirty = true;
        Box::pin(async { Ok(()) })
    }

    fn new_users_since(&mut self, since: DateTime<Utc>) -> StoreFuture<'_, usize> {
        let count = self
            .working
            .users
            .values()
            .filter(|u| u.created_at >= since)
            .count();
        Box::pin(async move { Ok(count) })
    }

    fn marker<'a>(&'a mut self, name: &'a str) -> StoreFuture<'a, Option<String>> {
        let value = self.working.markers.get(name).cloned();
        Box::pin(async move { Ok(value) })
    }

    fn set_marker(&mut self, name: &str, value: String) -> StoreFuture<'_, ()> {
        self.working.markers.insert(name.to_string(), value);
        self.dirty = true;
        Box::pin(async { Ok(()) })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        let FileTransaction {
            path,
            archive_path,
            usage_retention,
            mut guard,
            mut working,
            dirty,
        } = *self;
        Box::pin(async move {
            if !dirty {
                return Ok(());
            }
            let expired = working.expire_usage(usage_retention);
            if !expired.is_empty() {
                append_archive(&archive_path, &expired).await?;
            }
            write_atomic(&path, &working).await?;
            *guard = working;
            Ok(())
        })
    }
}

/// Append usage records to the JSON-lines archive, one record per line.
async fn append_archive(path: &Path, records: &[UsageRecord]) -> Result<()> {
    let mut lines = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| Error::Parse(format!("serializing usage record: {e}")))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::Io(format!("opening usage archive: {e}")))?;
    file.write_all(lines.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("appending usage archive: {e}")))?;
    file.flush()
        .await
        .map_err(|e| Error::Io(format!("flushing usage archive: {e}")))?;

    debug!(path = %path.display(), records = records.len(), "archived usage records");
    Ok(())
}

/// Write the document to disk atomically.
///
/// Writes to a temporary file in the same directory and renames it over the
/// target. Permissions are 0600 since the file holds provider secrets.
async fn write_atomic(path: &Path, document: &Document) -> Result<()> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| Error::Parse(format!("serializing key store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("key store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".keystore.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp key store: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting key store permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp key store: {e}")))?;

    debug!(path = %path.display(), "persisted key store");
    Ok(())
}
