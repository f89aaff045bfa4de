//! Process-local keyed mutexes
//!
//! One async mutex per scope name (`user:<id>`, `kind:SEARCH`, `key:<id>`,
//! `sweep`).
//! Entries are created on demand and pruned once nobody holds or waits on
//! them, so the table stays proportional to live contention rather than to
//! the number of keys ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use key_store::KeyKind;
use tokio::sync::OwnedMutexGuard;

/// Guard for one held scope. Dropping it releases the scope.
pub type ScopeGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct LockTable {
    scopes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `scope`.
    pub async fn acquire(&self, scope: &str) -> ScopeGuard {
        let lock = {
            let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
            // Only the table references an idle entry
            scopes.retain(|name, lock| name == scope || Arc::strong_count(lock) > 1);
            scopes
                .entry(scope.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Acquire several scopes in sorted order, skipping duplicates.
    pub async fn acquire_many(&self, scopes: &[String]) -> Vec<ScopeGuard> {
        let mut sorted: Vec<&String> = scopes.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for scope in sorted {
            guards.push(self.acquire(scope).await);
        }
        guards
    }

    /// Number of scopes currently tracked.
    pub fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn kind_scope(kind: KeyKind) -> String {
    format!("kind:{}", kind.label())
}

pub fn key_scope(id: &str) -> String {
    format!("key:{id}")
}

pub fn user_scope(id: &str) -> String {
    format!("user:{id}")
}

pub const SWEEP_SCOPE: &str = "sweep";
