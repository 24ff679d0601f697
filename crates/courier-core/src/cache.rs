//! Coordination cache: shared key/value store with per-key
//! mutual-exclusion transactions.
//!
//! Plain `get`/`put`/`remove` are unconditional and last-writer-wins.
//! `execute` is the sole sanctioned cross-node read-modify-write path: it
//! holds the key's lock for the duration of the body, so for all
//! concurrent `execute` calls on one key exactly one body runs at a time.
//!
//! # Re-entrancy
//!
//! `execute` is not reentrant. A body that calls `execute` again on the
//! same key from the same call chain would deadlock on its own lock; a
//! task-local held-key set detects this and fails fast with
//! [`CourierError::LockReentry`] instead of hanging.

use crate::{CourierError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

// Held keys are tracked as (cache instance, key) pairs: the same key
// string in two distinct caches is two independent locks, not re-entry.
type HeldKey = (usize, String);

tokio::task_local! {
    static HELD_KEYS: RefCell<HashSet<HeldKey>>;
}

/// Untracks a held key when the body finishes or unwinds.
struct HeldKeyGuard {
    entry: HeldKey,
}

impl Drop for HeldKeyGuard {
    fn drop(&mut self) {
        let _ = HELD_KEYS.try_with(|held| {
            held.borrow_mut().remove(&self.entry);
        });
    }
}

/// A stored entry. The timestamp is set for time-series style writes
/// (`put_at`) and absent for plain ones.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

struct CacheState {
    entries: Mutex<HashMap<String, CacheEntry>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheState {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Shared key/value store, the cross-node consistency point.
///
/// Cheap to clone; clones share the store and the lock table.
#[derive(Clone)]
pub struct CoordinationCache {
    name: String,
    state: Arc<CacheState>,
}

impl CoordinationCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(CacheState {
                entries: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The cache's configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unconditional read. A miss is `None`, never an error.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Unconditional last-writer-wins write.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        let mut entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                timestamp: None,
            },
        );
    }

    /// Timestamped write for time-series style entries.
    pub fn put_at(&self, key: impl Into<String>, value: Value, timestamp: DateTime<Utc>) {
        let mut entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                timestamp: Some(timestamp),
            },
        );
    }

    /// Unconditional removal; returns the removed value if any.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).map(|entry| entry.value)
    }

    /// Secondary lookup: the first value matching `predicate`, if any.
    /// Returning `None` is a legitimate answer, not a fault.
    pub fn get_by_expression<P>(&self, predicate: P) -> Option<Value>
    where
        P: Fn(&Value) -> bool,
    {
        let entries = self.state.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .find(|entry| predicate(&entry.value))
            .map(|entry| entry.value.clone())
    }

    /// Run `body` inside the critical section for `key`.
    ///
    /// The calling task suspends until the key's lock is granted (mutual
    /// exclusion guaranteed, fairness not). The lock is released when the
    /// body finishes, errors, or the task unwinds. Re-entry on the same
    /// key from the same call chain fails fast with `LockReentry`.
    pub async fn execute<F, Fut, R>(&self, key: &str, body: F) -> Result<R>
    where
        F: FnOnce(KeyTransaction) -> Fut,
        Fut: Future<Output = R>,
    {
        let entry: HeldKey = (Arc::as_ptr(&self.state) as usize, key.to_string());
        let reentry = HELD_KEYS
            .try_with(|held| held.borrow().contains(&entry))
            .unwrap_or(false);
        if reentry {
            return Err(CourierError::LockReentry {
                key: key.to_string(),
            });
        }

        let lock = self.state.lock_for(key);
        let _guard = lock.lock().await;
        debug!("cache '{}' locked key '{}'", self.name, key);

        let txn = KeyTransaction {
            cache: self.clone(),
            key: key.to_string(),
        };

        // Track the held key for the duration of the body so nested
        // execute calls on it are caught instead of deadlocking. The
        // guard untracks on unwind as well as on normal return.
        let result = if HELD_KEYS.try_with(|_| ()).is_ok() {
            HELD_KEYS.with(|held| held.borrow_mut().insert(entry.clone()));
            let _held = HeldKeyGuard { entry };
            body(txn).await
        } else {
            let mut held = HashSet::new();
            held.insert(entry);
            HELD_KEYS.scope(RefCell::new(held), body(txn)).await
        };

        debug!("cache '{}' released key '{}'", self.name, key);
        Ok(result)
    }
}

/// Scoped view handed to an `execute` body: get/put/remove bound to the
/// locked key.
pub struct KeyTransaction {
    cache: CoordinationCache,
    key: String,
}

impl KeyTransaction {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> Option<Value> {
        self.cache.get(&self.key)
    }

    pub fn put(&self, value: Value) {
        self.cache.put(self.key.clone(), value);
    }

    pub fn put_at(&self, value: Value, timestamp: DateTime<Utc>) {
        self.cache.put_at(self.key.clone(), value, timestamp);
    }

    pub fn remove(&self) -> Option<Value> {
        self.cache.remove(&self.key)
    }
}
