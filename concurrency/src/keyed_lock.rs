// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-key mutual exclusion.

use ahash::RandomState;
use dashmap::DashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock on '{key}'")]
    Timeout { key: String, timeout: Duration },
}

type LockTable<K> = DashMap<K, Arc<Mutex<()>>, RandomState>;

/// A table of locks created on demand, one per key. Entries are removed when nobody holds or
/// waits for them, so the table only grows with the number of contended keys.
pub struct KeyedLock<K: Hash + Eq + Clone> {
    locks: Arc<LockTable<K>>,
}

impl<K: Hash + Eq + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::with_hasher(RandomState::new())),
        }
    }
}

impl<K: Hash + Eq + Clone> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

/// Proof of exclusive access to a key. The lock is released when the guard is dropped.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyedGuard<K: Hash + Eq + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable<K>>,
}

impl<K: Hash + Eq + Clone> KeyedGuard<K> {
    /// The key this guard protects
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Hash + Eq + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // release first, so that the entry can be reclaimed if nobody else references it
        drop(self.guard.take());
        release_entry(&self.locks, &self.key);
    }
}

fn release_entry<K: Hash + Eq + Clone>(locks: &LockTable<K>, key: &K) {
    locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

impl<K: Hash + Eq + Clone + Display> KeyedLock<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key.clone()).or_default().value())
    }

    /// Acquire the lock for `key`, waiting as long as needed.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.entry(&key);
        let guard = mutex.lock_owned().await;
        debug!("Locked '{key}'");
        KeyedGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Acquire the lock for `key`, waiting at most `timeout`.
    pub async fn try_lock_for(
        &self,
        key: K,
        timeout: Duration,
    ) -> Result<KeyedGuard<K>, LockError> {
        let mutex = self.entry(&key);
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!("Locked '{key}'");
                Ok(KeyedGuard {
                    key,
                    guard: Some(guard),
                    locks: Arc::clone(&self.locks),
                })
            }
            Err(_) => {
                warn!("Could not lock '{key}' within {timeout:?}");
                release_entry(&self.locks, &key);
                Err(LockError::Timeout {
                    key: key.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Tell if some task currently holds the lock for `key`
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Number of keys currently held or waited for
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Hash + Eq + Clone + Debug> Debug for KeyedLock<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLock")
            .field("keys", &self.locks.len())
            .finish()
    }
}
