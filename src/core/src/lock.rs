//! Deadlock-free acquisition of lock sets.
//!
//! [`lock_all`] takes any number of shared mutexes in any order. It blocks on
//! one designated lock, try-locks the rest, and on the first failure releases
//! everything and starts over blocking on the lock that failed. Two callers
//! with overlapping sets can never each hold part of the other's set while
//! waiting, so the classic ordering deadlock cannot form.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A mutex that can be part of a lock set.
pub type SharedLock = Arc<Mutex<()>>;

/// Guards for every lock in an acquired set. Dropping releases them all.
#[derive(Debug)]
pub struct MultiGuard {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl MultiGuard {
    /// Number of distinct locks held.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Acquire every lock in `locks`, tolerating duplicates.
pub async fn lock_all(locks: &[SharedLock]) -> MultiGuard {
    let mut unique: Vec<SharedLock> = Vec::with_capacity(locks.len());
    for lock in locks {
        if !unique.iter().any(|held| Arc::ptr_eq(held, lock)) {
            unique.push(Arc::clone(lock));
        }
    }

    if unique.is_empty() {
        return MultiGuard { guards: Vec::new() };
    }

    let mut blocker = 0;
    let mut attempts = 0u32;
    loop {
        let first = Arc::clone(&unique[blocker]).lock_owned().await;
        let mut guards = Vec::with_capacity(unique.len());
        guards.push(first);

        let mut failed = None;
        for (i, lock) in unique.iter().enumerate() {
            if i == blocker {
                continue;
            }
            match Arc::clone(lock).try_lock_owned() {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    failed = Some(i);
                    break;
                }
            }
        }

        match failed {
            None => {
                if attempts > 0 {
                    tracing::trace!(attempts, locks = unique.len(), "Acquired lock set after retry");
                }
                return MultiGuard { guards };
            }
            Some(i) => {
                drop(guards);
                blocker = i;
                attempts += 1;
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Table of named locks, created on first use.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<String, SharedLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for `key`.
    pub fn get(&self, key: &str) -> SharedLock {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(lock.value());
        }
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Lock every named key as a set.
    pub async fn lock_keys<S: AsRef<str>>(&self, keys: &[S]) -> MultiGuard {
        let locks: Vec<SharedLock> = keys.iter().map(|k| self.get(k.as_ref())).collect();
        lock_all(&locks).await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
