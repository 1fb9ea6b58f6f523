//! Named locks keyed by string.
//!
//! The container API rejects concurrent node pool mutations on a busy cluster
//! with a failed precondition error. Serializing the callers inside this
//! process makes that less likely; it cannot rule it out, since other
//! processes may touch the same cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// A registry of named async locks.
///
/// Locks are created on first use and live as long as the registry. Share it
/// with `Arc` across every controller that should observe the same locks.
#[derive(Debug, Default)]
pub struct MutexKv {
    store: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Holds the lock for `key` until dropped.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        debug!(key = %self.key, "Unlocked");
    }
}

impl MutexKv {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        // The map lock is held only to look up or insert, never across an await.
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for and take the lock for `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        debug!(key = %key, "Locking");
        let guard = self.get(key).lock_owned().await;
        debug!(key = %key, "Locked");
        KeyGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Take the lock for `key` if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let guard = self.get(key).try_lock_owned().ok()?;
        Some(KeyGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of keys that have been locked at least once.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no key has been locked yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
