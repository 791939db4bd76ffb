//! Per-session serialization under a global concurrency ceiling.
//!
//! Runs that resume the same session wait for each other in arrival order;
//! runs for different sessions, and new unkeyed runs, proceed in parallel up
//! to the ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, RwLock, Semaphore};

use crate::error::BridgeError;

/// Default ceiling on concurrently running agent processes.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

type SessionLock = Arc<Mutex<()>>;

/// Held for the duration of a run.
#[derive(Debug)]
pub struct SessionPermit {
    key: Option<String>,
    _session: Option<OwnedMutexGuard<()>>,
    _slot: OwnedSemaphorePermit,
}

impl SessionPermit {
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// Admits runs one at a time per session key.
pub struct SessionSerializer {
    /// Entries die once no run holds or awaits the lock.
    locks: RwLock<HashMap<String, Weak<Mutex<()>>>>,
    slots: Arc<Semaphore>,
    max_concurrency: usize,
}

impl std::fmt::Debug for SessionSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSerializer")
            .field("max_concurrency", &self.max_concurrency)
            .field("available", &self.slots.available_permits())
            .finish()
    }
}

impl Default for SessionSerializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl SessionSerializer {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            locks: RwLock::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Wait for the session's turn, then for a global slot.
    ///
    /// The session lock is taken first so a queued run never sits on a slot
    /// while waiting for its predecessor.
    pub async fn admit(&self, key: Option<&str>) -> Result<SessionPermit, BridgeError> {
        let session = match key {
            Some(key) => Some(self.session_lock(key).await.lock_owned().await),
            None => None,
        };
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::ShuttingDown)?;

        Ok(SessionPermit {
            key: key.map(String::from),
            _session: session,
            _slot: slot,
        })
    }

    /// Reject pending and future admissions.
    pub fn close(&self) {
        self.slots.close();
    }

    async fn session_lock(&self, key: &str) -> SessionLock {
        // Fast path: a live lock already exists
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
                return lock;
            }
        }

        // Slow path: create it
        let mut locks = self.locks.write().await;
        // Double-check after acquiring write lock
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }

        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        tracing::debug!(session = key, tracked = locks.len(), "Tracking session lock");
        lock
    }

    /// Sessions with a run in flight or queued.
    pub async fn active_sessions(&self) -> usize {
        self.locks
            .read()
            .await
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }
}
