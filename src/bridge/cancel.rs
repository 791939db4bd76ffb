//! Registry of in-flight runs, keyed by their progress message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

/// Identifies a run by the chat message showing its progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RunningTasks {
    inner: Arc<Mutex<HashMap<RunKey, oneshot::Sender<()>>>>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a run. It stays cancellable until the guard drops.
    pub fn register(&self, key: RunKey) -> (RunGuard, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key, tx);
        (
            RunGuard {
                tasks: self.clone(),
                key,
            },
            rx,
        )
    }

    /// Signal the run shown by `key`. Returns false if none is running.
    pub fn cancel(&self, key: RunKey) -> bool {
        match self.lock().remove(&key) {
            Some(tx) => {
                tracing::info!(
                    chat_id = key.chat_id,
                    message_id = key.message_id,
                    "Cancelling run"
                );
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Signal every run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunKey, oneshot::Sender<()>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters its run on drop.
#[derive(Debug)]
pub struct RunGuard {
    tasks: RunningTasks,
    key: RunKey,
}

impl RunGuard {
    pub fn key(&self) -> RunKey {
        self.key
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.key);
    }
}
