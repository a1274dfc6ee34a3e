//! In-flight attempts keyed by store name.
//!
//! At most one attempt runs per key. Starting a new one cancels the old one
//! and waits for it to release its socket and store first. Starts for
//! different keys never wait on each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Backstop for an attempt that ignores cancellation. Attempts stop on their
/// own well within this.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

struct AttemptHandle {
    id: Uuid,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct AttemptRegistry {
    /// One lock per key being started, so cancel-then-start for a key cannot
    /// interleave with another start for the same key.
    starting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    attempts: Mutex<HashMap<String, AttemptHandle>>,
}

impl AttemptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold while cancelling the old attempt for `key` and spawning its replacement.
    pub async fn start_guard(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut starting = self.starting.lock().await;
            // Locks nobody holds or waits on are only referenced by the map.
            starting.retain(|_, lock| Arc::strong_count(lock) > 1);
            starting.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Cancel the attempt running for `key`, if any, and wait for it to finish.
    pub async fn cancel(&self, key: &str) -> bool {
        let previous = self.attempts.lock().await.remove(key);
        let Some(handle) = previous else {
            return false;
        };

        debug!("cancelling attempt {} for {key}", handle.id);
        let _ = handle.cancel.send(true);
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, handle.task).await.is_err() {
            error!("attempt {} for {key} ignored cancellation, aborting", handle.id);
            abort.abort();
        }
        true
    }

    /// Spawn an attempt and register it under `key`.
    ///
    /// The attempt task may call [`release`](Self::release) as soon as it
    /// runs. The map lock is held across spawn and insert so that release
    /// always sees the entry.
    pub async fn spawn<F, Fut>(&self, key: String, id: Uuid, make: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, cancel_rx) = watch::channel(false);
        let mut attempts = self.attempts.lock().await;
        let task = tokio::spawn(make(cancel_rx));
        attempts.insert(key, AttemptHandle { id, cancel, task });
    }

    /// Drop the entry for `key` if it still belongs to attempt `id`.
    pub async fn release(&self, key: &str, id: Uuid) {
        let mut attempts = self.attempts.lock().await;
        if attempts.get(key).is_some_and(|h| h.id == id) {
            attempts.remove(key);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.attempts.lock().await.len()
    }

    /// Cancel every in-flight attempt. Used on shutdown.
    pub async fn cancel_all(&self) {
        let keys: Vec<String> = self.attempts.lock().await.keys().cloned().collect();
        for key in keys {
            self.cancel(&key).await;
        }
    }
}
