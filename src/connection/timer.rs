//! Per-client idle timers
//!
//! Timers are held in one arena keyed by client id. Arming a client that
//! already has a pending timer aborts the old task first, and every task
//! checks its generation before firing, so a client never has two live
//! expiries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use super::ClientId;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Arena of cancellable one-shot idle timers
#[derive(Default)]
pub struct IdleTimers {
    entries: Mutex<HashMap<ClientId, TimerEntry>>,
    next_generation: AtomicU64,
}

impl IdleTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_expire` to run after `after`, replacing any pending timer
    pub fn arm<F>(self: &Arc<Self>, id: ClientId, after: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(self);

        // Held across the spawn so the new task cannot observe the arena
        // before its own entry is in place.
        let mut entries = self.entries();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if timers.take_if_current(id, generation) {
                trace!("Idle timer for {} expired after {:?}", id, after);
                on_expire();
            }
        });

        if let Some(previous) = entries.insert(id, TimerEntry { generation, handle }) {
            previous.handle.abort();
        }
        trace!("Armed idle timer for {} ({:?})", id, after);
    }

    /// Cancel the pending timer, returning whether one was armed
    pub fn cancel(&self, id: ClientId) -> bool {
        match self.entries().remove(&id) {
            Some(entry) => {
                entry.handle.abort();
                trace!("Cancelled idle timer for {}", id);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, id: ClientId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Cancel everything, used on shutdown
    pub fn cancel_all(&self) {
        for (_, entry) in self.entries().drain() {
            entry.handle.abort();
        }
    }

    fn take_if_current(&self, id: ClientId, generation: u64) -> bool {
        let mut entries = self.entries();
        match entries.get(&id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ClientId, TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
