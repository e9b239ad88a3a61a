//! In-process counter store.
//!
//! Suitable for single-process deployments and tests. Each key lives in a
//! `DashMap` shard; holding the shard entry while incrementing makes the
//! admission script indivisible per key.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::store::{CounterStore, StoreError};

/// A counter and the instant its window closes.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

/// Point-in-time view of a live counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Calls counted in the current window.
    pub count: u64,
    /// When the window closes and the counter disappears.
    pub expires_at: Instant,
}

/// Counter store backed by process memory.
pub struct InMemoryStore {
    counters: DashMap<String, CounterEntry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Start a background task that purges expired counters every `interval`.
    ///
    /// The task holds only a weak reference and stops once the store is dropped.
    /// A zero interval starts nothing.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            warn!("Sweep interval is zero, expired counters will not be purged in the background");
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired counters");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Whether a background sweeper is currently running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Remove every counter whose window has closed. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.counters.len())
    }

    /// Current state of a counter, if its window is still open.
    pub fn snapshot(&self, key: &str) -> Option<CounterSnapshot> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| CounterSnapshot {
                count: entry.count,
                expires_at: entry.expires_at,
            })
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn admit(&self, key: &str, _quota: u64, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(window)
            .ok_or(StoreError::WindowOutOfRange(window))?;
        let fresh = CounterEntry {
            count: 1,
            expires_at,
        };

        let count = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().expires_at > now => {
                let entry = occupied.get_mut();
                entry.count = entry.count.saturating_add(1);
                entry.count
            }
            // A closed window behaves exactly like an absent key.
            Entry::Occupied(mut occupied) => {
                occupied.insert(fresh);
                1
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                1
            }
        };

        trace!(key = %key, count, "Incremented in-memory counter");
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
