//! In-memory key-value storage with per-key expiry.
//!
//! All entries live in one map guarded by a reader/writer lock. Expiry is driven
//! by a single background task that sleeps until the earliest deadline, rather
//! than one timer per write. Overwriting or deleting a key removes its pending
//! deadline, so a stale deadline can never delete a newer value.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{self, Instant},
};
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("invalid ttl: {0} seconds")]
    InvalidTtl(i32),
}

/// Converts a wire TTL into an expiry duration. Zero means "never expires".
pub fn ttl_from_seconds(seconds: i32) -> Result<Option<Duration>, StoreError> {
    match seconds {
        0 => Ok(None),
        s if s > 0 => Ok(Some(Duration::from_secs(s as u64))),
        s => Err(StoreError::InvalidTtl(s)),
    }
}

/// Handle to a shared cache. Cloning is cheap and every clone sees the same data.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

struct Shared {
    state: RwLock<State>,
    // Kept outside `State` so the purge task can wait on it without holding the data.
    purge_wakeup: Arc<Notify>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Bytes, Entry>,
    deadlines: BTreeSet<(Instant, Bytes)>,
}

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

impl Cache {
    /// Creates an empty cache and spawns its purge task on the current runtime.
    pub fn new() -> Self {
        let purge_wakeup = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            state: RwLock::new(State::default()),
            purge_wakeup: Arc::clone(&purge_wakeup),
        });

        tokio::spawn(purge_expired_entries(Arc::downgrade(&shared), purge_wakeup));

        Self { shared }
    }

    pub fn get(&self, key: &[u8]) -> Result<Bytes, StoreError> {
        let state = self.shared.state.read();
        match state.entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(entry.value.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    pub fn has(&self, key: &[u8]) -> bool {
        let state = self.shared.state.read();
        state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now()))
    }

    /// Upserts `key`. With `ttl` set, the entry disappears once it elapses; any
    /// deadline left over from an earlier write of the same key is dropped.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);

        let wake_purger = {
            let mut state = self.shared.state.write();

            let previous = state.entries.insert(key.clone(), Entry { value, expires_at });
            if let Some(deadline) = previous.and_then(|entry| entry.expires_at) {
                state.deadlines.remove(&(deadline, key.clone()));
            }

            match expires_at {
                Some(deadline) => {
                    // Only wake the purger when this deadline is now the earliest one.
                    let earliest = state
                        .deadlines
                        .first()
                        .map_or(true, |(next, _)| deadline < *next);
                    state.deadlines.insert((deadline, key));
                    earliest
                }
                None => false,
            }
        };

        if wake_purger {
            self.shared.purge_wakeup.notify_one();
        }
    }

    /// Removes `key` and its pending deadline. Missing keys are ignored.
    pub fn delete(&self, key: &[u8]) {
        let mut state = self.shared.state.write();
        if let Some(entry) = state.entries.remove(key) {
            if let Some(deadline) = entry.expires_at {
                state
                    .deadlines
                    .remove(&(deadline, Bytes::copy_from_slice(key)));
            }
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    /// Drops every entry whose deadline has passed and returns the next deadline.
    fn purge_expired(&self) -> Option<Instant> {
        let mut state = self.state.write();
        let now = Instant::now();

        while let Some((deadline, key)) = state.deadlines.first().cloned() {
            if deadline > now {
                return Some(deadline);
            }
            state.deadlines.pop_first();
            state.entries.remove(&key);
            trace!(key = ?key, "entry expired");
        }

        None
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Let the purge task observe that the cache is gone.
        self.purge_wakeup.notify_one();
    }
}

async fn purge_expired_entries(shared: Weak<Shared>, wakeup: Arc<Notify>) {
    loop {
        let next_deadline = match shared.upgrade() {
            Some(shared) => shared.purge_expired(),
            None => break,
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {}
                    _ = wakeup.notified() => {}
                }
            }
            None => wakeup.notified().await,
        }
    }

    debug!("cache dropped, purge task exiting");
}
