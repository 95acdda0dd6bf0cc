//! Short-lived suppression set for ids currently being written by one sync
//! direction, so the other direction ignores the echo.
//!
//! Entries expire after a fixed TTL whatever happens to the operation that
//! took them. The registry is process-local and best-effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;
use w3sync_core::Clock;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// Milliseconds since construction, read from tokio's clock so paused-time
/// tests drive lock expiry.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

pub struct LockRegistry {
    entries: Mutex<HashMap<String, u64>>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl LockRegistry {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: ttl.as_millis() as u64,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // Entries are plain timestamps, so a poisoned map is still usable.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks `id` until `now + ttl`, extending an existing entry.
    pub fn acquire(&self, id: impl AsRef<str>) {
        let id = id.as_ref();
        let expires_at = self.clock.now_ms().saturating_add(self.ttl_ms);
        trace!(id, expires_at, "lock acquired");
        self.entries().insert(id.to_string(), expires_at);
    }

    /// Locks `id` only if no live entry exists. Returns whether it did.
    pub fn try_acquire(&self, id: impl AsRef<str>) -> bool {
        let id = id.as_ref();
        let now = self.clock.now_ms();
        let mut entries = self.entries();
        match entries.get(id) {
            Some(&expires_at) if expires_at > now => false,
            _ => {
                entries.insert(id.to_string(), now.saturating_add(self.ttl_ms));
                trace!(id, "lock acquired");
                true
            }
        }
    }

    pub fn contains(&self, id: impl AsRef<str>) -> bool {
        let id = id.as_ref();
        let now = self.clock.now_ms();
        let mut entries = self.entries();
        match entries.get(id) {
            Some(&expires_at) if expires_at > now => true,
            Some(_) => {
                entries.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn release(&self, id: impl AsRef<str>) -> bool {
        self.entries().remove(id.as_ref()).is_some()
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
