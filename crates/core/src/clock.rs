use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Source of milliseconds for lock expiry and version stamping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, AtomicOrdering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(AtomicOrdering::SeqCst)
    }
}

/// Monotonic stamp ordering successive outbound writes to the same record:
/// wall milliseconds first, then a counter for writes within one millisecond.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Version {
    wall_ms: u64,
    counter: u32,
}

impl Version {
    pub const ZERO: Version = Version {
        wall_ms: 0,
        counter: 0,
    };

    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then(self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Hands out strictly increasing versions even if the wall clock stalls or
/// steps backwards.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: Option<Version>,
}

impl VersionClock {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn tick(&mut self, now_ms: u64) -> Version {
        let next = match self.last {
            Some(last) if now_ms <= last.wall_ms => Version::new(last.wall_ms, last.counter + 1),
            _ => Version::new(now_ms, 0),
        };
        self.last = Some(next);
        next
    }

    pub fn last(&self) -> Option<Version> {
        self.last
    }
}
