use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Source of MVCC timestamps. Implementations must never go backwards.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    /// Moves the clock forward to at least `observed`, a timestamp carried by
    /// a request. Every later reading is strictly greater.
    fn update(&self, observed: Timestamp);
}

/// A hybrid logical clock driven by the system's wall time. When the wall
/// time has not advanced since the last reading the logical component is
/// bumped instead, so successive readings are strictly increasing.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<Timestamp>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn physical_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

impl Clock for HybridClock {
    fn now(&self) -> Timestamp {
        let physical = Self::physical_now();
        let mut last = self.last.lock();
        let next = if physical > last.wall_time {
            Timestamp::new(physical, 0)
        } else {
            last.next()
        };
        *last = next;
        next
    }

    fn update(&self, observed: Timestamp) {
        let mut last = self.last.lock();
        if observed > *last {
            *last = observed;
        }
    }
}

/// A clock that only moves when told to. Each reading returns the current
/// wall time with an increasing logical component.
#[derive(Debug)]
pub struct ManualClock {
    wall_time: AtomicI64,
    last: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(wall_time: i64) -> Self {
        Self {
            wall_time: AtomicI64::new(wall_time),
            last: Mutex::new(Timestamp::ZERO),
        }
    }

    pub fn advance(&self, nanos: i64) {
        self.wall_time.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let wall_time = self.wall_time.load(Ordering::SeqCst);
        let mut last = self.last.lock();
        let next = if wall_time > last.wall_time {
            Timestamp::new(wall_time, 0)
        } else {
            last.next()
        };
        *last = next;
        next
    }

    fn update(&self, observed: Timestamp) {
        let mut last = self.last.lock();
        if observed > *last {
            *last = observed;
        }
    }
}
