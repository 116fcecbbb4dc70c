//! Counters and rate limits for noisy warnings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counts dropped items and tells the caller when a warning is due:
/// on the first drop and then on every `threshold`-th drop.
#[derive(Debug)]
pub struct DropCounter {
    count: AtomicU64,
    threshold: u64,
}

impl DropCounter {
    pub fn new(threshold: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Records one drop. Returns the new total when a warning should be logged.
    pub fn record(&self) -> Option<u64> {
        let total = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        (total == 1 || total % self.threshold == 0).then_some(total)
    }

    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Allows one event per interval.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Returns `true` if the caller should log now.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
