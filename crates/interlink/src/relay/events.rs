//! Observable outcomes of relay connections.
//!
//! Every connection attempt ends in exactly one of `Established`,
//! `Rejected` or `Failed`. Subscribe with
//! [`RelayChannel::events`](super::RelayChannel::events).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::throttle::DropCounter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake completed with `peer_id`.
    Established { peer_id: String },
    /// Handshake refused. On a spoke the hub sent REJECT; on a hub this
    /// node refused the claimed `peer_id`.
    Rejected {
        peer_id: Option<String>,
        reason: String,
    },
    /// Attempt failed before a handshake verdict (I/O error, timeout,
    /// protocol violation, unacceptable WELCOME).
    Failed { reason: String },
    /// An established link ended.
    Disconnected { peer_id: String },
    /// The spoke will retry after `delay`; `attempt` counts consecutive failures.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Retries were exhausted; the channel stays degraded.
    Degraded,
}

/// Monotonic relay counters.
#[derive(Debug)]
pub struct RelayStats {
    pub(crate) connect_attempts: AtomicU64,
    pub(crate) dropped_sends: DropCounter,
    pub(crate) queue_evictions: DropCounter,
    pub(crate) spoofed_frames: AtomicU64,
    pub(crate) unroutable_frames: AtomicU64,
    pub(crate) forwarded_frames: AtomicU64,
    pub(crate) delivered_frames: AtomicU64,
    pub(crate) rejected_handshakes: AtomicU64,
}

impl RelayStats {
    pub(crate) fn new(drop_warn_threshold: u64) -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            dropped_sends: DropCounter::new(drop_warn_threshold),
            queue_evictions: DropCounter::new(drop_warn_threshold),
            spoofed_frames: AtomicU64::new(0),
            unroutable_frames: AtomicU64::new(0),
            forwarded_frames: AtomicU64::new(0),
            delivered_frames: AtomicU64::new(0),
            rejected_handshakes: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.total(),
            queue_evictions: self.queue_evictions.total(),
            spoofed_frames: self.spoofed_frames.load(Ordering::Relaxed),
            unroutable_frames: self.unroutable_frames.load(Ordering::Relaxed),
            forwarded_frames: self.forwarded_frames.load(Ordering::Relaxed),
            delivered_frames: self.delivered_frames.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connect_attempts: u64,
    pub dropped_sends: u64,
    pub queue_evictions: u64,
    pub spoofed_frames: u64,
    pub unroutable_frames: u64,
    pub forwarded_frames: u64,
    pub delivered_frames: u64,
    pub rejected_handshakes: u64,
}
