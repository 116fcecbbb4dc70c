//! Spoke-side bounded outbound queue with drop-oldest overflow.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundItem {
    pub target_id: String,
    pub payload: Vec<u8>,
}

/// FIFO of pending sends. Pushing never blocks: when full, the oldest item
/// is evicted to make room.
#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<OutboundItem>>,
    capacity: usize,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Appends an item and wakes the drainer. Returns the evicted item, if any.
    pub fn push(&self, item: OutboundItem) -> Option<OutboundItem> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    /// Takes everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<OutboundItem> {
        self.items.lock().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<OutboundItem> {
        self.items.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolves after the next push (or immediately if one happened since
    /// the last wake-up).
    pub async fn ready(&self) {
        self.ready.notified().await;
    }
}
