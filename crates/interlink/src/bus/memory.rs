//! In-process broker.
//!
//! [`MemoryBroker`] implements [`BrokerConnector`] for single-process
//! deployments and tests. It can be taken offline and told to fail
//! subscribes or publishes, which makes broker churn reproducible.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::broker::{BrokerConnection, BrokerConnector, BrokerDelivery};
use crate::error::BrokerError;

#[derive(Default)]
struct BrokerInner {
    offline: AtomicBool,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    failing_subscribes: AtomicU32,
    failing_publishes: AtomicU32,
    published: AtomicU64,
    undeliverable: AtomicU64,
}

impl BrokerInner {
    fn live_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut connections = self.connections.lock();
        connections.retain(|conn| !conn.is_closed());
        connections.clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn deliver(&self, channel: &str, payload: &[u8]) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        for conn in self.live_connections() {
            if !conn.subscriptions.lock().contains(channel) {
                continue;
            }
            let delivery = BrokerDelivery {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            };
            match conn.sink.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.undeliverable.fetch_add(1, Ordering::Relaxed);
                    warn!("Memory broker could not deliver to connection #{} on '{}'", conn.id, channel);
                }
            }
        }
        delivered
    }
}

/// A shared in-memory broker; clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the broker offline (dropping every connection) or back online.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::Release);
        if !online {
            let connections: Vec<_> = self.inner.connections.lock().drain(..).collect();
            info!("Memory broker offline; dropping {} connection(s)", connections.len());
            for conn in connections {
                conn.close();
            }
        } else {
            info!("Memory broker online");
        }
    }

    pub fn is_online(&self) -> bool {
        !self.inner.offline.load(Ordering::Acquire)
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.inner.failing_subscribes.store(count, Ordering::Release);
    }

    /// Makes the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::Release);
    }

    /// Publishes from outside any connection; returns the number of receivers.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        self.inner.deliver(channel, payload)
    }

    /// Number of live connections subscribed to `channel`.
    pub fn active_subscriptions(&self, channel: &str) -> usize {
        self.inner
            .live_connections()
            .iter()
            .filter(|conn| conn.subscriptions.lock().contains(channel))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.live_connections().len()
    }

    /// Total publishes accepted by the broker.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        deliveries: mpsc::Sender<BrokerDelivery>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if !self.is_online() {
            return Err(BrokerError::Unavailable("memory broker is offline".into()));
        }
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let conn = Arc::new(MemoryConnection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            broker: self.inner.clone(),
            subscriptions: Mutex::new(HashSet::new()),
            sink: deliveries,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        self.inner.connections.lock().push(conn.clone());
        debug!("Memory broker accepted connection #{}", conn.id);
        Ok(conn)
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
    subscriptions: Mutex<HashSet<String>>,
    sink: mpsc::Sender<BrokerDelivery>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.check_open()?;
        if BrokerInner::take_failure(&self.broker.failing_publishes) {
            return Err(BrokerError::Publish {
                channel: channel.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.broker.deliver(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        if BrokerInner::take_failure(&self.broker.failing_subscribes) {
            return Err(BrokerError::Subscribe {
                channel: channel.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.subscriptions.lock().insert(channel.to_string());
        Ok(())
    }

    async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscriptions.lock().clear();
            self.close_notify.notify_one();
        }
    }
}
