//! The resilient pub/sub bus.
//!
//! [`PubSubBus`] wraps a broker connection and keeps it useful across broker
//! churn:
//!
//! * **Reconnection**: connect, subscribe and publish failures move the bus
//!   to `DEGRADED` and schedule a reconnect with exponential backoff.
//! * **Durable subscriptions**: every `subscribe` is remembered and
//!   re-applied each time the bus reaches `RUNNING`.
//! * **Overload protection**: `publish` never blocks; it drops (counted)
//!   while the bus is not running. Handlers run on a bounded worker pool
//!   that falls back to caller-runs when saturated.
//! * **Origin filtering**: envelopes from another environment, or from this
//!   node itself, never reach handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broker::{BrokerConnection, BrokerConnector, BrokerDelivery};
use super::pool::{Submission, WorkerPool};
use crate::envelope::Envelope;
use crate::error::{require_non_blank, MessagingError};
use crate::handler::{invoke_guarded, same_handler, MessageHandler};
use crate::identity::PeerIdentity;
use crate::settings::BusSettings;
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::state::{ConnectionState, StartOutcome, StateMachine};
use crate::throttle::{DropCounter, LogThrottle};

const DELIVERY_BUFFER: usize = 1024;

/// True if an envelope should reach this node's handlers: same environment,
/// different origin.
pub fn accepts_origin(identity: &PeerIdentity, envelope: &Envelope) -> bool {
    envelope.environment() == identity.environment() && envelope.origin_id() != identity.server_id()
}

struct Outgoing {
    channel: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct BusStats {
    published: AtomicU64,
    dropped_publishes: DropCounter,
    received: AtomicU64,
    filtered: AtomicU64,
    decode_failures: AtomicU64,
    dispatched: AtomicU64,
    reconnects: AtomicU64,
    subscribe_failures: AtomicU64,
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub dropped_publishes: u64,
    pub received: u64,
    pub filtered: u64,
    pub decode_failures: u64,
    pub dispatched: u64,
    pub caller_runs: u64,
    pub reconnects: u64,
    pub subscribe_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Why a broker session ended.
enum SessionEnd {
    Stopped,
    Failed(String),
}

struct BusInner {
    identity: PeerIdentity,
    settings: BusSettings,
    connector: Arc<dyn BrokerConnector>,
    state: StateMachine,
    shutdown: Shutdown,
    subscriptions: RwLock<BTreeMap<String, Vec<Arc<dyn MessageHandler>>>>,
    subscribe_tx: mpsc::UnboundedSender<String>,
    publish_tx: mpsc::Sender<Outgoing>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    pool: OnceLock<WorkerPool>,
    stats: BusStats,
    degraded_log: LogThrottle,
}

impl BusInner {
    fn record_dropped_publish(&self, channel: &str, why: &str) {
        if let Some(total) = self.stats.dropped_publishes.record() {
            warn!(
                "⚠️ Bus {} dropped publish to '{}' ({}); {} dropped so far",
                self.identity, channel, why, total
            );
        }
    }

    fn degrade(&self, reason: &str) {
        self.state.transition(ConnectionState::Degraded);
        if self.degraded_log.allow() {
            warn!("Bus {} degraded: {}", self.identity, reason);
        } else {
            debug!("Bus {} still degraded: {}", self.identity, reason);
        }
    }

    /// Decode, filter, then fan out to the channel's handlers.
    fn on_delivery(&self, delivery: BrokerDelivery) {
        bump(&self.stats.received);
        let envelope = match Envelope::from_bytes(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                bump(&self.stats.decode_failures);
                warn!("Discarding undecodable message on '{}': {}", delivery.channel, e);
                return;
            }
        };
        if !accepts_origin(&self.identity, &envelope) {
            bump(&self.stats.filtered);
            debug!(
                "Filtered {} from {}/{} on '{}'",
                envelope.message_type(),
                envelope.environment(),
                envelope.origin_id(),
                delivery.channel
            );
            return;
        }

        let handlers = self
            .subscriptions
            .read()
            .get(&delivery.channel)
            .cloned()
            .unwrap_or_default();
        let Some(pool) = self.pool.get() else {
            return;
        };

        let channel: Arc<str> = Arc::from(delivery.channel);
        let envelope = Arc::new(envelope);
        for handler in handlers {
            let channel = channel.clone();
            let envelope = envelope.clone();
            let submission = pool.submit(Box::new(move || {
                let context = format!("'{}' on '{}'", envelope.message_type(), channel);
                invoke_guarded(&context, || handler.on_message(&channel, &envelope));
            }));
            if submission != Submission::Rejected {
                bump(&self.stats.dispatched);
            }
        }
    }

    async fn subscribe_with_retry(&self, conn: &dyn BrokerConnection, channel: &str) -> Result<(), String> {
        let attempts = self.settings.subscribe_retry_attempts;
        let mut attempt = 1;
        loop {
            match conn.subscribe(channel).await {
                Ok(()) => {
                    debug!("Bus {} subscribed to '{}'", self.identity, channel);
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Subscribe to '{}' failed (attempt {}/{}): {}",
                        channel, attempt, attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.settings.subscribe_retry_delay).await;
                }
                Err(e) => {
                    bump(&self.stats.subscribe_failures);
                    return Err(format!(
                        "subscribe to '{channel}' failed after {attempts} attempt(s): {e}"
                    ));
                }
            }
        }
    }

    async fn apply_subscriptions(&self, conn: &dyn BrokerConnection) -> Result<(), String> {
        let channels: Vec<String> = self.subscriptions.read().keys().cloned().collect();
        for channel in channels {
            self.subscribe_with_retry(conn, &channel).await?;
        }
        Ok(())
    }

    fn set_connection(&self, conn: Option<Arc<dyn BrokerConnection>>) {
        let previous = std::mem::replace(&mut *self.connection.lock(), conn);
        if let Some(previous) = previous {
            previous.close();
        }
    }
}

/// Resilient publish/subscribe client.
///
/// Dropping the bus stops it.
pub struct PubSubBus {
    inner: Arc<BusInner>,
    receivers: Mutex<Option<(mpsc::Receiver<Outgoing>, mpsc::UnboundedReceiver<String>)>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PubSubBus {
    /// Creates a bus for `identity` over `connector`. Nothing connects until
    /// [`start`](Self::start).
    pub fn new<C: BrokerConnector>(identity: PeerIdentity, connector: C, settings: BusSettings) -> Self {
        Self::with_connector(identity, Arc::new(connector), settings)
    }

    pub fn with_connector(
        identity: PeerIdentity,
        connector: Arc<dyn BrokerConnector>,
        settings: BusSettings,
    ) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(settings.publish_buffer);
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let inner = BusInner {
            state: StateMachine::new("pub/sub bus", identity.to_string()),
            stats: BusStats {
                published: AtomicU64::new(0),
                dropped_publishes: DropCounter::new(settings.drop_warn_threshold),
                received: AtomicU64::new(0),
                filtered: AtomicU64::new(0),
                decode_failures: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                subscribe_failures: AtomicU64::new(0),
            },
            degraded_log: LogThrottle::new(settings.degraded_log_interval),
            shutdown: Shutdown::new(),
            subscriptions: RwLock::new(BTreeMap::new()),
            connection: Mutex::new(None),
            pool: OnceLock::new(),
            identity,
            settings,
            connector,
            subscribe_tx,
            publish_tx,
        };
        Self {
            inner: Arc::new(inner),
            receivers: Mutex::new(Some((publish_rx, subscribe_rx))),
            supervisor: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    /// Starts the worker pool and the connection supervisor. A second call
    /// while running is a no-op.
    ///
    /// # Errors
    ///
    /// * [`MessagingError::Stopped`] if the bus was stopped before
    /// * [`MessagingError::NoRuntime`] outside a tokio runtime
    pub fn start(&self) -> Result<(), MessagingError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MessagingError::NoRuntime(e.to_string()))?;
        if self.inner.state.begin()? == StartOutcome::AlreadyStarted {
            return Ok(());
        }
        let Some((publish_rx, subscribe_rx)) = self.receivers.lock().take() else {
            return Ok(());
        };

        let settings = &self.inner.settings;
        let _ = self.inner.pool.set(WorkerPool::new(
            &format!("bus-{}", self.inner.identity.server_id()),
            settings.worker_pool_size,
            settings.worker_queue_capacity,
            settings.drop_warn_threshold,
        ));

        info!("🚀 Starting pub/sub bus {}", self.inner.identity);
        let task = runtime.spawn(run(self.inner.clone(), publish_rx, subscribe_rx));
        *self.supervisor.lock() = Some(task);
        Ok(())
    }

    /// Stops the bus for good: cancels reconnects, closes the broker
    /// connection and releases the worker pool. Idempotent.
    pub fn stop(&self) {
        let was_started = self.inner.state.is_started();
        if !self.inner.state.shutdown() {
            return;
        }
        self.inner.shutdown.trigger();
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.inner.set_connection(None);
        if let Some(pool) = self.inner.pool.get() {
            pool.shutdown();
        }
        if was_started {
            info!("🛑 Pub/sub bus {} stopped", self.inner.identity);
        }
    }

    /// Registers `handler` for `channel`. Works before or after `start`;
    /// the subscription survives reconnects. Registering the same handler
    /// instance twice for a channel has no effect.
    pub fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<(), MessagingError> {
        require_non_blank(channel, "channel")?;
        self.inner.state.ensure_usable()?;

        let new_channel = {
            let mut subscriptions = self.inner.subscriptions.write();
            let handlers = subscriptions.entry(channel.to_string()).or_default();
            let new_channel = handlers.is_empty();
            if !handlers.iter().any(|existing| same_handler(existing, &handler)) {
                handlers.push(handler);
            }
            new_channel
        };
        if new_channel {
            debug!("Bus {} now tracks channel '{}'", self.inner.identity, channel);
            let _ = self.inner.subscribe_tx.send(channel.to_string());
        }
        Ok(())
    }

    /// Publishes `envelope` on `channel` without blocking. While the bus is
    /// not running the message is dropped and counted.
    ///
    /// # Errors
    ///
    /// Only caller misuse: a blank channel or a stopped bus.
    pub fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), MessagingError> {
        require_non_blank(channel, "channel")?;
        self.inner.state.ensure_usable()?;

        let state = self.inner.state.state();
        if state != ConnectionState::Running {
            self.inner.record_dropped_publish(channel, &format!("bus is {state}"));
            return Ok(());
        }

        let outgoing = Outgoing {
            channel: channel.to_string(),
            payload: envelope.to_bytes()?,
        };
        if self.inner.publish_tx.try_send(outgoing).is_err() {
            self.inner.record_dropped_publish(channel, "publish buffer full");
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits up to `timeout` for the bus to reach `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.inner.state.wait_for(target, timeout).await
    }

    /// Channels in the durable subscription set.
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner.subscriptions.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        let stats = &self.inner.stats;
        BusStatsSnapshot {
            published: stats.published.load(Ordering::Relaxed),
            dropped_publishes: stats.dropped_publishes.total(),
            received: stats.received.load(Ordering::Relaxed),
            filtered: stats.filtered.load(Ordering::Relaxed),
            decode_failures: stats.decode_failures.load(Ordering::Relaxed),
            dispatched: stats.dispatched.load(Ordering::Relaxed),
            caller_runs: self.inner.pool.get().map_or(0, WorkerPool::caller_runs),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            subscribe_failures: stats.subscribe_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PubSubBus {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PubSubBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubBus")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .field("channels", &self.subscribed_channels())
            .finish()
    }
}

/// Supervisor: connect, re-apply subscriptions, pump traffic, back off.
async fn run(
    inner: Arc<BusInner>,
    mut publish_rx: mpsc::Receiver<Outgoing>,
    mut subscribe_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut backoff = inner.settings.reconnect.backoff();
    let mut shutdown = inner.shutdown.listener();
    inner.state.transition(ConnectionState::Connecting);

    loop {
        if shutdown.is_triggered() {
            return;
        }

        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_BUFFER);
        let connected = tokio::select! {
            res = inner.connector.connect(delivery_tx) => res,
            _ = shutdown.wait() => return,
        };

        let end = match connected {
            Ok(conn) => {
                inner.set_connection(Some(conn.clone()));
                // requests queued before this point are covered by the re-apply
                while subscribe_rx.try_recv().is_ok() {}
                match inner.apply_subscriptions(conn.as_ref()).await {
                    Ok(()) => {
                        backoff.reset();
                        inner.state.transition(ConnectionState::Running);
                        info!(
                            "📡 Bus {} connected with {} channel(s)",
                            inner.identity,
                            inner.subscriptions.read().len()
                        );
                        session(&inner, conn.as_ref(), delivery_rx, &mut publish_rx, &mut subscribe_rx, &mut shutdown)
                            .await
                    }
                    Err(reason) => SessionEnd::Failed(reason),
                }
            }
            Err(e) => SessionEnd::Failed(format!("connect failed: {e}")),
        };

        let reason = match end {
            SessionEnd::Stopped => return,
            SessionEnd::Failed(reason) => reason,
        };
        inner.set_connection(None);
        inner.degrade(&reason);

        let mut discarded = 0;
        while publish_rx.try_recv().is_ok() {
            discarded += 1;
        }
        for _ in 0..discarded {
            inner.record_dropped_publish("*", "broker connection lost");
        }

        let delay = backoff.next_retry_unbounded();
        bump(&inner.stats.reconnects);
        debug!("Bus {} reconnect #{} in {:?}", inner.identity, backoff.failures(), delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => return,
        }
    }
}

async fn session(
    inner: &BusInner,
    conn: &dyn BrokerConnection,
    mut deliveries: mpsc::Receiver<BrokerDelivery>,
    publish_rx: &mut mpsc::Receiver<Outgoing>,
    subscribe_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut ShutdownListener,
) -> SessionEnd {
    loop {
        tokio::select! {
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => inner.on_delivery(delivery),
                None => return SessionEnd::Failed("delivery stream ended".into()),
            },
            outgoing = publish_rx.recv() => {
                let Some(outgoing) = outgoing else {
                    return SessionEnd::Stopped;
                };
                match conn.publish(&outgoing.channel, &outgoing.payload).await {
                    Ok(()) => bump(&inner.stats.published),
                    Err(e) => {
                        inner.record_dropped_publish(&outgoing.channel, "broker publish failed");
                        return SessionEnd::Failed(format!("publish failed: {e}"));
                    }
                }
            }
            channel = subscribe_rx.recv() => {
                if let Some(channel) = channel {
                    if let Err(reason) = inner.subscribe_with_retry(conn, &channel).await {
                        return SessionEnd::Failed(reason);
                    }
                }
            }
            _ = conn.closed() => return SessionEnd::Failed("broker connection closed".into()),
            _ = shutdown.wait() => return SessionEnd::Stopped,
        }
    }
}
