//! The point-to-point relay channel.
//!
//! A [`RelayChannel`] runs in one of two roles:
//!
//! * **Hub** binds a listener, handshakes every inbound connection and
//!   routes DATA frames between registered spokes.
//! * **Spoke** dials the hub, reconnects with exponential backoff and
//!   buffers outbound sends in a bounded drop-oldest queue.
//!
//! `send` never blocks in either role. Connectivity problems show up in
//! [`state`](RelayChannel::state), [`events`](RelayChannel::events) and
//! [`stats`](RelayChannel::stats), never as errors to the sender.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::codec::{Frame, FrameCodec};
use super::events::{LinkEvent, RelayStats, RelayStatsSnapshot};
use super::handshake::HandshakeContext;
use super::hub::{self, HubState};
use super::outbound::{OutboundItem, OutboundQueue};
use super::spoke::{self, SpokeState};
use crate::envelope::Envelope;
use crate::error::{require_non_blank, MessagingError};
use crate::handler::{invoke_guarded, RelayHandler};
use crate::identity::PeerIdentity;
use crate::settings::{normalize_peers, RelaySettings};
use crate::state::{ConnectionState, StartOutcome, StateMachine};
use crate::shutdown::Shutdown;

const EVENT_BUFFER: usize = 64;

/// Which side of the relay a channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Hub,
    Spoke,
}

impl fmt::Display for RelayRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayRole::Hub => f.write_str("hub"),
            RelayRole::Spoke => f.write_str("spoke"),
        }
    }
}

/// State shared between a channel and its background tasks.
pub(crate) struct RelayCore {
    pub(crate) identity: PeerIdentity,
    pub(crate) settings: RelaySettings,
    pub(crate) allowed_peers: RwLock<BTreeSet<String>>,
    pub(crate) codec: FrameCodec,
    pub(crate) state: StateMachine,
    pub(crate) shutdown: Shutdown,
    pub(crate) stats: RelayStats,
    events: broadcast::Sender<LinkEvent>,
    handler: Arc<dyn RelayHandler>,
}

impl RelayCore {
    fn new(
        role: RelayRole,
        identity: PeerIdentity,
        settings: RelaySettings,
        handler: Arc<dyn RelayHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: StateMachine::new("relay channel", format!("{role} {identity}")),
            allowed_peers: RwLock::new(settings.allowed_peers.clone()),
            codec: FrameCodec::new(settings.limits),
            stats: RelayStats::new(settings.drop_warn_threshold),
            shutdown: Shutdown::new(),
            identity,
            settings,
            events,
            handler,
        }
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn server_id(&self) -> &str {
        self.identity.server_id()
    }

    /// Snapshot of the allow-list for one handshake.
    pub(crate) fn allowed_snapshot(&self) -> BTreeSet<String> {
        self.allowed_peers.read().clone()
    }

    pub(crate) fn handshake_context<'a>(&'a self, allowed: &'a BTreeSet<String>) -> HandshakeContext<'a> {
        HandshakeContext {
            identity: &self.identity,
            token: &self.settings.token,
            allowed_peers: allowed,
            protocol_version: self.settings.protocol_version,
        }
    }

    pub(crate) fn hello_frame(&self) -> Frame {
        Frame::Hello {
            protocol_version: self.settings.protocol_version,
            environment: self.identity.environment().to_string(),
            server_id: self.identity.server_id().to_string(),
            token: self.settings.token.clone(),
        }
    }

    pub(crate) fn welcome_frame(&self) -> Frame {
        Frame::Welcome {
            protocol_version: self.settings.protocol_version,
            environment: self.identity.environment().to_string(),
            server_id: self.identity.server_id().to_string(),
        }
    }

    /// Hands a payload addressed to this node to the application handler.
    pub(crate) fn deliver_local(&self, source_id: &str, payload: &[u8]) {
        RelayStats::bump(&self.stats.delivered_frames);
        invoke_guarded(&format!("relay data from '{source_id}'"), || {
            self.handler.on_data(source_id, payload)
        });
    }

    /// Counts a dropped send, warning on the first and every N-th drop.
    pub(crate) fn record_drop(&self, target_id: &str, why: &str) {
        if let Some(total) = self.stats.dropped_sends.record() {
            warn!(
                "⚠️ Relay {} dropped message for '{}' ({}); {} dropped so far",
                self.identity, target_id, why, total
            );
        }
    }
}

enum RoleState {
    Hub(Arc<HubState>),
    Spoke(Arc<SpokeState>),
}

/// A relay endpoint in the hub or spoke role.
///
/// Dropping the channel stops it.
pub struct RelayChannel {
    core: Arc<RelayCore>,
    role: RoleState,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RelayChannel {
    /// Creates a hub that will listen on `bind_addr` (e.g. `"0.0.0.0:7000"`).
    ///
    /// # Arguments
    ///
    /// * `identity` - This hub's environment and server id
    /// * `bind_addr` - Address to listen on; port 0 picks a free port
    /// * `settings` - Token, allow-list of spokes, limits and timeouts
    /// * `handler` - Receives DATA addressed to the hub itself
    pub fn hub<H: RelayHandler>(
        identity: PeerIdentity,
        bind_addr: impl Into<String>,
        settings: RelaySettings,
        handler: H,
    ) -> Self {
        let core = RelayCore::new(RelayRole::Hub, identity, settings, Arc::new(handler));
        Self {
            core: Arc::new(core),
            role: RoleState::Hub(Arc::new(HubState::new(bind_addr.into()))),
            supervisor: Mutex::new(None),
        }
    }

    /// Creates a spoke that will dial the hub at `hub_addr`.
    ///
    /// The allow-list in `settings` must contain the hub's server id.
    pub fn spoke<H: RelayHandler>(
        identity: PeerIdentity,
        hub_addr: impl Into<String>,
        settings: RelaySettings,
        handler: H,
    ) -> Self {
        let queue = OutboundQueue::new(settings.outbound_queue_capacity);
        let core = RelayCore::new(RelayRole::Spoke, identity, settings, Arc::new(handler));
        Self {
            core: Arc::new(core),
            role: RoleState::Spoke(Arc::new(SpokeState::new(hub_addr.into(), queue))),
            supervisor: Mutex::new(None),
        }
    }

    pub fn role(&self) -> RelayRole {
        match self.role {
            RoleState::Hub(_) => RelayRole::Hub,
            RoleState::Spoke(_) => RelayRole::Spoke,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.core.identity
    }

    /// Starts the background supervisor. Calling it again while running is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// * [`MessagingError::Stopped`] if the channel was stopped before
    /// * [`MessagingError::NoRuntime`] outside a tokio runtime
    pub fn start(&self) -> Result<(), MessagingError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MessagingError::NoRuntime(e.to_string()))?;
        if self.core.state.begin()? == StartOutcome::AlreadyStarted {
            return Ok(());
        }

        info!("🚀 Starting relay {} {}", self.role(), self.core.identity);
        let core = self.core.clone();
        let task = match &self.role {
            RoleState::Hub(hub) => runtime.spawn(hub::run(core, hub.clone())),
            RoleState::Spoke(spoke) => runtime.spawn(spoke::run(core, spoke.clone())),
        };
        *self.supervisor.lock() = Some(task);
        Ok(())
    }

    /// Stops the channel for good: cancels reconnects, closes every link and
    /// discards queued sends. Idempotent.
    pub fn stop(&self) {
        let was_started = self.core.state.is_started();
        if !self.core.state.shutdown() {
            return;
        }
        self.core.shutdown.trigger();
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }

        match &self.role {
            RoleState::Hub(hub) => hub.close(),
            RoleState::Spoke(spoke) => {
                let pending = spoke.close();
                if pending > 0 {
                    warn!("Relay {} discarded {} queued message(s) on stop", self.core.identity, pending);
                }
            }
        }

        if was_started {
            info!("🛑 Relay {} {} stopped", self.role(), self.core.identity);
        }
    }

    /// Sends `payload` to `target_id` without blocking.
    ///
    /// * Hub: delivers locally if `target_id` is the hub's id, otherwise
    ///   forwards to the connected spoke or drops if it is not connected.
    /// * Spoke: queues for the hub (drop-oldest when full); drops if the
    ///   channel is degraded.
    ///
    /// # Errors
    ///
    /// Only caller misuse: a blank target or a stopped channel.
    pub fn send(&self, target_id: &str, payload: impl Into<Vec<u8>>) -> Result<(), MessagingError> {
        require_non_blank(target_id, "targetId")?;
        self.core.state.ensure_usable()?;
        let payload = payload.into();

        match &self.role {
            RoleState::Hub(hub) => {
                hub.route(&self.core, self.core.server_id(), target_id, payload);
            }
            RoleState::Spoke(spoke) => {
                if self.core.state.state() == ConnectionState::Degraded {
                    self.core.record_drop(target_id, "channel degraded");
                    return Ok(());
                }
                let evicted = spoke.queue.push(OutboundItem {
                    target_id: target_id.to_string(),
                    payload,
                });
                if let Some(evicted) = evicted {
                    if let Some(total) = self.core.stats.queue_evictions.record() {
                        warn!(
                            "⚠️ Relay outbound queue full (capacity {}); evicted oldest message for '{}', {} evicted so far",
                            spoke.queue.capacity(),
                            evicted.target_id,
                            total
                        );
                    }
                }
                // Degraded between the check above and the push.
                if self.core.state.state() == ConnectionState::Degraded {
                    spoke.discard_pending(&self.core, "channel degraded");
                }
            }
        }
        Ok(())
    }

    /// Serializes `envelope` as JSON and sends it like [`send`](Self::send).
    pub fn send_envelope(&self, target_id: &str, envelope: &Envelope) -> Result<(), MessagingError> {
        let bytes = envelope.to_bytes()?;
        self.send(target_id, bytes)
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state.state()
    }

    /// True while the hub is listening or the spoke holds an established link.
    pub fn is_available(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Waits up to `timeout` for the channel to reach `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        self.core.state.wait_for(target, timeout).await
    }

    /// Subscribes to connection outcomes from now on.
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.core.events.subscribe()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Replaces the allow-list used by future handshakes.
    pub fn update_allowed_peers<I, S>(&self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = normalize_peers(peers);
        info!("Relay {} allow-list updated: {:?}", self.core.identity, peers);
        *self.core.allowed_peers.write() = peers;
    }

    pub fn allowed_peers(&self) -> BTreeSet<String> {
        self.core.allowed_snapshot()
    }

    /// Address the hub is bound to, once listening. Always `None` for spokes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            RoleState::Hub(hub) => hub.local_addr(),
            RoleState::Spoke(_) => None,
        }
    }

    /// Ids of peers with an established link.
    pub fn connected_peers(&self) -> Vec<String> {
        match &self.role {
            RoleState::Hub(hub) => hub.registry.peer_ids(),
            RoleState::Spoke(spoke) => spoke.hub_id().into_iter().collect(),
        }
    }

    /// Messages waiting in the spoke's outbound queue, oldest first.
    pub fn queued(&self) -> Vec<OutboundItem> {
        match &self.role {
            RoleState::Hub(_) => Vec::new(),
            RoleState::Spoke(spoke) => spoke.queue.snapshot(),
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChannel")
            .field("role", &self.role())
            .field("identity", &self.core.identity)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;

    fn noop() -> impl RelayHandler {
        |_: &str, _: &[u8]| -> Result<(), HandlerError> { Ok(()) }
    }

    fn spoke(capacity: usize) -> RelayChannel {
        RelayChannel::spoke(
            PeerIdentity::new("prod", "paper-1").unwrap(),
            "127.0.0.1:1",
            RelaySettings::new("t1")
                .allowed_peers(["velocity"])
                .outbound_queue_capacity(capacity),
            noop(),
        )
    }

    #[test]
    fn test_queue_keeps_latest_while_disconnected() {
        let channel = spoke(2);
        for payload in ["p1", "p2", "p3"] {
            channel.send("x", payload.as_bytes()).unwrap();
        }
        let queued: Vec<_> = channel.queued().into_iter().map(|item| item.payload).collect();
        assert_eq!(queued, vec![b"p2".to_vec(), b"p3".to_vec()]);
        assert_eq!(channel.stats().queue_evictions, 1);
    }

    #[test]
    fn test_blank_target_rejected() {
        let channel = spoke(2);
        assert!(matches!(channel.send(" ", vec![1]), Err(MessagingError::Blank("targetId"))));
    }

    #[test]
    fn test_start_requires_runtime() {
        let channel = spoke(2);
        assert!(matches!(channel.start(), Err(MessagingError::NoRuntime(_))));
        assert_eq!(channel.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_stopped_channel_refuses_use() {
        let channel = spoke(2);
        channel.stop();
        channel.stop();
        assert!(matches!(channel.send("x", vec![1]), Err(MessagingError::Stopped(_))));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            assert!(matches!(channel.start(), Err(MessagingError::Stopped(_))));
        });
    }

    #[test]
    fn test_hub_local_loop_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hub = RelayChannel::hub(
            PeerIdentity::new("prod", "velocity").unwrap(),
            "127.0.0.1:0",
            RelaySettings::new("t1"),
            move |source: &str, payload: &[u8]| -> Result<(), HandlerError> {
                sink.lock().push((source.to_string(), payload.to_vec()));
                Ok(())
            },
        );
        hub.send("velocity", b"self".to_vec()).unwrap();
        hub.send("paper-9", b"nobody".to_vec()).unwrap();

        assert_eq!(*seen.lock(), vec![("velocity".to_string(), b"self".to_vec())]);
        assert_eq!(hub.stats().unroutable_frames, 1);
    }

    #[test]
    fn test_update_allowed_peers() {
        let channel = spoke(1);
        channel.update_allowed_peers(["velocity", " lobby "]);
        assert_eq!(
            channel.allowed_peers().into_iter().collect::<Vec<_>>(),
            vec!["lobby".to_string(), "velocity".to_string()]
        );
    }
}
