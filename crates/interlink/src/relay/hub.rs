//! Hub role: accept spokes, handshake them, route DATA between them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::channel::RelayCore;
use super::codec::Frame;
use super::events::{LinkEvent, RelayStats};
use super::handshake::{Handshake, HandshakeStep};
use super::link::{Inbound, LinkIo};
use super::registry::{ConnectionRegistry, LinkHandle, LinkSendError};
use crate::shutdown::ShutdownListener;
use crate::state::ConnectionState;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

pub(crate) struct HubState {
    bind_addr: String,
    pub(crate) registry: ConnectionRegistry,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HubState {
    pub(crate) fn new(bind_addr: String) -> Self {
        Self {
            bind_addr,
            registry: ConnectionRegistry::new(),
            local_addr: Mutex::new(None),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) fn close(&self) {
        self.registry.close_all();
        *self.local_addr.lock() = None;
    }

    /// Routes one DATA message: local delivery for the hub's own id,
    /// otherwise best-effort forward to the target's live link.
    pub(crate) fn route(&self, core: &RelayCore, source_id: &str, target_id: &str, payload: Vec<u8>) {
        if target_id == core.server_id() {
            core.deliver_local(source_id, &payload);
            return;
        }

        let Some(link) = self.registry.find(target_id).filter(LinkHandle::is_live) else {
            RelayStats::bump(&core.stats.unroutable_frames);
            warn!("No live link for '{}'; dropping DATA from '{}'", target_id, source_id);
            return;
        };

        let frame = Frame::Data {
            target_id: target_id.to_string(),
            source_id: source_id.to_string(),
            payload,
        };
        let body = match core.codec.encode(&frame) {
            Ok(body) => body,
            Err(e) => {
                warn!("Cannot forward DATA from '{}' to '{}': {}", source_id, target_id, e);
                return;
            }
        };
        match link.send_frame(body) {
            Ok(()) => {
                RelayStats::bump(&core.stats.forwarded_frames);
            }
            Err(LinkSendError::Full) => core.record_drop(target_id, "link buffer full"),
            Err(LinkSendError::Closed) => {
                RelayStats::bump(&core.stats.unroutable_frames);
                warn!("Link for '{}' closed; dropping DATA from '{}'", target_id, source_id);
            }
        }
    }
}

/// Supervisor: bind with backoff, then accept until shutdown.
pub(crate) async fn run(core: Arc<RelayCore>, hub: Arc<HubState>) {
    let mut backoff = core.settings.reconnect.backoff();
    let mut shutdown = core.shutdown.listener();

    loop {
        if shutdown.is_triggered() {
            return;
        }
        core.state.transition(ConnectionState::Connecting);
        RelayStats::bump(&core.stats.connect_attempts);

        match TcpListener::bind(&hub.bind_addr).await {
            Ok(listener) => {
                let addr = listener.local_addr().ok();
                *hub.local_addr.lock() = addr;
                backoff.reset();
                core.state.transition(ConnectionState::Running);
                info!("🌐 Relay hub {} listening on {:?}", core.identity, addr);
                accept_loop(&core, &hub, listener, &mut shutdown).await;
                return;
            }
            Err(e) => {
                let reason = format!("bind {} failed: {}", hub.bind_addr, e);
                warn!("Relay hub {}: {}", core.identity, reason);
                core.emit(LinkEvent::Failed { reason });
                let Some(delay) = backoff.next_retry() else {
                    warn!(
                        "Relay hub {} giving up after {} bind attempts",
                        core.identity,
                        backoff.failures()
                    );
                    core.state.transition(ConnectionState::Degraded);
                    core.emit(LinkEvent::Degraded);
                    return;
                };
                core.emit(LinkEvent::RetryScheduled {
                    attempt: backoff.failures(),
                    delay,
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait() => return,
                }
            }
        }
    }
}

async fn accept_loop(
    core: &Arc<RelayCore>,
    hub: &Arc<HubState>,
    listener: TcpListener,
    shutdown: &mut ShutdownListener,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted relay connection from {}", addr);
                    tokio::spawn(handle_connection(core.clone(), hub.clone(), stream, addr));
                }
                Err(e) => {
                    warn!("Relay hub accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
            _ = shutdown.wait() => break,
        }
    }
}

async fn handle_connection(core: Arc<RelayCore>, hub: Arc<HubState>, stream: TcpStream, addr: SocketAddr) {
    let mut shutdown = core.shutdown.listener();
    if shutdown.is_triggered() {
        return;
    }
    let mut link = match LinkIo::new(stream, core.codec, core.settings.idle_timeout) {
        Ok(link) => link,
        Err(e) => {
            warn!("Dropping relay connection from {}: {}", addr, e);
            return;
        }
    };

    let Some(peer_id) = await_hello(&core, &mut link, &mut shutdown).await else {
        link.close().await;
        return;
    };

    let (handle, mut outbound) = LinkHandle::new(addr, core.settings.outbound_queue_capacity);
    if shutdown.is_triggered() {
        link.close().await;
        return;
    }
    hub.registry.register(&peer_id, handle.clone());
    if let Err(e) = link.send(&core.welcome_frame()).await {
        warn!("Failed to welcome '{}' ({}): {}", peer_id, addr, e);
        hub.registry.remove(&handle);
        handle.close();
        core.emit(LinkEvent::Failed {
            reason: format!("welcome to '{peer_id}' failed: {e}"),
        });
        return;
    }
    info!("🤝 Relay link established with '{}' ({})", peer_id, addr);
    core.emit(LinkEvent::Established {
        peer_id: peer_id.clone(),
    });

    loop {
        tokio::select! {
            input = link.recv() => match input {
                Inbound::Frame(Frame::Data { target_id, source_id, payload }) => {
                    on_data(&core, &hub, &peer_id, &handle, target_id, source_id, payload);
                }
                Inbound::Frame(other) => {
                    warn!("Closing link to '{}': unexpected {} frame", peer_id, other.kind());
                    break;
                }
                Inbound::Failed(reason) => {
                    warn!("Closing link to '{}': {}", peer_id, reason);
                    break;
                }
                Inbound::Closed => {
                    debug!("'{}' closed its relay link", peer_id);
                    break;
                }
                Inbound::IdleTimeout => {
                    info!("Closing idle relay link to '{}'", peer_id);
                    break;
                }
            },
            body = outbound.recv() => match body {
                Some(body) => {
                    if let Err(e) = link.send_raw(&body).await {
                        warn!("Write to '{}' failed: {}", peer_id, e);
                        break;
                    }
                }
                None => break,
            },
            _ = handle.closed() => {
                debug!("Link #{} for '{}' closed by registry", handle.id(), peer_id);
                break;
            }
            _ = shutdown.wait() => break,
        }
    }

    hub.registry.remove(&handle);
    handle.close();
    link.close().await;
    info!("Relay link to '{}' ({}) closed", peer_id, addr);
    core.emit(LinkEvent::Disconnected { peer_id });
}

/// Runs the hub side of the handshake. Returns the accepted peer id.
async fn await_hello(core: &RelayCore, link: &mut LinkIo, shutdown: &mut ShutdownListener) -> Option<String> {
    let addr = link.peer_addr();
    let input = tokio::select! {
        input = link.recv() => input,
        _ = shutdown.wait() => return None,
    };

    let frame = match input {
        Inbound::Frame(frame) => frame,
        Inbound::Failed(reason) => return fail(core, addr, reason),
        Inbound::Closed => return fail(core, addr, "closed before HELLO".to_string()),
        Inbound::IdleTimeout => return fail(core, addr, "no HELLO before idle timeout".to_string()),
    };

    let allowed = core.allowed_snapshot();
    let mut handshake = Handshake::hub();
    match handshake.on_frame(frame, &core.handshake_context(&allowed)) {
        HandshakeStep::Accept { peer_id } => Some(peer_id),
        HandshakeStep::Reject { peer_id, reason } => {
            RelayStats::bump(&core.stats.rejected_handshakes);
            warn!("🚫 Rejecting relay peer {:?} from {}: {}", peer_id, addr, reason);
            if let Err(e) = link.send(&Frame::Reject { reason: reason.clone() }).await {
                debug!("Could not deliver REJECT to {}: {}", addr, e);
            }
            core.emit(LinkEvent::Rejected { peer_id, reason });
            None
        }
        HandshakeStep::Violation { reason } => fail(core, addr, reason),
        other => fail(core, addr, format!("unexpected handshake step {other:?}")),
    }
}

fn fail(core: &RelayCore, addr: SocketAddr, reason: String) -> Option<String> {
    warn!("Relay handshake with {} failed: {}", addr, reason);
    core.emit(LinkEvent::Failed { reason });
    None
}

/// Anti-spoofing checks, then routing.
fn on_data(
    core: &RelayCore,
    hub: &HubState,
    peer_id: &str,
    handle: &LinkHandle,
    target_id: String,
    source_id: String,
    payload: Vec<u8>,
) {
    if !hub.registry.is_current(peer_id, handle) {
        RelayStats::bump(&core.stats.spoofed_frames);
        warn!(
            "Dropping DATA from stale link #{} for '{}'",
            handle.id(),
            peer_id
        );
        return;
    }
    if source_id != peer_id {
        RelayStats::bump(&core.stats.spoofed_frames);
        warn!(
            "🚨 Dropping spoofed DATA: link '{}' claimed source '{}'",
            peer_id, source_id
        );
        return;
    }
    hub.route(core, &source_id, &target_id, payload);
}
