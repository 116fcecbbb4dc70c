//! Spoke role: dial the hub, keep the link up, drain the outbound queue.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::channel::RelayCore;
use super::codec::Frame;
use super::events::{LinkEvent, RelayStats};
use super::handshake::{Handshake, HandshakeStep};
use super::link::{Inbound, LinkError, LinkIo};
use super::outbound::OutboundQueue;
use crate::shutdown::ShutdownListener;
use crate::state::ConnectionState;

pub(crate) struct SpokeState {
    hub_addr: String,
    pub(crate) queue: OutboundQueue,
    hub_id: Mutex<Option<String>>,
}

impl SpokeState {
    pub(crate) fn new(hub_addr: String, queue: OutboundQueue) -> Self {
        Self {
            hub_addr,
            queue,
            hub_id: Mutex::new(None),
        }
    }

    /// Id of the hub while a link is established.
    pub(crate) fn hub_id(&self) -> Option<String> {
        self.hub_id.lock().clone()
    }

    /// Drops everything queued, counting each item as a dropped send.
    pub(crate) fn discard_pending(&self, core: &RelayCore, why: &str) -> usize {
        let pending = self.queue.drain();
        for item in &pending {
            core.record_drop(&item.target_id, why);
        }
        pending.len()
    }

    /// Discards pending sends, returning how many there were.
    pub(crate) fn close(&self) -> usize {
        let pending = self.queue.len();
        self.queue.clear();
        *self.hub_id.lock() = None;
        pending
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    /// Shutdown was requested.
    Stopped,
    /// An established link went away.
    Lost,
    /// No link was established.
    Failed,
}

/// Supervisor: connect, run the session, back off on failure.
pub(crate) async fn run(core: Arc<RelayCore>, spoke: Arc<SpokeState>) {
    let mut backoff = core.settings.reconnect.backoff();
    let mut shutdown = core.shutdown.listener();

    loop {
        if shutdown.is_triggered() {
            return;
        }
        core.state.transition(ConnectionState::Connecting);
        RelayStats::bump(&core.stats.connect_attempts);

        match session(&core, &spoke, &mut shutdown).await {
            SessionEnd::Stopped => return,
            SessionEnd::Lost => {
                backoff.reset();
            }
            SessionEnd::Failed => {
                let Some(delay) = backoff.next_retry() else {
                    warn!(
                        "Relay spoke {} giving up on {} after {} attempts",
                        core.identity,
                        spoke.hub_addr,
                        backoff.failures()
                    );
                    core.state.transition(ConnectionState::Degraded);
                    let discarded = spoke.discard_pending(&core, "channel degraded");
                    if discarded > 0 {
                        warn!(
                            "Relay spoke {} discarded {} queued message(s) on degrade",
                            core.identity, discarded
                        );
                    }
                    core.emit(LinkEvent::Degraded);
                    return;
                };
                debug!(
                    "Relay spoke {} retry #{} in {:?}",
                    core.identity,
                    backoff.failures(),
                    delay
                );
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

async fn session(core: &RelayCore, spoke: &SpokeState, shutdown: &mut ShutdownListener) -> SessionEnd {
    let connect = tokio::time::timeout(core.settings.idle_timeout, TcpStream::connect(&spoke.hub_addr));
    let stream = tokio::select! {
        res = connect => match res {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return fail(core, format!("connect to {} failed: {}", spoke.hub_addr, e)),
            Err(_) => return fail(core, format!("connect to {} timed out", spoke.hub_addr)),
        },
        _ = shutdown.wait() => return SessionEnd::Stopped,
    };

    let mut link = match LinkIo::new(stream, core.codec, core.settings.idle_timeout) {
        Ok(link) => link,
        Err(e) => return fail(core, format!("socket setup failed: {e}")),
    };
    if let Err(e) = link.send(&core.hello_frame()).await {
        return fail(core, format!("sending HELLO failed: {e}"));
    }

    let hub_id = match await_welcome(core, &mut link, shutdown).await {
        Ok(hub_id) => hub_id,
        Err(end) => {
            link.close().await;
            return end;
        }
    };

    *spoke.hub_id.lock() = Some(hub_id.clone());
    core.state.transition(ConnectionState::Running);
    info!("🤝 Relay spoke {} linked to hub '{}'", core.identity, hub_id);
    core.emit(LinkEvent::Established {
        peer_id: hub_id.clone(),
    });

    let end = established(core, spoke, &mut link, shutdown).await;

    *spoke.hub_id.lock() = None;
    link.close().await;
    if matches!(end, SessionEnd::Lost) {
        info!("Relay spoke {} lost link to hub '{}'", core.identity, hub_id);
        core.emit(LinkEvent::Disconnected { peer_id: hub_id });
    }
    end
}

async fn await_welcome(
    core: &RelayCore,
    link: &mut LinkIo,
    shutdown: &mut ShutdownListener,
) -> Result<String, SessionEnd> {
    let input = tokio::select! {
        input = link.recv() => input,
        _ = shutdown.wait() => return Err(SessionEnd::Stopped),
    };
    let frame = match input {
        Inbound::Frame(frame) => frame,
        Inbound::Failed(reason) => return Err(fail(core, reason)),
        Inbound::Closed => return Err(fail(core, "hub closed the connection during handshake".into())),
        Inbound::IdleTimeout => return Err(fail(core, "no WELCOME before idle timeout".into())),
    };

    let allowed = core.allowed_snapshot();
    let mut handshake = Handshake::spoke();
    match handshake.on_frame(frame, &core.handshake_context(&allowed)) {
        HandshakeStep::Established { peer_id } => Ok(peer_id),
        HandshakeStep::Rejected { reason } => {
            RelayStats::bump(&core.stats.rejected_handshakes);
            warn!("🚫 Relay hub rejected {}: {}", core.identity, reason);
            core.emit(LinkEvent::Rejected {
                peer_id: None,
                reason,
            });
            Err(SessionEnd::Failed)
        }
        HandshakeStep::Violation { reason } => Err(fail(core, reason)),
        other => Err(fail(core, format!("unexpected handshake step {other:?}"))),
    }
}

async fn established(
    core: &RelayCore,
    spoke: &SpokeState,
    link: &mut LinkIo,
    shutdown: &mut ShutdownListener,
) -> SessionEnd {
    if let Err(e) = flush(core, spoke, link).await {
        warn!("Relay spoke {} write failed: {}", core.identity, e);
        return SessionEnd::Lost;
    }

    loop {
        tokio::select! {
            input = link.recv() => match input {
                Inbound::Frame(Frame::Data { target_id, source_id, payload }) => {
                    if target_id == core.server_id() {
                        core.deliver_local(&source_id, &payload);
                    } else {
                        RelayStats::bump(&core.stats.unroutable_frames);
                        warn!("Dropping DATA for '{}' delivered to {}", target_id, core.identity);
                    }
                }
                Inbound::Frame(other) => {
                    warn!("Closing hub link: unexpected {} frame", other.kind());
                    return SessionEnd::Lost;
                }
                Inbound::Failed(reason) => {
                    warn!("Closing hub link: {}", reason);
                    return SessionEnd::Lost;
                }
                Inbound::Closed => return SessionEnd::Lost,
                Inbound::IdleTimeout => {
                    info!("Closing idle hub link for {}", core.identity);
                    return SessionEnd::Lost;
                }
            },
            _ = spoke.queue.ready() => {
                if let Err(e) = flush(core, spoke, link).await {
                    warn!("Relay spoke {} write failed: {}", core.identity, e);
                    return SessionEnd::Lost;
                }
            }
            _ = shutdown.wait() => return SessionEnd::Stopped,
        }
    }
}

/// Writes every queued item, oldest first. Items taken from the queue but
/// not written when the link fails count as dropped sends.
async fn flush(core: &RelayCore, spoke: &SpokeState, link: &mut LinkIo) -> Result<(), LinkError> {
    let mut pending = spoke.queue.drain().into_iter();
    while let Some(item) = pending.next() {
        let target_id = item.target_id;
        let frame = Frame::Data {
            target_id: target_id.clone(),
            source_id: core.server_id().to_string(),
            payload: item.payload,
        };
        let body = match link.codec().encode(&frame) {
            Ok(body) => body,
            Err(e) => {
                warn!("Dropping unsendable DATA from {}: {}", core.identity, e);
                continue;
            }
        };
        if let Err(e) = link.send_raw(&body).await {
            core.record_drop(&target_id, "hub link failed");
            for lost in pending {
                core.record_drop(&lost.target_id, "hub link failed");
            }
            return Err(e);
        }
    }
    Ok(())
}

fn fail(core: &RelayCore, reason: String) -> SessionEnd {
    warn!("Relay spoke {} connection attempt failed: {}", core.identity, reason);
    core.emit(LinkEvent::Failed { reason });
    SessionEnd::Failed
}
