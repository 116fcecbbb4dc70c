//! Relay handshake state machine.
//!
//! The hub starts in [`HandshakePhase::AwaitingHello`], the spoke in
//! [`HandshakePhase::AwaitingWelcome`]. The first acceptable frame moves the
//! connection to `Established`; anything else closes it. This module is pure:
//! it decides, the connection tasks act.

use std::collections::BTreeSet;

use super::codec::Frame;
use crate::identity::PeerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    AwaitingHello,
    AwaitingWelcome,
    Established,
    Closed,
}

/// What this node expects from its peer.
#[derive(Debug, Clone)]
pub struct HandshakeContext<'a> {
    pub identity: &'a PeerIdentity,
    pub token: &'a str,
    pub allowed_peers: &'a BTreeSet<String>,
    pub protocol_version: u32,
}

/// Decision for one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Hub: register `peer_id` and reply WELCOME.
    Accept { peer_id: String },
    /// Hub: reply REJECT with `reason` and close.
    Reject {
        peer_id: Option<String>,
        reason: String,
    },
    /// Spoke: the hub welcomed us.
    Established { peer_id: String },
    /// Spoke: the hub refused us.
    Rejected { reason: String },
    /// Either side: close without reply.
    Violation { reason: String },
}

#[derive(Debug)]
pub struct Handshake {
    phase: HandshakePhase,
}

impl Handshake {
    pub fn hub() -> Self {
        Self {
            phase: HandshakePhase::AwaitingHello,
        }
    }

    pub fn spoke() -> Self {
        Self {
            phase: HandshakePhase::AwaitingWelcome,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == HandshakePhase::Established
    }

    pub fn close(&mut self) {
        self.phase = HandshakePhase::Closed;
    }

    /// Feeds one frame received before the link is established.
    pub fn on_frame(&mut self, frame: Frame, ctx: &HandshakeContext<'_>) -> HandshakeStep {
        let step = match (self.phase, frame) {
            (
                HandshakePhase::AwaitingHello,
                Frame::Hello {
                    protocol_version,
                    environment,
                    server_id,
                    token,
                },
            ) => check_hello(ctx, protocol_version, &environment, &server_id, &token),
            (
                HandshakePhase::AwaitingWelcome,
                Frame::Welcome {
                    protocol_version,
                    environment,
                    server_id,
                },
            ) => check_welcome(ctx, protocol_version, &environment, &server_id),
            (HandshakePhase::AwaitingWelcome, Frame::Reject { reason }) => {
                HandshakeStep::Rejected { reason }
            }
            (phase, frame) => HandshakeStep::Violation {
                reason: format!("unexpected {} frame while {:?}", frame.kind(), phase),
            },
        };
        self.phase = match step {
            HandshakeStep::Accept { .. } | HandshakeStep::Established { .. } => {
                HandshakePhase::Established
            }
            _ => HandshakePhase::Closed,
        };
        step
    }
}

fn check_hello(
    ctx: &HandshakeContext<'_>,
    protocol_version: u32,
    environment: &str,
    server_id: &str,
    token: &str,
) -> HandshakeStep {
    let peer_id = (!server_id.trim().is_empty()).then(|| server_id.to_string());
    let reject = |reason: String| HandshakeStep::Reject {
        peer_id: peer_id.clone(),
        reason,
    };

    if protocol_version != ctx.protocol_version {
        return reject(format!(
            "protocol version mismatch: expected {}, got {}",
            ctx.protocol_version, protocol_version
        ));
    }
    if environment != ctx.identity.environment() {
        return reject(format!(
            "environment mismatch: expected '{}', got '{}'",
            ctx.identity.environment(),
            environment
        ));
    }
    if !constant_time_eq(token.as_bytes(), ctx.token.as_bytes()) {
        return reject("invalid token".to_string());
    }
    let Some(id) = peer_id.clone() else {
        return reject("server id must not be blank".to_string());
    };
    if !ctx.allowed_peers.contains(&id) {
        return reject(format!("server '{id}' is not allowed"));
    }
    if id == ctx.identity.server_id() {
        return reject(format!("server '{id}' claims the hub's own id"));
    }
    HandshakeStep::Accept { peer_id: id }
}

fn check_welcome(
    ctx: &HandshakeContext<'_>,
    protocol_version: u32,
    environment: &str,
    server_id: &str,
) -> HandshakeStep {
    if protocol_version != ctx.protocol_version {
        return HandshakeStep::Violation {
            reason: format!(
                "hub protocol version {} does not match {}",
                protocol_version, ctx.protocol_version
            ),
        };
    }
    if environment != ctx.identity.environment() {
        return HandshakeStep::Violation {
            reason: format!("hub environment '{environment}' does not match"),
        };
    }
    if !ctx.allowed_peers.contains(server_id) {
        return HandshakeStep::Violation {
            reason: format!("hub '{server_id}' is not in the allow-list"),
        };
    }
    HandshakeStep::Established {
        peer_id: server_id.to_string(),
    }
}

/// Compares secrets without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        identity: PeerIdentity,
        allowed: BTreeSet<String>,
    }

    impl Fixture {
        fn hub() -> Self {
            Self {
                identity: PeerIdentity::new("prod", "velocity").unwrap(),
                allowed: ["paper-1".to_string(), "velocity".to_string()].into(),
            }
        }

        fn ctx(&self) -> HandshakeContext<'_> {
            HandshakeContext {
                identity: &self.identity,
                token: "t1",
                allowed_peers: &self.allowed,
                protocol_version: 1,
            }
        }
    }

    fn hello(version: u32, env: &str, id: &str, token: &str) -> Frame {
        Frame::Hello {
            protocol_version: version,
            environment: env.into(),
            server_id: id.into(),
            token: token.into(),
        }
    }

    #[test]
    fn test_hub_accepts_valid_hello() {
        let fixture = Fixture::hub();
        let mut handshake = Handshake::hub();
        let step = handshake.on_frame(hello(1, "prod", "paper-1", "t1"), &fixture.ctx());
        assert_eq!(
            step,
            HandshakeStep::Accept {
                peer_id: "paper-1".into()
            }
        );
        assert!(handshake.is_established());
    }

    #[test]
    fn test_hub_rejects_mismatches() {
        let fixture = Fixture::hub();
        let cases = [
            hello(2, "prod", "paper-1", "t1"),
            hello(1, "staging", "paper-1", "t1"),
            hello(1, "prod", "paper-1", "t2"),
            hello(1, "prod", "paper-9", "t1"),
            hello(1, "prod", "velocity", "t1"),
            hello(1, "prod", "", "t1"),
        ];
        for frame in cases {
            let mut handshake = Handshake::hub();
            let step = handshake.on_frame(frame.clone(), &fixture.ctx());
            assert!(
                matches!(step, HandshakeStep::Reject { .. }),
                "{frame:?} gave {step:?}"
            );
            assert_eq!(handshake.phase(), HandshakePhase::Closed);
        }
    }

    #[test]
    fn test_unexpected_frames_are_violations() {
        let fixture = Fixture::hub();
        let data = Frame::Data {
            target_id: "velocity".into(),
            source_id: "paper-1".into(),
            payload: vec![],
        };
        let mut hub = Handshake::hub();
        assert!(matches!(
            hub.on_frame(data.clone(), &fixture.ctx()),
            HandshakeStep::Violation { .. }
        ));

        let mut spoke = Handshake::spoke();
        assert!(matches!(
            spoke.on_frame(hello(1, "prod", "velocity", "t1"), &fixture.ctx()),
            HandshakeStep::Violation { .. }
        ));
    }

    #[test]
    fn test_spoke_validates_welcome() {
        let identity = PeerIdentity::new("prod", "paper-1").unwrap();
        let allowed: BTreeSet<String> = ["velocity".to_string()].into();
        let ctx = HandshakeContext {
            identity: &identity,
            token: "t1",
            allowed_peers: &allowed,
            protocol_version: 1,
        };
        let welcome = |id: &str, env: &str| Frame::Welcome {
            protocol_version: 1,
            environment: env.into(),
            server_id: id.into(),
        };

        let mut ok = Handshake::spoke();
        assert_eq!(
            ok.on_frame(welcome("velocity", "prod"), &ctx),
            HandshakeStep::Established {
                peer_id: "velocity".into()
            }
        );

        let mut stranger = Handshake::spoke();
        assert!(matches!(
            stranger.on_frame(welcome("rogue", "prod"), &ctx),
            HandshakeStep::Violation { .. }
        ));

        let mut rejected = Handshake::spoke();
        assert_eq!(
            rejected.on_frame(Frame::Reject { reason: "invalid token".into() }, &ctx),
            HandshakeStep::Rejected {
                reason: "invalid token".into()
            }
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }
}
