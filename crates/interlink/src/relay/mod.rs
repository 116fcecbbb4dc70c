//! Authenticated, length-framed TCP relay.
//!
//! Many spokes (game nodes) connect to one hub (the proxy). Each connection
//! must complete a HELLO/WELCOME handshake checking protocol version,
//! environment, shared token and allow-list before DATA frames are routed.
//! The hub forwards DATA between spokes best-effort, at most once.

pub mod codec;
pub mod events;
pub mod framing;
pub mod handshake;
pub mod outbound;
pub mod registry;

mod channel;
mod hub;
mod link;
mod spoke;

pub use channel::{RelayChannel, RelayRole};
pub use codec::{Frame, FrameCodec};
pub use events::{LinkEvent, RelayStatsSnapshot};
pub use outbound::{OutboundItem, OutboundQueue};
pub use registry::{ConnectionRegistry, LinkHandle};
