//! # Interlink
//!
//! Cross-node messaging for a fleet of game servers and the proxy in front
//! of them. Two independent transports share one message model:
//!
//! * [`relay`]: an authenticated, length-framed TCP relay. The proxy runs a
//!   hub, every game node runs a spoke, and DATA frames are forwarded
//!   between them best-effort.
//! * [`bus`]: a resilient pub/sub client with durable subscriptions,
//!   reconnection with backoff, a bounded handler pool and origin filtering.
//!
//! Both report their lifecycle through [`ConnectionState`] and never block
//! application threads on network I/O.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use interlink::{
//!     channel_name, BusSettings, ChannelScope, Envelope, HandlerError, MemoryBroker,
//!     PeerIdentity, PubSubBus,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = PeerIdentity::new("prod", "paper-1")?;
//! let bus = PubSubBus::new(identity, MemoryBroker::new(), BusSettings::default());
//! let channel = channel_name("prod", ChannelScope::Broadcast)?;
//!
//! bus.subscribe(&channel, Arc::new(|_: &str, env: &Envelope| -> Result<(), HandlerError> {
//!     println!("{} from {}", env.message_type(), env.origin_id());
//!     Ok(())
//! }))?;
//! bus.start()?;
//! bus.publish(&channel, &Envelope::new("prod", "paper-1", "player.join", "{}")?)?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bus;
pub mod channels;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod identity;
pub mod relay;
pub mod settings;
pub mod shutdown;
pub mod state;
pub mod throttle;
pub mod transfer;

pub use backoff::{Backoff, ReconnectPolicy};
pub use bus::{
    BrokerConnector, BusStatsSnapshot, MemoryBroker, PubSubBus, RedisBroker, TypeDispatcher,
};
pub use channels::{channel_name, ChannelScope, CHANNEL_PREFIX};
pub use envelope::{message_type, Envelope, MessageMeta, PayloadFormat};
pub use error::{BrokerError, FrameError, HandlerError, MessagingError};
pub use handler::{MessageHandler, RelayHandler};
pub use identity::PeerIdentity;
pub use relay::{LinkEvent, RelayChannel, RelayRole, RelayStatsSnapshot};
pub use settings::{BusSettings, FrameLimits, RedisSettings, RelaySettings};
pub use shutdown::{Shutdown, ShutdownListener};
pub use state::{ConnectionState, StateMachine};
pub use transfer::{compose_transfer_type, TransferStage, TRANSFER_TYPE_PREFIX};
