//! Resilient publish/subscribe bus over an external broker.
//!
//! The broker itself sits behind [`BrokerConnector`]. [`RedisBroker`] talks
//! to a Redis server; [`MemoryBroker`] is the in-process implementation.

pub mod broker;
pub mod dispatcher;
pub mod memory;
pub mod pool;
pub mod redis_broker;

mod client;

pub use client::{accepts_origin, BusStatsSnapshot, PubSubBus};
pub use broker::{BrokerConnection, BrokerConnector, BrokerDelivery};
pub use dispatcher::TypeDispatcher;
pub use memory::MemoryBroker;
pub use pool::{Submission, WorkerPool};
pub use redis_broker::RedisBroker;
