//! Abstraction over an external publish/subscribe broker.
//!
//! The bus needs very little from a broker: connect, publish bytes to a
//! channel, subscribe to a channel, learn when the connection dies, and
//! receive `(channel, bytes)` deliveries asynchronously.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerDelivery {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Factory for broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Opens a connection whose deliveries are pushed into `deliveries`.
    async fn connect(
        &self,
        deliveries: mpsc::Sender<BrokerDelivery>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Resolves when the connection is lost or closed.
    async fn closed(&self);

    /// Closes the connection. Idempotent.
    fn close(&self);
}
