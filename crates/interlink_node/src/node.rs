//! Wires one relay endpoint and one bus from a [`NodeConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use interlink::{
    channel_name, message_type, BusStatsSnapshot, ChannelScope, ConnectionState, Envelope,
    BrokerConnector, HandlerError, MessageHandler, PubSubBus, RelayChannel, RelayStatsSnapshot,
    TransferStage, TypeDispatcher,
};
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, NodeRole};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Node {
    config: NodeConfig,
    relay: Option<RelayChannel>,
    bus: Option<PubSubBus>,
    dispatcher: Arc<TypeDispatcher>,
}

impl Node {
    /// Builds the engines without starting them. The bus talks to `broker`.
    pub fn new(config: NodeConfig, broker: Arc<dyn BrokerConnector>) -> anyhow::Result<Self> {
        let identity = config.identity()?;

        let relay = config.relay.enabled.then(|| {
            let settings = config.relay_settings();
            let address = config.relay.address.clone();
            match config.node.role {
                NodeRole::Hub => RelayChannel::hub(identity.clone(), address, settings, log_relay_data),
                NodeRole::Spoke => RelayChannel::spoke(identity.clone(), address, settings, log_relay_data),
            }
        });

        let dispatcher = Arc::new(TypeDispatcher::new());
        let transfer_log: Arc<dyn MessageHandler> = Arc::new(log_transfer);
        for stage in TransferStage::ALL {
            dispatcher.register(&stage.message_type(), transfer_log.clone())?;
        }
        dispatcher.register(&message_type("node", "online")?, Arc::new(log_presence))?;

        let bus = if config.bus.enabled {
            let bus = PubSubBus::with_connector(identity.clone(), broker, config.bus_settings());
            let handler: Arc<dyn MessageHandler> = dispatcher.clone();
            let scope = match config.node.role {
                NodeRole::Hub => ChannelScope::Proxy,
                NodeRole::Spoke => ChannelScope::Node,
            };
            bus.subscribe(&channel_name(identity.environment(), scope)?, handler.clone())?;
            bus.subscribe(&channel_name(identity.environment(), ChannelScope::Broadcast)?, handler)?;
            Some(bus)
        } else {
            None
        };

        Ok(Self {
            config,
            relay,
            bus,
            dispatcher,
        })
    }

    pub fn relay(&self) -> Option<&RelayChannel> {
        self.relay.as_ref()
    }

    pub fn bus(&self) -> Option<&PubSubBus> {
        self.bus.as_ref()
    }

    pub fn dispatcher(&self) -> &TypeDispatcher {
        &self.dispatcher
    }

    pub fn start(&self) -> anyhow::Result<()> {
        if let Some(relay) = &self.relay {
            relay.start().context("starting relay")?;
        }
        if let Some(bus) = &self.bus {
            bus.start().context("starting bus")?;
        }
        Ok(())
    }

    /// Announces this node on the broadcast channel once the bus is up.
    pub async fn announce(&self, wait: Duration) -> anyhow::Result<bool> {
        let Some(bus) = &self.bus else {
            return Ok(false);
        };
        if !bus.wait_for_state(ConnectionState::Running, wait).await {
            warn!("Bus not running after {:?}; skipping announcement", wait);
            return Ok(false);
        }
        let identity = bus.identity();
        let envelope = Envelope::new(
            identity.environment(),
            identity.server_id(),
            message_type("node", "online")?,
            format!("{{\"role\":\"{}\"}}", self.config.node.role),
        )?;
        bus.publish(&channel_name(identity.environment(), ChannelScope::Broadcast)?, &envelope)?;
        Ok(true)
    }

    pub fn stop(&self) {
        if let Some(bus) = &self.bus {
            bus.stop();
        }
        if let Some(relay) = &self.relay {
            relay.stop();
        }
    }

    pub fn log_stats(&self) {
        if let Some(relay) = &self.relay {
            let RelayStatsSnapshot {
                connect_attempts,
                dropped_sends,
                forwarded_frames,
                delivered_frames,
                rejected_handshakes,
                ..
            } = relay.stats();
            info!(
                "📊 Relay {} - peers: {:?} | delivered: {} | forwarded: {} | dropped: {} | rejected: {} | attempts: {}",
                relay.state(),
                relay.connected_peers(),
                delivered_frames,
                forwarded_frames,
                dropped_sends,
                rejected_handshakes,
                connect_attempts
            );
        }
        if let Some(bus) = &self.bus {
            let BusStatsSnapshot {
                published,
                dropped_publishes,
                received,
                filtered,
                caller_runs,
                ..
            } = bus.stats();
            info!(
                "📊 Bus {} - published: {} | dropped: {} | received: {} | filtered: {} | caller-runs: {}",
                bus.state(),
                published,
                dropped_publishes,
                received,
                filtered,
                caller_runs
            );
        }
    }

    /// Logs stats periodically until `shutdown` resolves with the reason to
    /// stop, then stops both engines.
    pub async fn run_until<F, R>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = std::io::Result<R>>,
        R: std::fmt::Display,
    {
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        let reason = loop {
            tokio::select! {
                res = &mut shutdown => break res.context("waiting for shutdown signal")?,
                _ = interval.tick() => self.log_stats(),
            }
        };

        info!("🛑 {} received, stopping node...", reason);
        self.stop();
        self.log_stats();
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_relay_data(source_id: &str, payload: &[u8]) -> Result<(), HandlerError> {
    match Envelope::from_bytes(payload) {
        Ok(envelope) => debug!("📨 Relay {} from {}", envelope.message_type(), source_id),
        Err(_) => debug!("📨 Relay {} bytes from {}", payload.len(), source_id),
    }
    Ok(())
}

fn log_transfer(channel: &str, envelope: &Envelope) -> Result<(), HandlerError> {
    info!(
        "🔀 {} from {} on {}: {}",
        envelope.message_type(),
        envelope.origin_id(),
        channel,
        envelope.payload()
    );
    Ok(())
}

fn log_presence(_: &str, envelope: &Envelope) -> Result<(), HandlerError> {
    info!("👋 {} is online", envelope.origin_id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use interlink::MemoryBroker;

    fn config(role: NodeRole, server_id: &str, address: &str, peers: &[&str]) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.environment = "prod".to_string();
        config.node.server_id = server_id.to_string();
        config.node.role = role;
        config.relay.address = address.to_string();
        config.relay.token = "t1".to_string();
        config.relay.allowed_peers = peers.iter().map(|p| p.to_string()).collect();
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hub_and_spoke_nodes_connect() {
        let broker = MemoryBroker::new();
        let hub = Node::new(config(NodeRole::Hub, "proxy", "127.0.0.1:0", &["paper-1"]), Arc::new(broker.clone())).unwrap();
        hub.start().unwrap();
        let hub_relay = hub.relay().unwrap();
        assert!(hub_relay.wait_for_state(ConnectionState::Running, Duration::from_secs(5)).await);
        let addr = hub_relay.local_addr().unwrap().to_string();

        let spoke = Node::new(config(NodeRole::Spoke, "paper-1", &addr, &["proxy"]), Arc::new(broker.clone())).unwrap();
        spoke.start().unwrap();
        assert!(spoke
            .relay()
            .unwrap()
            .wait_for_state(ConnectionState::Running, Duration::from_secs(5))
            .await);

        assert!(hub.announce(Duration::from_secs(5)).await.unwrap());
        assert!(spoke.announce(Duration::from_secs(5)).await.unwrap());
        assert_eq!(broker.active_subscriptions("fleet:prod:proxy"), 1);
        assert_eq!(broker.active_subscriptions("fleet:prod:node"), 1);
        assert_eq!(broker.active_subscriptions("fleet:prod:broadcast"), 2);
        assert_eq!(spoke.dispatcher().handler_count("player.transfer.request"), 1);

        spoke.stop();
        hub.stop();
        assert_eq!(hub.relay().unwrap().state(), ConnectionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disabled_engines_are_skipped() {
        let mut config = config(NodeRole::Spoke, "paper-1", "127.0.0.1:1", &["proxy"]);
        config.relay.enabled = false;
        config.bus.enabled = false;
        let node = Node::new(config, Arc::new(MemoryBroker::new())).unwrap();
        node.start().unwrap();
        assert!(node.relay().is_none());
        assert!(!node.announce(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_until_stops_engines() {
        let node = Node::new(config(NodeRole::Hub, "proxy", "127.0.0.1:0", &["paper-1"]), Arc::new(MemoryBroker::new())).unwrap();
        node.start().unwrap();
        node.run_until(async { Ok("test stop") }).await.unwrap();

        assert_eq!(node.relay().unwrap().state(), ConnectionState::Stopped);
        assert_eq!(node.bus().unwrap().state(), ConnectionState::Stopped);
        assert!(node.start().is_err());
    }
}
