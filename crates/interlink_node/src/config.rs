//! Node configuration loaded from TOML.
//!
//! A missing file is replaced by a default one so a fresh install starts
//! with something editable. The file maps onto the library's
//! [`RelaySettings`] and [`BusSettings`] after [`NodeConfig::validate`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use interlink::{
    BrokerConnector, BusSettings, FrameLimits, MemoryBroker, PeerIdentity, ReconnectPolicy,
    RedisBroker, RedisSettings, RelaySettings,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Hub,
    Spoke,
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hub" => Ok(NodeRole::Hub),
            "spoke" => Ok(NodeRole::Spoke),
            other => bail!("unknown role '{other}', expected 'hub' or 'spoke'"),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Hub => f.write_str("hub"),
            NodeRole::Spoke => f.write_str("spoke"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Who this node is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub environment: String,
    pub server_id: String,
    pub role: NodeRole,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            server_id: "node-1".to_string(),
            role: NodeRole::Spoke,
        }
    }
}

/// Relay endpoint settings. A hub listens on `address`; a spoke dials it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_relay_address")]
    pub address: String,
    #[serde(default)]
    pub token: String,
    /// Hub: the spokes it accepts. Spoke: the hub ids it trusts.
    #[serde(default)]
    pub allowed_peers: Vec<String>,
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_relay_address() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_queue_capacity() -> usize {
    512
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_max_frame_bytes() -> usize {
    interlink::settings::DEFAULT_MAX_FRAME_BYTES
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_relay_address(),
            token: String::new(),
            allowed_peers: Vec::new(),
            outbound_queue_capacity: default_queue_capacity(),
            reconnect_initial_ms: default_initial_delay_ms(),
            reconnect_max_ms: default_max_delay_ms(),
            reconnect_max_attempts: default_max_attempts(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Which broker the bus talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// A Redis server at `redis_url`.
    #[default]
    Redis,
    /// In-process only; nothing leaves this node.
    Memory,
}

/// Pub/sub bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub broker: BrokerKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_pool_queue")]
    pub worker_queue_capacity: usize,
    #[serde(default = "default_subscribe_attempts")]
    pub subscribe_retry_attempts: u32,
    #[serde(default = "default_subscribe_delay_ms")]
    pub subscribe_retry_delay_ms: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    5_000
}

fn default_pool_size() -> usize {
    4
}

fn default_pool_queue() -> usize {
    256
}

fn default_subscribe_attempts() -> u32 {
    3
}

fn default_subscribe_delay_ms() -> u64 {
    200
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: BrokerKind::default(),
            redis_url: default_redis_url(),
            redis_timeout_ms: default_redis_timeout_ms(),
            worker_pool_size: default_pool_size(),
            worker_queue_capacity: default_pool_queue(),
            subscribe_retry_attempts: default_subscribe_attempts(),
            subscribe_retry_delay_ms: default_subscribe_delay_ms(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl NodeConfig {
    /// Loads configuration from a TOML file, writing and returning the
    /// default configuration if the file does not exist.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = NodeConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks identifiers, addresses and levels.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.environment.trim().is_empty() {
            return Err("Node environment cannot be empty".to_string());
        }
        if self.node.server_id.trim().is_empty() {
            return Err("Node server_id cannot be empty".to_string());
        }

        if self.relay.enabled {
            if self.node.role == NodeRole::Hub
                && self.relay.address.parse::<std::net::SocketAddr>().is_err()
            {
                return Err(format!("Invalid relay bind address: {}", self.relay.address));
            }
            if self.relay.address.trim().is_empty() {
                return Err("Relay address cannot be empty".to_string());
            }
            if self.relay.token.is_empty() {
                return Err("Relay token cannot be empty".to_string());
            }
            if self.relay.allowed_peers.iter().all(|peer| peer.trim().is_empty()) {
                return Err("Relay allowed_peers must name at least one peer".to_string());
            }
        }

        if self.bus.enabled && self.bus.broker == BrokerKind::Redis {
            if self.bus.redis_url.trim().is_empty() {
                return Err("Bus redis_url cannot be empty".to_string());
            }
            if self.bus.redis_timeout_ms == 0 {
                return Err("Bus redis_timeout_ms must be positive".to_string());
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn identity(&self) -> anyhow::Result<PeerIdentity> {
        Ok(PeerIdentity::new(
            self.node.environment.trim(),
            self.node.server_id.trim(),
        )?)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        let relay = &self.relay;
        RelaySettings::new(relay.token.clone())
            .allowed_peers(relay.allowed_peers.iter().map(String::as_str))
            .outbound_queue_capacity(relay.outbound_queue_capacity)
            .reconnect_policy(ReconnectPolicy::new(
                Duration::from_millis(relay.reconnect_initial_ms),
                Duration::from_millis(relay.reconnect_max_ms),
                relay.reconnect_max_attempts,
            ))
            .idle_timeout(Duration::from_secs(relay.idle_timeout_secs))
            .frame_limits(FrameLimits::new(
                relay.max_frame_bytes,
                interlink::settings::DEFAULT_MAX_FIELD_BYTES,
            ))
    }

    pub fn bus_settings(&self) -> BusSettings {
        BusSettings::new()
            .worker_pool_size(self.bus.worker_pool_size)
            .worker_queue_capacity(self.bus.worker_queue_capacity)
            .subscribe_retry_attempts(self.bus.subscribe_retry_attempts)
            .subscribe_retry_delay(Duration::from_millis(self.bus.subscribe_retry_delay_ms))
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings::new(self.bus.redis_url.trim())
            .timeout(Duration::from_millis(self.bus.redis_timeout_ms))
    }

    /// The broker selected by `bus.broker`.
    pub fn broker_connector(&self) -> anyhow::Result<Arc<dyn BrokerConnector>> {
        let connector: Arc<dyn BrokerConnector> = match self.bus.broker {
            BrokerKind::Redis => Arc::new(RedisBroker::new(self.redis_settings())?),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };
        Ok(connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    fn valid() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.relay.token = "t1".to_string();
        config.relay.allowed_peers = vec!["proxy".to_string()];
        config
    }

    #[test]
    fn test_defaults_need_a_token() {
        let config = NodeConfig::default();
        assert_eq!(config.node.role, NodeRole::Spoke);
        assert_eq!(config.relay.outbound_queue_capacity, 512);
        assert_eq!(config.bus.worker_pool_size, 4);
        assert!(config.validate().unwrap_err().contains("token"));
        assert!(valid().validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("interlink.toml");

        let config = NodeConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.node.server_id, "node-1");
        assert!(path.exists());

        let reloaded = NodeConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.relay.address, config.relay.address);
    }

    #[tokio::test]
    async fn test_load_partial_file_uses_defaults() {
        let toml_content = r#"
[node]
environment = "prod"
server_id = "proxy"
role = "hub"

[relay]
address = "0.0.0.0:7100"
token = "secret"
allowed_peers = ["paper-1", "paper-2"]
reconnect_max_attempts = 3

[logging]
level = "debug"
"#;
        let file = NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), toml_content).await.unwrap();

        let config = NodeConfig::load_from_file(file.path()).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.role, NodeRole::Hub);
        assert_eq!(config.relay.reconnect_max_attempts, 3);
        assert_eq!(config.relay.idle_timeout_secs, 120);
        assert!(config.bus.enabled);
        assert!(!config.logging.json_format);

        let settings = config.relay_settings();
        assert_eq!(settings.reconnect().max_attempts(), 3);
        assert_eq!(settings.allowed_peer_ids().len(), 2);
        assert_eq!(config.identity().unwrap().to_string(), "prod/proxy");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = valid();
        config.node.role = NodeRole::Hub;
        config.relay.address = "not-an-address".to_string();
        assert!(config.validate().unwrap_err().contains("bind address"));

        let mut config = valid();
        config.relay.allowed_peers = vec!["  ".to_string()];
        assert!(config.validate().is_err());

        let mut config = valid();
        config.relay.enabled = false;
        config.relay.token.clear();
        assert!(config.validate().is_ok());

        let mut config = valid();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));

        let mut config = valid();
        config.node.server_id = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_broker_selection() {
        let config = valid();
        assert_eq!(config.bus.broker, BrokerKind::Redis);
        assert!(config.broker_connector().is_ok());

        let parsed: BusConfig = toml::from_str("broker = \"memory\"").unwrap();
        assert_eq!(parsed.broker, BrokerKind::Memory);
        assert_eq!(parsed.redis_timeout_ms, 5_000);

        let mut config = valid();
        config.bus.redis_url = " ".to_string();
        assert!(config.validate().unwrap_err().contains("redis_url"));
        config.bus.broker = BrokerKind::Memory;
        assert!(config.validate().is_ok());

        let mut config = valid();
        config.bus.redis_url = "not a url".to_string();
        assert!(config.broker_connector().is_err());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("HUB".parse::<NodeRole>().unwrap(), NodeRole::Hub);
        assert_eq!(" spoke ".parse::<NodeRole>().unwrap(), NodeRole::Spoke);
        assert!("proxy".parse::<NodeRole>().is_err());
    }
}
