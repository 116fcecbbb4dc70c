//! Tunables for the relay channel, the bus and the Redis broker.
//!
//! All settings have defaults suited to a production fleet and use a
//! builder style:
//!
//! ```rust
//! use interlink::RelaySettings;
//!
//! let settings = RelaySettings::new("shared-secret")
//!     .allowed_peers(["velocity", "paper-1"])
//!     .outbound_queue_capacity(1024);
//! ```
//!
//! Out-of-range values are clamped rather than rejected.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;

pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_FIELD_BYTES: usize = u16::MAX as usize;

/// Size limits applied when encoding and decoding relay frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_field_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
        }
    }
}

impl FrameLimits {
    /// Field lengths are carried in a u16, so the field limit never exceeds it.
    pub fn new(max_frame_bytes: usize, max_field_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.max(1),
            max_field_bytes: max_field_bytes.clamp(1, DEFAULT_MAX_FIELD_BYTES),
        }
    }
}

/// Settings for a [`RelayChannel`](crate::relay::RelayChannel).
#[derive(Clone)]
pub struct RelaySettings {
    pub(crate) token: String,
    pub(crate) allowed_peers: BTreeSet<String>,
    pub(crate) outbound_queue_capacity: usize,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) drop_warn_threshold: u64,
    pub(crate) idle_timeout: Duration,
    pub(crate) limits: FrameLimits,
    pub(crate) protocol_version: u32,
}

impl RelaySettings {
    /// Creates settings with the shared handshake token and defaults for
    /// everything else. The allow-list starts empty, which admits nobody.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            allowed_peers: BTreeSet::new(),
            outbound_queue_capacity: 512,
            reconnect: ReconnectPolicy::default(),
            drop_warn_threshold: 10,
            idle_timeout: Duration::from_secs(120),
            limits: FrameLimits::default(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }

    /// Server ids permitted on the other end of a link. Blank entries are
    /// ignored and ids are trimmed.
    pub fn allowed_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_peers = normalize_peers(peers);
        self
    }

    /// Spoke-side queue capacity (default: 512, minimum 1).
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Warn on the first dropped send and then every `threshold` drops (default: 10).
    pub fn drop_warn_threshold(mut self, threshold: u64) -> Self {
        self.drop_warn_threshold = threshold.max(1);
        self
    }

    /// Close links that see no traffic for this long (default: 120 s).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn frame_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn allowed_peer_ids(&self) -> &BTreeSet<String> {
        &self.allowed_peers
    }

    pub fn queue_capacity(&self) -> usize {
        self.outbound_queue_capacity
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        self.reconnect
    }

    pub fn idle(&self) -> Duration {
        self.idle_timeout
    }
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("token", &"<redacted>")
            .field("allowed_peers", &self.allowed_peers)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("reconnect", &self.reconnect)
            .field("drop_warn_threshold", &self.drop_warn_threshold)
            .field("idle_timeout", &self.idle_timeout)
            .field("limits", &self.limits)
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

/// Settings for a [`PubSubBus`](crate::bus::PubSubBus).
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub(crate) worker_pool_size: usize,
    pub(crate) worker_queue_capacity: usize,
    pub(crate) subscribe_retry_attempts: u32,
    pub(crate) subscribe_retry_delay: Duration,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) drop_warn_threshold: u64,
    pub(crate) degraded_log_interval: Duration,
    pub(crate) publish_buffer: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            worker_queue_capacity: 256,
            subscribe_retry_attempts: 3,
            subscribe_retry_delay: Duration::from_millis(200),
            reconnect: ReconnectPolicy::default(),
            drop_warn_threshold: 10,
            degraded_log_interval: Duration::from_secs(30),
            publish_buffer: 256,
        }
    }
}

impl BusSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler threads (default: 4, minimum 1).
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    /// Pending handler tasks before caller-runs kicks in (default: 256, minimum 1).
    pub fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity.max(1);
        self
    }

    /// Broker subscribe attempts per channel (default: 3, minimum 1).
    pub fn subscribe_retry_attempts(mut self, attempts: u32) -> Self {
        self.subscribe_retry_attempts = attempts.max(1);
        self
    }

    pub fn subscribe_retry_delay(mut self, delay: Duration) -> Self {
        self.subscribe_retry_delay = delay;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn drop_warn_threshold(mut self, threshold: u64) -> Self {
        self.drop_warn_threshold = threshold.max(1);
        self
    }

    /// Minimum spacing of "bus is degraded" warnings (default: 30 s).
    pub fn degraded_log_interval(mut self, interval: Duration) -> Self {
        self.degraded_log_interval = interval;
        self
    }

    /// Publishes buffered between the caller and the broker task (default: 256).
    pub fn publish_buffer(mut self, capacity: usize) -> Self {
        self.publish_buffer = capacity.max(1);
        self
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        self.reconnect
    }
}

/// Connection settings for a [`RedisBroker`](crate::bus::RedisBroker).
#[derive(Clone)]
pub struct RedisSettings {
    pub(crate) url: String,
    pub(crate) timeout: Duration,
}

impl RedisSettings {
    /// `url` is a Redis connection URL such as `redis://:secret@10.0.0.5:6379/0`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Bound on connecting, subscribing and publishing (default: 5 s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// The URL with any credentials masked, for logs.
    pub fn redacted_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}://<redacted>@{}", &self.url[..scheme_end], &self.url[at + 1..])
            }
            _ => self.url.clone(),
        }
    }
}

impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("url", &self.redacted_url())
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub(crate) fn normalize_peers<I, S>(peers: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    peers
        .into_iter()
        .map(|peer| peer.as_ref().trim().to_string())
        .filter(|peer| !peer.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_defaults() {
        let settings = RelaySettings::new("t1");
        assert_eq!(settings.outbound_queue_capacity, 512);
        assert_eq!(settings.reconnect.max_attempts(), 10);
        assert_eq!(settings.reconnect.initial_delay(), Duration::from_secs(1));
        assert_eq!(settings.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(settings.drop_warn_threshold, 10);
        assert_eq!(settings.idle_timeout, Duration::from_secs(120));
        assert_eq!(settings.limits.max_frame_bytes, 1024 * 1024);
        assert_eq!(settings.limits.max_field_bytes, 65_535);
        assert!(settings.allowed_peers.is_empty());
    }

    #[test]
    fn test_relay_clamping() {
        let settings = RelaySettings::new("t1")
            .outbound_queue_capacity(0)
            .drop_warn_threshold(0)
            .allowed_peers([" paper-1 ", "", "velocity"]);
        assert_eq!(settings.outbound_queue_capacity, 1);
        assert_eq!(settings.drop_warn_threshold, 1);
        assert_eq!(
            settings.allowed_peers.iter().cloned().collect::<Vec<_>>(),
            vec!["paper-1".to_string(), "velocity".to_string()]
        );
        assert_eq!(FrameLimits::new(0, 1_000_000).max_field_bytes, 65_535);
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", RelaySettings::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn test_bus_defaults() {
        let settings = BusSettings::default();
        assert_eq!(settings.worker_pool_size, 4);
        assert_eq!(settings.worker_queue_capacity, 256);
        assert_eq!(settings.subscribe_retry_attempts, 3);
        assert_eq!(settings.subscribe_retry_delay, Duration::from_millis(200));
        assert_eq!(BusSettings::new().worker_pool_size(0).worker_pool_size, 1);
    }

    #[test]
    fn test_redis_url_credentials_are_masked() {
        let settings = RedisSettings::new("redis://:hunter2@10.0.0.5:6379/0");
        assert_eq!(settings.redacted_url(), "redis://<redacted>@10.0.0.5:6379/0");
        assert!(!format!("{settings:?}").contains("hunter2"));
        assert_eq!(RedisSettings::new("redis://127.0.0.1/").redacted_url(), "redis://127.0.0.1/");
    }
}
