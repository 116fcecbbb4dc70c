//! Bus channel naming.
//!
//! Channels are namespaced per environment so fleets sharing a broker never
//! see each other's traffic: `fleet:<environment>:<scope>`.

use std::fmt;

use crate::error::{require_non_blank, MessagingError};

pub const CHANNEL_PREFIX: &str = "fleet";

/// Audience of a bus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    /// Read by the proxy; game nodes publish here.
    Proxy,
    /// Read by game nodes; the proxy publishes here.
    Node,
    /// Read by everyone.
    Broadcast,
}

impl ChannelScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelScope::Proxy => "proxy",
            ChannelScope::Node => "node",
            ChannelScope::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the channel name for `scope` in `environment`.
pub fn channel_name(environment: &str, scope: ChannelScope) -> Result<String, MessagingError> {
    require_non_blank(environment, "environment")?;
    Ok(format!("{CHANNEL_PREFIX}:{}:{}", environment.trim(), scope))
}
