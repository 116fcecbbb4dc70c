//! Node identity within a fleet.

use std::fmt;

use crate::error::{require_non_blank, MessagingError};

/// Who a node is: the environment it belongs to and its unique server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    environment: String,
    server_id: String,
}

impl PeerIdentity {
    pub fn new(
        environment: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Result<Self, MessagingError> {
        let environment = environment.into();
        let server_id = server_id.into();
        require_non_blank(&environment, "environment")?;
        require_non_blank(&server_id, "serverId")?;
        Ok(Self {
            environment,
            server_id,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.server_id)
    }
}
