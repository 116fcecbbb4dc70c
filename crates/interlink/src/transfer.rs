//! Player transfer stages.
//!
//! A transfer moves forward through a fixed set of stages. Each stage maps to
//! its own message type, `player.transfer.<stage>`, so handlers can subscribe
//! to exactly the steps they care about.
//!
//! ```text
//! REQUEST ──> PREPARE ──> READY ──> TRANSFERRING ──> COMPLETE
//!    │                                     └───────> FAIL
//!    └──> CANCEL
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// Message type prefix shared by all transfer stages.
pub const TRANSFER_TYPE_PREFIX: &str = "player.transfer";

/// Canonical keys of a transfer payload object.
pub mod keys {
    pub const TRANSFER_ID: &str = "transferId";
    pub const PLAYER_ID: &str = "playerId";
    pub const FROM_SERVER_ID: &str = "fromServerId";
    pub const TO_SERVER_ID: &str = "toServerId";
    pub const TIMESTAMP: &str = "timestamp";
    pub const REASON: &str = "reason";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStage {
    Request,
    Prepare,
    Ready,
    Transferring,
    Complete,
    Fail,
    Cancel,
}

impl TransferStage {
    pub const ALL: [TransferStage; 7] = [
        TransferStage::Request,
        TransferStage::Prepare,
        TransferStage::Ready,
        TransferStage::Transferring,
        TransferStage::Complete,
        TransferStage::Fail,
        TransferStage::Cancel,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            TransferStage::Request => "request",
            TransferStage::Prepare => "prepare",
            TransferStage::Ready => "ready",
            TransferStage::Transferring => "transferring",
            TransferStage::Complete => "complete",
            TransferStage::Fail => "fail",
            TransferStage::Cancel => "cancel",
        }
    }

    /// Case-insensitive lookup; `None` for unknown names.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|stage| stage.wire_name().eq_ignore_ascii_case(name))
    }

    /// Stages reachable in one step from this one.
    pub fn allowed_next(&self) -> &'static [TransferStage] {
        match self {
            TransferStage::Request => &[TransferStage::Prepare, TransferStage::Cancel],
            TransferStage::Prepare => &[TransferStage::Ready],
            TransferStage::Ready => &[TransferStage::Transferring],
            TransferStage::Transferring => &[TransferStage::Complete, TransferStage::Fail],
            TransferStage::Complete | TransferStage::Fail | TransferStage::Cancel => &[],
        }
    }

    pub fn can_transition_to(&self, next: TransferStage) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Validates a step, returning the new stage.
    pub fn advance(self, next: TransferStage) -> Result<TransferStage, MessagingError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MessagingError::IllegalTransition {
                from: self.wire_name().to_string(),
                to: next.wire_name().to_string(),
            })
        }
    }

    /// The message type carrying this stage, e.g. `player.transfer.ready`.
    pub fn message_type(&self) -> String {
        format!("{TRANSFER_TYPE_PREFIX}.{}", self.wire_name())
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Builds a transfer message type from a free-form stage name.
pub fn compose_transfer_type(stage: &str) -> Result<String, MessagingError> {
    let stage = stage.trim().to_lowercase();
    if stage.is_empty() {
        return Err(MessagingError::InvalidMessageType(
            "transfer stage must not be blank".to_string(),
        ));
    }
    Ok(format!("{TRANSFER_TYPE_PREFIX}.{stage}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let stage = TransferStage::Request
            .advance(TransferStage::Prepare)
            .and_then(|s| s.advance(TransferStage::Ready))
            .and_then(|s| s.advance(TransferStage::Transferring))
            .and_then(|s| s.advance(TransferStage::Complete))
            .unwrap();
        assert!(stage.is_terminal());
    }

    #[test]
    fn test_reverse_and_terminal_transitions_rejected() {
        assert!(!TransferStage::Ready.can_transition_to(TransferStage::Prepare));
        assert!(!TransferStage::Prepare.can_transition_to(TransferStage::Cancel));
        for terminal in [TransferStage::Complete, TransferStage::Fail, TransferStage::Cancel] {
            for next in TransferStage::ALL {
                assert!(terminal.advance(next).is_err());
            }
        }
    }

    #[test]
    fn test_cancel_only_from_request() {
        let sources: Vec<_> = TransferStage::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(TransferStage::Cancel))
            .collect();
        assert_eq!(sources, vec![TransferStage::Request]);
    }

    #[test]
    fn test_message_types() {
        assert_eq!(TransferStage::Ready.message_type(), "player.transfer.ready");
        assert_eq!(compose_transfer_type(" PREPARE ").unwrap(), "player.transfer.prepare");
        assert!(compose_transfer_type("").is_err());
        assert_eq!(TransferStage::from_wire_name("Fail"), Some(TransferStage::Fail));
        assert_eq!(TransferStage::from_wire_name("rollback"), None);
    }
}
