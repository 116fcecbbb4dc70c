//! Error types for the messaging backbone.
//!
//! Operational failures (network churn, broker outages, full queues) never
//! surface through these types to `send`/`publish` callers; they are absorbed
//! into connection state and counters. What remains here is caller misuse,
//! wire-protocol violations, and broker transport failures seen internally.

use thiserror::Error;

/// Errors raised while encoding or decoding relay frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ended before the frame was complete or held trailing bytes.
    #[error("Malformed frame: {0}")]
    Malformed(String),
    /// A variable-length field exceeded the configured field limit.
    #[error("Field '{field}' too large: {size} bytes (max {max})")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },
    /// A whole frame exceeded the configured frame limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    /// The leading tag byte does not name a known frame type.
    #[error("Unknown frame type tag: 0x{0:02x}")]
    UnknownTag(u8),
}

/// Errors reported synchronously to callers of the relay and the bus.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// The instance was explicitly stopped and refuses further use.
    #[error("{0} has been stopped and cannot be used again")]
    Stopped(&'static str),
    /// A required identifier was empty or whitespace.
    #[error("{0} must not be blank")]
    Blank(&'static str),
    /// `start()` was called outside of a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
    /// A message type string did not follow `<domain>.<action>`.
    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),
    /// A transfer stage change is not in the adjacency table.
    #[error("Illegal transfer transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    /// Envelope (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A frame could not be built for sending.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Failures of the external broker connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Subscribe to '{channel}' failed: {reason}")]
    Subscribe { channel: String, reason: String },
    #[error("Publish to '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("Broker connection closed")]
    Closed,
}

/// Error type returned by application message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) fn require_non_blank(value: &str, what: &'static str) -> Result<(), MessagingError> {
    if value.trim().is_empty() {
        Err(MessagingError::Blank(what))
    } else {
        Ok(())
    }
}
