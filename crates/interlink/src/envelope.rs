//! The message unit carried by both the relay and the bus.
//!
//! An [`Envelope`] is built once by a publisher and never mutated afterwards.
//! Its JSON wire form uses camelCase names:
//!
//! ```json
//! {
//!   "environment": "prod",
//!   "originId": "paper-1",
//!   "type": "player.transfer.request",
//!   "payload": "{\"playerId\":\"...\"}",
//!   "payloadFormat": "json",
//!   "meta": { "messageId": "...", "createdAt": 1700000000000, "headers": {} }
//! }
//! ```
//!
//! Decoding is lenient about optional parts (missing payload, format, id or
//! timestamp get defaults) and strict about identity (blank environment,
//! origin or type is rejected).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{require_non_blank, MessagingError};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Builds a `<domain>.<action>` message type.
pub fn message_type(domain: &str, action: &str) -> Result<String, MessagingError> {
    let domain = domain.trim();
    let action = action.trim();
    if domain.is_empty() || action.is_empty() {
        return Err(MessagingError::InvalidMessageType(format!(
            "'{domain}.{action}' needs a non-blank domain and action"
        )));
    }
    Ok(format!("{domain}.{action}"))
}

/// How the payload string should be interpreted by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PayloadFormat {
    #[default]
    Json,
    Text,
}

impl PayloadFormat {
    pub fn wire_name(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "json",
            PayloadFormat::Text => "text",
        }
    }

    /// Resolves a wire name, falling back to JSON for blank or unknown input.
    pub fn from_wire_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("text") {
            PayloadFormat::Text
        } else {
            PayloadFormat::Json
        }
    }
}

impl From<String> for PayloadFormat {
    fn from(value: String) -> Self {
        Self::from_wire_name(&value)
    }
}

impl From<PayloadFormat> for String {
    fn from(value: PayloadFormat) -> Self {
        value.wire_name().to_string()
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Identity and bookkeeping attached to every envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    id: String,
    created_at: i64,
    headers: BTreeMap<String, String>,
}

impl MessageMeta {
    /// Creates metadata with a fresh UUID and the current timestamp.
    pub fn new() -> Self {
        Self::from_parts(None, None, BTreeMap::new())
    }

    /// Creates metadata from possibly missing parts.
    ///
    /// A missing or blank id gets a fresh UUID v4; a missing or non-positive
    /// timestamp becomes "now".
    pub fn from_parts(
        id: Option<String>,
        created_at: Option<i64>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let created_at = created_at.filter(|ts| *ts > 0).unwrap_or_else(now_ms);
        Self {
            id,
            created_at,
            headers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time in epoch milliseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable message exchanged between fleet nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnvelopeWire", into = "EnvelopeWire")]
pub struct Envelope {
    environment: String,
    origin_id: String,
    message_type: String,
    payload: String,
    payload_format: PayloadFormat,
    meta: MessageMeta,
}

impl Envelope {
    /// Creates a JSON-format envelope with fresh metadata.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Blank`] if `environment`, `origin_id` or
    /// `message_type` is blank.
    pub fn new(
        environment: impl Into<String>,
        origin_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<Self, MessagingError> {
        Self::from_parts(
            environment.into(),
            origin_id.into(),
            message_type.into(),
            payload.into(),
            PayloadFormat::Json,
            MessageMeta::new(),
        )
    }

    /// Creates an envelope from explicit parts, validating identity fields.
    pub fn from_parts(
        environment: String,
        origin_id: String,
        message_type: String,
        payload: String,
        payload_format: PayloadFormat,
        meta: MessageMeta,
    ) -> Result<Self, MessagingError> {
        require_non_blank(&environment, "environment")?;
        require_non_blank(&origin_id, "originId")?;
        require_non_blank(&message_type, "type")?;
        Ok(Self {
            environment,
            origin_id,
            message_type,
            payload,
            payload_format,
            meta,
        })
    }

    /// Returns a copy carrying a different payload format.
    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }

    /// Returns a copy whose headers are replaced, keeping id and timestamp.
    pub fn with_headers<I, K, V>(&self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            meta: MessageMeta::from_parts(
                Some(self.meta.id.clone()),
                Some(self.meta.created_at),
                headers,
            ),
            ..self.clone()
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn payload_format(&self) -> PayloadFormat {
        self.payload_format
    }

    pub fn meta(&self) -> &MessageMeta {
        &self.meta
    }

    /// Serializes to the JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses the JSON wire form, applying defaults and validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaWire {
    message_id: Option<String>,
    created_at: Option<i64>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    environment: Option<String>,
    origin_id: Option<String>,
    #[serde(rename = "type")]
    message_type: Option<String>,
    payload: Option<String>,
    payload_format: Option<String>,
    meta: Option<MetaWire>,
}

impl TryFrom<EnvelopeWire> for Envelope {
    type Error = MessagingError;

    fn try_from(wire: EnvelopeWire) -> Result<Self, Self::Error> {
        let meta = match wire.meta {
            Some(meta) => MessageMeta::from_parts(meta.message_id, meta.created_at, meta.headers),
            None => MessageMeta::new(),
        };
        Envelope::from_parts(
            wire.environment.unwrap_or_default(),
            wire.origin_id.unwrap_or_default(),
            wire.message_type.unwrap_or_default(),
            wire.payload.unwrap_or_default(),
            wire.payload_format
                .map(|name| PayloadFormat::from_wire_name(&name))
                .unwrap_or_default(),
            meta,
        )
    }
}

impl From<Envelope> for EnvelopeWire {
    fn from(envelope: Envelope) -> Self {
        Self {
            environment: Some(envelope.environment),
            origin_id: Some(envelope.origin_id),
            message_type: Some(envelope.message_type),
            payload: Some(envelope.payload),
            payload_format: Some(envelope.payload_format.wire_name().to_string()),
            meta: Some(MetaWire {
                message_id: Some(envelope.meta.id),
                created_at: Some(envelope.meta.created_at),
                headers: envelope.meta.headers,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_metadata() {
        let envelope = Envelope::new("prod", "paper-1", "player.join", "{}").unwrap();
        assert!(Uuid::parse_str(envelope.meta().id()).is_ok());
        assert!(envelope.meta().created_at() > 0);
        assert_eq!(envelope.payload_format(), PayloadFormat::Json);
        assert!(envelope.meta().headers().is_empty());
    }

    #[test]
    fn test_blank_identity_rejected() {
        assert!(matches!(
            Envelope::new(" ", "paper-1", "a.b", ""),
            Err(MessagingError::Blank("environment"))
        ));
        assert!(matches!(
            Envelope::new("prod", "", "a.b", ""),
            Err(MessagingError::Blank("originId"))
        ));
        assert!(matches!(
            Envelope::new("prod", "paper-1", "\t", ""),
            Err(MessagingError::Blank("type"))
        ));
    }

    #[test]
    fn test_decode_fills_defaults() {
        let json = br#"{"environment":"prod","originId":"velocity","type":"server.ping"}"#;
        let envelope = Envelope::from_bytes(json).unwrap();
        assert_eq!(envelope.payload(), "");
        assert_eq!(envelope.payload_format(), PayloadFormat::Json);
        assert!(!envelope.meta().id().is_empty());
        assert!(envelope.meta().created_at() > 0);
    }

    #[test]
    fn test_decode_keeps_supplied_metadata() {
        let json = br#"{
            "environment":"prod","originId":"velocity","type":"server.ping",
            "payload":"hi","payloadFormat":"TEXT",
            "meta":{"messageId":"abc","createdAt":42,"headers":{"trace":"1"}}
        }"#;
        let envelope = Envelope::from_bytes(json).unwrap();
        assert_eq!(envelope.payload_format(), PayloadFormat::Text);
        assert_eq!(envelope.meta().id(), "abc");
        assert_eq!(envelope.meta().created_at(), 42);
        assert_eq!(envelope.meta().header("trace"), Some("1"));
    }

    #[test]
    fn test_decode_rejects_missing_origin() {
        let json = br#"{"environment":"prod","type":"server.ping"}"#;
        assert!(Envelope::from_bytes(json).is_err());
    }

    #[test]
    fn test_non_positive_timestamp_replaced() {
        let meta = MessageMeta::from_parts(Some("  ".into()), Some(0), BTreeMap::new());
        assert_ne!(meta.id().trim(), "");
        assert!(meta.created_at() > 0);
    }

    #[test]
    fn test_unknown_format_falls_back_to_json() {
        assert_eq!(PayloadFormat::from_wire_name("yaml"), PayloadFormat::Json);
        assert_eq!(PayloadFormat::from_wire_name(" Text "), PayloadFormat::Text);
    }

    #[test]
    fn test_with_headers_preserves_identity() {
        let envelope = Envelope::new("prod", "paper-1", "a.b", "{}").unwrap();
        let tagged = envelope.with_headers([("route", "lobby")]);
        assert_eq!(tagged.meta().id(), envelope.meta().id());
        assert_eq!(tagged.meta().created_at(), envelope.meta().created_at());
        assert_eq!(tagged.meta().header("route"), Some("lobby"));
        assert!(envelope.meta().headers().is_empty());
    }

    #[test]
    fn test_message_type_compose() {
        assert_eq!(message_type("player", "join").unwrap(), "player.join");
        assert!(message_type("player", " ").is_err());
    }
}
