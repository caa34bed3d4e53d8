//! Message model and JSON codec for the chat protocol.
//!
//! Every unit of communication is one [`Message`]: a kind tag, a UTF-8
//! content field, an optional sender name, a producer-assigned timestamp,
//! and a protocol version tag. The wire encoding is a single JSON object
//! per message.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Protocol version tag carried in every message
pub const PROTOCOL_VERSION: &str = "1.0";

/// Reserved sender identity for server-origin messages
pub const SERVER_SENDER: &str = "server";

/// Message kinds as defined in the chat protocol
///
/// The taxonomy is closed: a wire payload carrying any other kind string is
/// rejected at decode time rather than coerced to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Handshake; `content` carries the peer's display name
    Connect,
    /// Orderly close notice
    Disconnect,
    /// Chat text; on the reliable datagram path `content` is a nested envelope
    #[serde(rename = "message")]
    Chat,
    /// Informational notice
    Status,
    /// Error notice
    Error,
    /// Latency probe, echoed back with the responder's identity
    Test,
    /// Reliability acknowledgement, consumed by the transport layer
    Ack,
}

impl MessageKind {
    /// Wire spelling of the kind
    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Chat => "message",
            MessageKind::Status => "status",
            MessageKind::Error => "error",
            MessageKind::Test => "test",
            MessageKind::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for MessageKind {
    type Err = WireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "connect" => Ok(MessageKind::Connect),
            "disconnect" => Ok(MessageKind::Disconnect),
            "message" => Ok(MessageKind::Chat),
            "status" => Ok(MessageKind::Status),
            "error" => Ok(MessageKind::Error),
            "test" => Ok(MessageKind::Test),
            "ack" => Ok(MessageKind::Ack),
            _ => Err(WireError::UnknownKind(value.to_string())),
        }
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind; spelled `type` on the wire
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// UTF-8 payload text
    pub content: String,
    /// Display name of the originating peer; `None` before a handshake
    #[serde(rename = "username")]
    pub sender: Option<String>,
    /// Creation time as float seconds since the Unix epoch, producer-assigned
    pub timestamp: f64,
    /// Protocol version tag, carried but not branched on
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Message {
    /// Create a message of the given kind with a fresh timestamp
    pub fn new(kind: MessageKind, content: impl Into<String>, sender: Option<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            sender,
            timestamp: unix_timestamp(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Chat text from a named sender
    pub fn chat(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Chat, content, Some(sender.into()))
    }

    /// Server-origin status notice
    pub fn status(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Status, content, Some(SERVER_SENDER.to_string()))
    }

    /// Server-origin error notice
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content, Some(SERVER_SENDER.to_string()))
    }

    /// Handshake announcing a display name
    pub fn connect(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(MessageKind::Connect, name.clone(), Some(name))
    }

    /// Orderly close notice
    pub fn disconnect(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Disconnect, "", Some(sender.into()))
    }

    /// Acknowledgement carrying an encoded ack payload
    pub fn ack(content: impl Into<String>, sender: Option<String>) -> Self {
        Self::new(MessageKind::Ack, content, sender)
    }

    /// Latency probe with the current wall-clock timestamp
    pub fn test_probe(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Test, "ping", Some(sender.into()))
    }

    /// Echo of this message with only the sender identity replaced.
    ///
    /// Timestamp and version are carried over unchanged so the original
    /// sender can compute the round trip from its own embedded timestamp.
    pub fn echo(&self, responder: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            content: self.content.clone(),
            sender: Some(responder.into()),
            timestamp: self.timestamp,
            version: self.version.clone(),
        }
    }

    /// Display name to attribute this message to
    pub fn sender_name(&self) -> &str {
        self.sender.as_deref().unwrap_or("unknown")
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode one message from a wire payload.
    ///
    /// Leading non-payload bytes are tolerated by scanning for the opening
    /// brace. A payload missing `type`, `content`, or `timestamp` is
    /// rejected outright, as is an unrecognized kind string; nothing is
    /// defaulted or partially trusted.
    pub fn decode(payload: &[u8]) -> Result<Message, WireError> {
        let start = payload
            .iter()
            .position(|&b| b == b'{')
            .ok_or(WireError::Malformed)?;
        if start > 0 {
            tracing::trace!("skipped {} leading bytes before payload start", start);
        }
        let value: serde_json::Value = serde_json::from_slice(&payload[start..])?;
        let object = value.as_object().ok_or(WireError::Malformed)?;

        for field in ["type", "content", "timestamp"] {
            if !object.contains_key(field) {
                return Err(WireError::MissingField(field));
            }
        }

        let kind = object
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(WireError::Malformed)?;
        kind.parse::<MessageKind>()?;

        Ok(serde_json::from_value(value)?)
    }
}

/// Current wall-clock time as float seconds since the Unix epoch
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let msg = Message::chat("hello there", "alice");
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn chat_kind_spelled_message_on_wire() {
        let msg = Message::chat("hi", "bob");
        let text = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(text.contains("\"type\":\"message\""));
        assert!(text.contains("\"username\":\"bob\""));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let payload = br#"{"type":"bogus","content":"x","timestamp":1.0}"#;
        match Message::decode(payload) {
            Err(WireError::UnknownKind(kind)) => assert_eq!(kind, "bogus"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_missing_required_fields() {
        let missing_content = br#"{"type":"status","timestamp":1.0}"#;
        assert!(matches!(
            Message::decode(missing_content),
            Err(WireError::MissingField("content"))
        ));

        let missing_timestamp = br#"{"type":"status","content":"x"}"#;
        assert!(matches!(
            Message::decode(missing_timestamp),
            Err(WireError::MissingField("timestamp"))
        ));

        let missing_type = br#"{"content":"x","timestamp":1.0}"#;
        assert!(matches!(
            Message::decode(missing_type),
            Err(WireError::MissingField("type"))
        ));
    }

    #[test]
    fn decode_skips_leading_noise() {
        let mut payload = b"\x00\x07junk".to_vec();
        payload.extend_from_slice(br#"{"type":"status","content":"ok","timestamp":2.5}"#);
        let msg = Message::decode(&payload).unwrap();
        assert_eq!(msg.kind, MessageKind::Status);
        assert_eq!(msg.content, "ok");
        assert_eq!(msg.timestamp, 2.5);
    }

    #[test]
    fn decode_defaults_version_and_allows_null_sender() {
        let payload = br#"{"type":"message","content":"hi","username":null,"timestamp":3.0}"#;
        let msg = Message::decode(payload).unwrap();
        assert_eq!(msg.version, PROTOCOL_VERSION);
        assert_eq!(msg.sender, None);
        assert_eq!(msg.sender_name(), "unknown");
    }

    #[test]
    fn decode_rejects_non_json_payload() {
        assert!(matches!(
            Message::decode(b"no braces here"),
            Err(WireError::Malformed)
        ));
        assert!(matches!(
            Message::decode(b"{not json"),
            Err(WireError::Json(_))
        ));
    }

    #[test]
    fn test_echo_preserves_timestamp_and_version() {
        let mut probe = Message::test_probe("alice");
        probe.timestamp = 1000.0;
        probe.version = "1.0".to_string();

        let echoed = probe.echo(SERVER_SENDER);
        assert_eq!(echoed.kind, MessageKind::Test);
        assert_eq!(echoed.timestamp, 1000.0);
        assert_eq!(echoed.version, "1.0");
        assert_eq!(echoed.sender.as_deref(), Some("server"));
    }

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in [
            MessageKind::Connect,
            MessageKind::Disconnect,
            MessageKind::Chat,
            MessageKind::Status,
            MessageKind::Error,
            MessageKind::Test,
            MessageKind::Ack,
        ] {
            assert_eq!(kind.as_wire().parse::<MessageKind>().unwrap(), kind);
        }
    }

    #[test]
    fn timestamps_are_epoch_seconds() {
        let now = unix_timestamp();
        assert!(now > 1_600_000_000.0);
    }
}
