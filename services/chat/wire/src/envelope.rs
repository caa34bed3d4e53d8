//! Nested JSON envelopes for the reliable datagram path.
//!
//! A chat message sent reliably over the datagram transport carries a
//! [`ReliableEnvelope`] in its `content` field; the matching acknowledgement
//! carries an [`AckPayload`]. Both are plain JSON objects nested inside the
//! outer message's content string.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Sequenced wrapper around one reliable chat payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableEnvelope {
    /// Per-sender monotonic sequence number, starting at 0
    pub sequence: u64,
    /// The true chat payload
    pub data: String,
    /// Optional probe correlation id, echoed back in the matching ack
    #[serde(default)]
    pub test_id: Option<String>,
}

impl ReliableEnvelope {
    /// Wrap a payload under a sequence number
    pub fn new(sequence: u64, data: impl Into<String>) -> Self {
        Self {
            sequence,
            data: data.into(),
            test_id: None,
        }
    }

    /// Attach a probe correlation id
    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    /// Serialize to the JSON string carried in a chat `content`
    pub fn to_content(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a chat `content`; `None` when it is not an envelope.
    ///
    /// Plain senders put bare text in `content`, so failure to parse is
    /// interoperation, not an error.
    pub fn parse(content: &str) -> Option<ReliableEnvelope> {
        serde_json::from_str(content).ok()
    }
}

/// Acknowledgement payload carried in an `ack` message `content`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Sequence number being acknowledged
    pub sequence: u64,
    /// Probe correlation id from the acknowledged envelope, if any
    #[serde(default)]
    pub test_id: Option<String>,
}

impl AckPayload {
    /// Acknowledge one sequence number
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            test_id: None,
        }
    }

    /// Build the ack for a received envelope, echoing its correlation id
    pub fn for_envelope(envelope: &ReliableEnvelope) -> Self {
        Self {
            sequence: envelope.sequence,
            test_id: envelope.test_id.clone(),
        }
    }

    /// Serialize to the JSON string carried in an ack `content`
    pub fn to_content(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an ack `content`; `None` when malformed
    pub fn parse(content: &str) -> Option<AckPayload> {
        serde_json::from_str(content).ok()
    }
}
