//! Wire protocol for the chat transport: message codec, stream framing, and
//! reliability envelopes.
//!
//! Every message is one JSON object. On the stream transport each encoded
//! message is carried as a length-prefixed frame; on the datagram transport
//! each datagram is exactly one encoded message, with chat payloads wrapped
//! in a sequenced envelope when sent through the reliability layer.
//!
//! ## Wire Format
//!
//! ```text
//! stream:   +----------------+---------------------------+
//!           | u32 length (BE)| JSON message (length bytes)|
//!           +----------------+---------------------------+
//!
//! message:  { "type": "<connect|disconnect|message|status|error|test|ack>",
//!             "content": "<string>",
//!             "username": "<string|null>",
//!             "timestamp": <float seconds since epoch>,
//!             "version": "1.0" }
//!
//! reliable chat content:  { "sequence": <int>, "data": "<string>",
//!                           "test_id": "<string|null>" }
//! ack content:            { "sequence": <int>, "test_id": "<string|null>" }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod frame;
pub mod message;

// Re-export main types
pub use envelope::{AckPayload, ReliableEnvelope};
pub use error::WireError;
pub use frame::{encode_frame, FrameDecoder, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use message::{unix_timestamp, Message, MessageKind, PROTOCOL_VERSION, SERVER_SENDER};
