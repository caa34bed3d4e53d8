//! Session layer for the chat service.
//!
//! Sits between the wire codec and the server and client surfaces. The
//! stream side runs one session task per connection with framed reads,
//! message dispatch, and idempotent teardown. The datagram side adds a
//! reliability layer: sequenced envelopes, immediate acknowledgements,
//! timed retransmission, and per-peer duplicate suppression.
//!
//! Application behavior is injected through the [`ChatEvents`] trait; the
//! layer itself owns no chat policy beyond the protocol.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod reliable;
pub mod stream;
pub mod transport;

pub use config::{RetryPolicy, SessionConfig};
pub use error::SessionError;
pub use events::{ChatEvents, NullEvents};
pub use registry::{PeerInfo, PeerRecord, PeerRegistry, Protocol, SessionState};
pub use reliable::{
    encode_ack, DedupWindow, PendingSend, ReliableOutbox, ReliableSender, SweepOutcome, DEDUP_SPAN,
};
pub use stream::{run_stream_session, DecodeFailureTracker, SessionNotice, StreamSessionContext};
pub use transport::{bind_datagram, connect, listen};
