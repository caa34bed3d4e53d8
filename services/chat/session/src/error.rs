//! Session and transport error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Session-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer could not be reached during connect or the connectivity probe
    #[error("peer unreachable: {addr}")]
    PeerUnreachable {
        /// Address that failed to answer
        addr: SocketAddr,
    },

    /// Transport-level failure on an established connection
    #[error("transport reset: {0}")]
    TransportReset(#[source] std::io::Error),

    /// A single send failed; the socket is presumed broken
    #[error("send failed: {0}")]
    SendFailure(#[source] std::io::Error),

    /// Too many consecutive undecodable frames from the peer
    #[error("{0} consecutive decode failures")]
    DecodeOverflow(u32),

    /// Retry ceiling reached for an unacknowledged reliable send
    #[error("retries exhausted for sequence {0}")]
    RetriesExhausted(u64),

    /// Wire-level protocol violation
    #[error(transparent)]
    Wire(#[from] chat_wire::WireError),
}
