//! Chat server surfaces for both transports.
//!
//! [`TcpChatServer`] accepts stream connections and runs one session task
//! per peer; [`UdpChatServer`] serves every datagram peer from a single
//! receive loop with lazily created per-peer state. Both relay chat among
//! their own peers, announce joins and leaves, and report everything to
//! the embedding application through injected [`chat_session::ChatEvents`]
//! callbacks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod tcp;
pub mod udp;

pub use tcp::TcpChatServer;
pub use udp::UdpChatServer;
