//! Chat client surfaces for both transports.
//!
//! [`TcpChatClient`] speaks the framed stream protocol; [`UdpChatClient`]
//! speaks the datagram protocol with reliable, sequenced chat sends.
//! Both fail fast on connect, surface inbound traffic through injected
//! [`chat_session::ChatEvents`] callbacks, measure round-trip latency with
//! probe echoes, and disconnect best-effort.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod inbound;
pub mod tcp;
pub mod udp;

pub use tcp::TcpChatClient;
pub use udp::UdpChatClient;
