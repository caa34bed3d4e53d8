//! Event callbacks the transport layer invokes toward the application.

use std::fmt;

use crate::registry::PeerInfo;

/// Trait for handling chat transport events
///
/// Implementations are invoked from whichever internal task observed the
/// event and must be safe to call concurrently. Handlers are injected
/// through the server and client constructors; there is no ambient global
/// to register against.
pub trait ChatEvents: Send + Sync + fmt::Debug {
    /// A chat message was delivered from a peer
    fn on_message(&self, peer: &PeerInfo, text: &str);
    /// A status or error notice arrived
    fn on_status(&self, text: &str, is_error: bool);
    /// A peer completed its handshake
    fn on_peer_connected(&self, peer: &PeerInfo);
    /// A peer's session was torn down
    fn on_peer_disconnected(&self, peer: &PeerInfo);
}

/// Event sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl ChatEvents for NullEvents {
    fn on_message(&self, _peer: &PeerInfo, _text: &str) {}
    fn on_status(&self, _text: &str, _is_error: bool) {}
    fn on_peer_connected(&self, _peer: &PeerInfo) {}
    fn on_peer_disconnected(&self, _peer: &PeerInfo) {}
}
