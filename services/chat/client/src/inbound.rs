//! Inbound dispatch helpers shared by both client transports.

use std::net::SocketAddr;
use std::time::Duration;

use chat_session::{PeerInfo, Protocol};
use chat_wire::{unix_timestamp, Message};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Outstanding latency probes keyed by the probe's timestamp bits
pub(crate) type ProbePending = DashMap<u64, oneshot::Sender<Duration>>;

/// Identity snapshot for the remote author of a relayed message.
///
/// Clients only ever talk to the server, so the address is the server's;
/// the name comes from the message itself.
pub(crate) fn remote_peer(
    message: &Message,
    server_addr: SocketAddr,
    protocol: Protocol,
) -> PeerInfo {
    let name = message.sender_name().to_string();
    PeerInfo {
        identifier: name.clone(),
        name,
        protocol,
        addr: server_addr,
    }
}

/// Resolve the waiting probe matching an echoed test message.
///
/// The echo carries the probe's own timestamp, which both correlates it
/// and yields the round trip time against the current clock.
pub(crate) fn resolve_probe(message: &Message, probes: &ProbePending) {
    let key = message.timestamp.to_bits();
    match probes.remove(&key) {
        Some((_, tx)) => {
            let elapsed = (unix_timestamp() - message.timestamp).max(0.0);
            tx.send(Duration::from_secs_f64(elapsed)).ok();
        }
        None => debug!("unmatched probe echo: timestamp={}", message.timestamp),
    }
}
