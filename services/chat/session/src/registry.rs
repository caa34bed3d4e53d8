//! Server-side peer registry.
//!
//! One record per logical connected client, keyed by the address-derived
//! identifier. The listener owns the registry; session loops update their
//! own record and remove it exactly once on teardown, which is what makes
//! disconnect notification idempotent.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chat_wire::Message;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Transport a peer is connected over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream transport
    Tcp,
    /// Datagram transport
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Lifecycle of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted or first datagram seen, handshake not yet received
    Handshaking,
    /// Handshake complete, display name known
    Active,
    /// Teardown in progress
    Closing,
    /// Socket closed and record removed
    Closed,
}

/// Identity snapshot for one peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Address-derived identifier ("ip:port")
    pub identifier: String,
    /// Display name; the identifier until a handshake names the peer
    pub name: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Source socket address
    pub addr: SocketAddr,
}

/// Server-side bookkeeping entry for one connected client
#[derive(Debug)]
pub struct PeerRecord {
    /// Identity snapshot
    pub info: PeerInfo,
    /// Session lifecycle state
    pub state: SessionState,
    /// Refreshed on every inbound frame or datagram
    pub last_activity: Instant,
    /// Outbound frame channel; present for stream peers only
    pub outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl PeerRecord {
    /// Record for an accepted stream connection
    pub fn stream(addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self::new(addr, Protocol::Tcp, Some(outbound))
    }

    /// Record for a newly seen datagram source address
    pub fn datagram(addr: SocketAddr) -> Self {
        Self::new(addr, Protocol::Udp, None)
    }

    fn new(
        addr: SocketAddr,
        protocol: Protocol,
        outbound: Option<mpsc::UnboundedSender<Message>>,
    ) -> Self {
        let identifier = addr.to_string();
        Self {
            info: PeerInfo {
                name: identifier.clone(),
                identifier,
                protocol,
                addr,
            },
            state: SessionState::Handshaking,
            last_activity: Instant::now(),
            outbound,
        }
    }
}

/// Registry of connected peers, keyed by identifier.
///
/// A single lock guards the map; it is held only for map operations, never
/// across socket I/O. Outbound traffic to stream peers goes through the
/// per-record channel so the owning session task stays the only writer on
/// its socket.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning any record it displaced
    pub async fn register(&self, record: PeerRecord) -> Option<PeerRecord> {
        debug!(
            "registered peer: id={} protocol={}",
            record.info.identifier, record.info.protocol
        );
        let mut peers = self.peers.write().await;
        peers.insert(record.info.identifier.clone(), record)
    }

    /// Remove a record.
    ///
    /// The caller that receives `Some` owns the disconnect notification;
    /// racing removals see `None` and must not notify again.
    pub async fn remove(&self, identifier: &str) -> Option<PeerRecord> {
        let mut peers = self.peers.write().await;
        let removed = peers.remove(identifier);
        if removed.is_some() {
            debug!("removed peer: id={}", identifier);
        }
        removed
    }

    /// Refresh a peer's last-activity time
    pub async fn touch(&self, identifier: &str) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(identifier) {
            record.last_activity = Instant::now();
        }
    }

    /// Capture a display name from a handshake and activate the session.
    ///
    /// Returns the updated info and whether this handshake was the one that
    /// activated the session (renames return `false`).
    pub async fn activate(&self, identifier: &str, name: &str) -> Option<(PeerInfo, bool)> {
        let mut peers = self.peers.write().await;
        let record = peers.get_mut(identifier)?;
        let newly_active = record.state == SessionState::Handshaking;
        record.state = SessionState::Active;
        if !name.is_empty() {
            record.info.name = name.to_string();
        }
        record.last_activity = Instant::now();
        Some((record.info.clone(), newly_active))
    }

    /// Identity snapshot for one peer
    pub async fn get(&self, identifier: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().await;
        peers.get(identifier).map(|record| record.info.clone())
    }

    /// Identity snapshots for all connected peers
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().map(|record| record.info.clone()).collect()
    }

    /// Datagram peers idle longer than `idle`, for the reaper
    pub async fn stale_datagram_peers(&self, idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|record| {
                record.info.protocol == Protocol::Udp
                    && now.duration_since(record.last_activity) > idle
            })
            .map(|record| record.info.identifier.clone())
            .collect()
    }

    /// Outbound channels of stream peers, optionally excluding one identifier
    pub async fn stream_targets(
        &self,
        exclude: Option<&str>,
    ) -> Vec<(PeerInfo, mpsc::UnboundedSender<Message>)> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|record| Some(record.info.identifier.as_str()) != exclude)
            .filter_map(|record| {
                record
                    .outbound
                    .as_ref()
                    .map(|tx| (record.info.clone(), tx.clone()))
            })
            .collect()
    }

    /// Number of connected peers
    pub async fn len(&self) -> usize {
        let peers = self.peers.read().await;
        peers.len()
    }

    /// True when no peers are connected
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drain every record, for listener shutdown
    pub async fn clear(&self) -> Vec<PeerRecord> {
        let mut peers = self.peers.write().await;
        peers.drain().map(|(_, record)| record).collect()
    }
}
