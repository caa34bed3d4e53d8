//! Datagram chat server.
//!
//! One receive loop serves every peer; there is no per-datagram task.
//! Peer state is created lazily on the first datagram from a new source
//! address: a registry record plus the transport state (duplicate
//! suppression window and a reliable sender with its retry task). Chat is
//! relayed to other datagram peers through each target's own reliable
//! sender; control traffic (welcome, notices, probe echoes, acks) is
//! fire-and-forget.
//!
//! Datagram peers never say goodbye reliably, so a reaper sweeps the
//! registry and drops peers idle past the configured timeout.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chat_session::{
    bind_datagram, encode_ack, ChatEvents, DedupWindow, PeerInfo, PeerRecord, PeerRegistry,
    ReliableSender, SessionConfig, SessionError,
};
use chat_wire::{AckPayload, Message, MessageKind, ReliableEnvelope};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Transport state for one datagram peer
#[derive(Debug)]
struct DatagramPeer {
    window: Arc<Mutex<DedupWindow>>,
    sender: Arc<ReliableSender>,
}

/// Shared state handed to the receive loop and the reaper
#[derive(Debug, Clone)]
struct UdpServerContext {
    config: SessionConfig,
    registry: Arc<PeerRegistry>,
    events: Arc<dyn ChatEvents>,
    peers: Arc<DashMap<SocketAddr, DatagramPeer>>,
    socket: Arc<UdpSocket>,
}

/// Datagram listener and relay hub
#[derive(Debug)]
pub struct UdpChatServer {
    config: SessionConfig,
    registry: Arc<PeerRegistry>,
    events: Arc<dyn ChatEvents>,
    peers: Arc<DashMap<SocketAddr, DatagramPeer>>,
    shutdown_tx: watch::Sender<bool>,
    recv_handle: Option<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl UdpChatServer {
    /// Create a stopped server with the given callbacks
    pub fn new(config: SessionConfig, events: Arc<dyn ChatEvents>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(PeerRegistry::new()),
            events,
            peers: Arc::new(DashMap::new()),
            shutdown_tx,
            recv_handle: None,
            reaper_handle: None,
            local_addr: None,
        }
    }

    /// Registry of currently known datagram peers
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Address the socket is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the socket and start the receive loop and reaper
    pub async fn start(&mut self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        if self.recv_handle.is_some() {
            anyhow::bail!("server already started");
        }

        let socket = bind_datagram(addr)
            .await
            .with_context(|| format!("binding datagram socket on {addr}"))?;
        let local_addr = socket.local_addr().context("reading bound address")?;
        self.local_addr = Some(local_addr);

        let ctx = UdpServerContext {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
            peers: Arc::clone(&self.peers),
            socket: Arc::new(socket),
        };

        self.recv_handle = Some(tokio::spawn(run_recv_loop(
            ctx.clone(),
            self.shutdown_tx.subscribe(),
        )));
        self.reaper_handle = Some(tokio::spawn(run_reaper(
            ctx,
            self.shutdown_tx.subscribe(),
        )));

        info!("datagram chat server started on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop the loops and drop every peer
    pub async fn stop(&mut self) {
        if self.recv_handle.is_none() {
            return;
        }
        info!("stopping datagram chat server");

        self.shutdown_tx.send(true).ok();
        if let Some(handle) = self.recv_handle.take() {
            handle.await.ok();
        }
        if let Some(handle) = self.reaper_handle.take() {
            handle.await.ok();
        }

        for record in self.registry.clear().await {
            self.events.on_peer_disconnected(&record.info);
        }
        for entry in self.peers.iter() {
            entry.value().sender.shutdown();
        }
        self.peers.clear();
        self.local_addr = None;
    }
}

async fn run_recv_loop(ctx: UdpServerContext, mut shutdown_rx: watch::Receiver<bool>) {
    let socket = Arc::clone(&ctx.socket);
    let mut buf = vec![0u8; ctx.config.read_buffer_size];

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("datagram receive loop stopping");
                break;
            }

            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, addr)) => handle_datagram(&ctx, &buf[..len], addr).await,
                    Err(e) => warn!("datagram receive failed: {}", e),
                }
            }
        }
    }
}

async fn handle_datagram(ctx: &UdpServerContext, payload: &[u8], addr: SocketAddr) {
    let message = match Message::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("undecodable datagram from {}: {}", addr, e);
            return;
        }
    };

    let identifier = addr.to_string();
    ensure_peer(ctx, addr).await;
    ctx.registry.touch(&identifier).await;

    match message.kind {
        MessageKind::Connect => {
            let name = message.content.trim();
            if let Some((info, newly_active)) = ctx.registry.activate(&identifier, name).await {
                let welcome = Message::new(
                    MessageKind::Status,
                    format!("Welcome, {}!", info.name),
                    Some(ctx.config.identity.clone()),
                );
                send_raw(ctx, &welcome, addr).await;

                if newly_active {
                    info!("datagram peer joined: id={} name={}", identifier, info.name);
                    ctx.events.on_peer_connected(&info);
                    let text = format!("{} joined the chat", info.name);
                    broadcast_status(ctx, &text, Some(addr)).await;
                }
            }
        }

        MessageKind::Chat => match ReliableEnvelope::parse(&message.content) {
            Some(envelope) => handle_envelope(ctx, &message, envelope, addr).await,
            None => {
                // Interop with plain senders: deliver unsequenced, no ack
                if let Some(info) = ctx.registry.get(&identifier).await {
                    ctx.events.on_message(&info, &message.content);
                    relay_chat(ctx, &info, &message.content).await;
                }
            }
        },

        MessageKind::Ack => {
            if let Some(ack) = AckPayload::parse(&message.content) {
                process_ack(ctx, &ack, addr);
            } else {
                debug!("malformed ack content from {}", addr);
            }
        }

        MessageKind::Test => {
            let echo = message.echo(ctx.config.identity.clone());
            send_raw(ctx, &echo, addr).await;
        }

        MessageKind::Status => ctx.events.on_status(&message.content, false),
        MessageKind::Error => ctx.events.on_status(&message.content, true),

        MessageKind::Disconnect => {
            remove_peer(ctx, addr).await;
        }
    }
}

/// Acknowledge and, when first seen, deliver and relay one enveloped chat
async fn handle_envelope(
    ctx: &UdpServerContext,
    message: &Message,
    envelope: ReliableEnvelope,
    addr: SocketAddr,
) {
    // Ack unconditionally; duplicates mean our earlier ack was lost
    match encode_ack(&envelope, &ctx.config.identity) {
        Ok(ack) => {
            if let Err(e) = ctx.socket.send_to(&ack, addr).await {
                warn!("ack send failed: peer={} error={}", addr, e);
            }
        }
        Err(e) => warn!("ack encode failed: {}", e),
    }

    let window = ctx.peers.get(&addr).map(|peer| Arc::clone(&peer.window));
    let deliver = match window {
        Some(window) => window.lock().await.observe(envelope.sequence),
        None => false,
    };
    if !deliver {
        debug!(
            "suppressed duplicate: peer={} sequence={}",
            addr, envelope.sequence
        );
        return;
    }

    if let Some(info) = ctx.registry.get(&addr.to_string()).await {
        debug!(
            "delivering: peer={} sequence={} sender={}",
            addr,
            envelope.sequence,
            message.sender_name()
        );
        ctx.events.on_message(&info, &envelope.data);
        relay_chat(ctx, &info, &envelope.data).await;
    }
}

fn process_ack(ctx: &UdpServerContext, ack: &AckPayload, addr: SocketAddr) {
    let sender = ctx
        .peers
        .get(&addr)
        .map(|peer| Arc::clone(&peer.sender));
    match sender {
        Some(sender) => {
            sender.process_ack(ack);
        }
        None => debug!("ack from unknown peer: {}", addr),
    }
}

/// Create registry and transport state on the first datagram from a source
async fn ensure_peer(ctx: &UdpServerContext, addr: SocketAddr) {
    if ctx.peers.contains_key(&addr) {
        return;
    }

    info!("new datagram peer: {}", addr);
    let (expired_tx, expired_rx) = mpsc::unbounded_channel();
    let sender = Arc::new(ReliableSender::new(
        Arc::clone(&ctx.socket),
        addr,
        ctx.config.retry.clone(),
        expired_tx,
    ));
    ctx.peers.insert(
        addr,
        DatagramPeer {
            window: Arc::new(Mutex::new(DedupWindow::new())),
            sender,
        },
    );
    ctx.registry.register(PeerRecord::datagram(addr)).await;

    tokio::spawn(monitor_expiry(ctx.clone(), addr, expired_rx));
}

/// Tear the peer down once its reliable sender reports an exhausted retry
/// ceiling; exits quietly when the sender shuts down first.
async fn monitor_expiry(
    ctx: UdpServerContext,
    addr: SocketAddr,
    mut expired_rx: mpsc::UnboundedReceiver<u64>,
) {
    if let Some(sequence) = expired_rx.recv().await {
        let error = SessionError::RetriesExhausted(sequence);
        warn!("dropping peer {}: {}", addr, error);
        ctx.events.on_status(&error.to_string(), true);
        remove_peer(&ctx, addr).await;
    }
}

/// Remove a peer's records, notify once, and announce the departure
async fn remove_peer(ctx: &UdpServerContext, addr: SocketAddr) {
    let identifier = addr.to_string();
    if let Some(record) = ctx.registry.remove(&identifier).await {
        if let Some((_, peer)) = ctx.peers.remove(&addr) {
            peer.sender.shutdown();
        }
        info!("datagram peer left: id={} name={}", identifier, record.info.name);
        ctx.events.on_peer_disconnected(&record.info);
        let text = format!("{} left the chat", record.info.name);
        broadcast_status(ctx, &text, Some(addr)).await;
    }
}

/// Drop peers that have gone quiet past the idle timeout
async fn run_reaper(ctx: UdpServerContext, mut shutdown_rx: watch::Receiver<bool>) {
    let mut sweep = interval(ctx.config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("reaper stopping");
                break;
            }

            _ = sweep.tick() => {
                let stale = ctx.registry.stale_datagram_peers(ctx.config.idle_timeout).await;
                for identifier in stale {
                    match identifier.parse::<SocketAddr>() {
                        Ok(addr) => {
                            info!("reaping idle datagram peer: {}", identifier);
                            remove_peer(&ctx, addr).await;
                        }
                        Err(e) => warn!("unparseable peer identifier {}: {}", identifier, e),
                    }
                }
            }
        }
    }
}

/// Relay chat text to every other datagram peer through its reliable sender
async fn relay_chat(ctx: &UdpServerContext, origin: &PeerInfo, text: &str) {
    let targets: Vec<SocketAddr> = ctx
        .peers
        .iter()
        .map(|entry| *entry.key())
        .filter(|addr| *addr != origin.addr)
        .collect();

    for addr in targets {
        let sender = ctx.peers.get(&addr).map(|peer| Arc::clone(&peer.sender));
        if let Some(sender) = sender {
            if let Err(e) = sender.send_chat(text, &origin.name).await {
                warn!("relay failed: peer={} error={}", addr, e);
            }
        }
    }
}

/// Fire-and-forget status notice to every peer but `exclude`
async fn broadcast_status(ctx: &UdpServerContext, text: &str, exclude: Option<SocketAddr>) {
    let status = Message::new(
        MessageKind::Status,
        text,
        Some(ctx.config.identity.clone()),
    );
    let payload = match status.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("status encode failed: {}", e);
            return;
        }
    };

    for info in ctx.registry.snapshot().await {
        if Some(info.addr) == exclude {
            continue;
        }
        if let Err(e) = ctx.socket.send_to(&payload, info.addr).await {
            debug!("status send failed: peer={} error={}", info.addr, e);
        }
    }
}

async fn send_raw(ctx: &UdpServerContext, message: &Message, addr: SocketAddr) {
    match message.encode() {
        Ok(payload) => {
            if let Err(e) = ctx.socket.send_to(&payload, addr).await {
                warn!("send failed: peer={} error={}", addr, e);
            }
        }
        Err(e) => warn!("encode failed: {}", e),
    }
}
