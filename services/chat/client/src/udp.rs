//! Datagram chat client.
//!
//! Chat sends go through a reliable sender: each message is wrapped in a
//! sequenced envelope, retransmitted until acknowledged, and reported if
//! the retry ceiling is ever hit. Inbound enveloped chat is acknowledged
//! immediately and deduplicated before delivery. Connecting probes the
//! server first; a datagram socket cannot refuse a connection, so
//! reachability is proven by the handshake reply arriving within a
//! bounded wait.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chat_session::{
    bind_datagram, encode_ack, ChatEvents, DedupWindow, Protocol, ReliableSender, SessionConfig,
    SessionError,
};
use chat_wire::{AckPayload, Message, MessageKind, ReliableEnvelope};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::inbound::{remote_peer, resolve_probe, ProbePending};

/// Shared state between the client handle and its receive loop
#[derive(Debug, Clone)]
struct ClientContext {
    name: String,
    server_addr: SocketAddr,
    config: SessionConfig,
    socket: Arc<UdpSocket>,
    events: Arc<dyn ChatEvents>,
    sender: Arc<ReliableSender>,
    window: Arc<Mutex<DedupWindow>>,
    probes: Arc<ProbePending>,
}

/// Client for the datagram transport
#[derive(Debug)]
pub struct UdpChatClient {
    ctx: ClientContext,
    recv_handle: JoinHandle<()>,
    connected: AtomicBool,
}

impl UdpChatClient {
    /// Bind, probe the server with the handshake, and start receiving.
    ///
    /// The handshake doubles as the reachability probe: if no reply
    /// arrives within the probe timeout the connect fails with
    /// [`SessionError::PeerUnreachable`].
    pub async fn connect(
        addr: SocketAddr,
        name: impl Into<String>,
        config: SessionConfig,
        events: Arc<dyn ChatEvents>,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        let local: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        let socket = Arc::new(
            bind_datagram(local)
                .await
                .map_err(SessionError::TransportReset)?,
        );

        let handshake = Message::connect(name.clone());
        socket
            .send_to(&handshake.encode()?, addr)
            .await
            .map_err(SessionError::SendFailure)?;

        let mut buf = vec![0u8; config.read_buffer_size];
        let (len, _) = match timeout(config.probe_timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => return Err(SessionError::TransportReset(e)),
            Err(_) => {
                debug!("no handshake reply from {} within bound", addr);
                return Err(SessionError::PeerUnreachable { addr });
            }
        };

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let sender = Arc::new(ReliableSender::new(
            Arc::clone(&socket),
            addr,
            config.retry.clone(),
            expired_tx,
        ));

        let ctx = ClientContext {
            name,
            server_addr: addr,
            config,
            socket,
            events,
            sender,
            window: Arc::new(Mutex::new(DedupWindow::new())),
            probes: Arc::new(ProbePending::new()),
        };

        // The handshake reply is a normal message, usually the welcome
        match Message::decode(&buf[..len]) {
            Ok(first) => dispatch_datagram(&ctx, &first).await,
            Err(e) => warn!("undecodable handshake reply: {}", e),
        }

        tokio::spawn(monitor_expired(Arc::clone(&ctx.events), expired_rx));
        let recv_handle = tokio::spawn(run_recv_loop(ctx.clone()));

        debug!("connected to {} as {}", addr, ctx.name);
        Ok(Self {
            ctx,
            recv_handle,
            connected: AtomicBool::new(true),
        })
    }

    /// Display name this client connected under
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Send chat text reliably; returns the assigned sequence number
    pub async fn send_chat(&self, text: &str) -> Result<u64, SessionError> {
        self.ctx.sender.send_chat(text, &self.ctx.name).await
    }

    /// Number of sends not yet acknowledged by the server
    pub fn pending_len(&self) -> usize {
        self.ctx.sender.pending_len()
    }

    /// True when a retransmission happened and unacknowledged sends remain
    pub fn in_recovery(&self) -> bool {
        self.ctx.sender.in_recovery()
    }

    /// Round trip latency to the server, measured with a probe echo.
    ///
    /// Probes bypass the reliability envelope entirely.
    pub async fn probe_latency(&self) -> Result<Duration, SessionError> {
        let probe = Message::test_probe(self.ctx.name.clone());
        let key = probe.timestamp.to_bits();
        let (tx, rx) = oneshot::channel();
        self.ctx.probes.insert(key, tx);

        self.ctx
            .socket
            .send_to(&probe.encode()?, self.ctx.server_addr)
            .await
            .map_err(SessionError::SendFailure)?;

        match timeout(self.ctx.config.probe_timeout, rx).await {
            Ok(Ok(rtt)) => Ok(rtt),
            _ => {
                self.ctx.probes.remove(&key);
                Err(SessionError::PeerUnreachable {
                    addr: self.ctx.server_addr,
                })
            }
        }
    }

    /// Tell the server goodbye and stop the transport.
    ///
    /// Best effort and idempotent; pending unacknowledged sends are
    /// abandoned.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("disconnecting from {}", self.ctx.server_addr);

        match Message::disconnect(self.ctx.name.clone()).encode() {
            Ok(payload) => {
                self.ctx
                    .socket
                    .send_to(&payload, self.ctx.server_addr)
                    .await
                    .ok();
            }
            Err(e) => debug!("disconnect notice not sent: {}", e),
        }
        self.ctx.sender.shutdown();
        self.recv_handle.abort();
    }
}

impl Drop for UdpChatClient {
    fn drop(&mut self) {
        self.recv_handle.abort();
    }
}

async fn run_recv_loop(ctx: ClientContext) {
    let mut buf = vec![0u8; ctx.config.read_buffer_size];
    loop {
        match ctx.socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from != ctx.server_addr {
                    debug!("ignoring datagram from unexpected source: {}", from);
                    continue;
                }
                match Message::decode(&buf[..len]) {
                    Ok(message) => dispatch_datagram(&ctx, &message).await,
                    Err(e) => warn!("undecodable datagram from server: {}", e),
                }
            }
            Err(e) => {
                warn!("datagram receive failed: {}", e);
                ctx.events.on_status("connection to server lost", true);
                break;
            }
        }
    }
}

async fn dispatch_datagram(ctx: &ClientContext, message: &Message) {
    match message.kind {
        MessageKind::Chat => match ReliableEnvelope::parse(&message.content) {
            Some(envelope) => {
                // Ack unconditionally; duplicates mean our earlier ack was lost
                match encode_ack(&envelope, &ctx.name) {
                    Ok(ack) => {
                        if let Err(e) = ctx.socket.send_to(&ack, ctx.server_addr).await {
                            warn!("ack send failed: {}", e);
                        }
                    }
                    Err(e) => warn!("ack encode failed: {}", e),
                }

                if ctx.window.lock().await.observe(envelope.sequence) {
                    let peer = remote_peer(message, ctx.server_addr, Protocol::Udp);
                    ctx.events.on_message(&peer, &envelope.data);
                } else {
                    debug!("suppressed duplicate: sequence={}", envelope.sequence);
                }
            }
            None => {
                let peer = remote_peer(message, ctx.server_addr, Protocol::Udp);
                ctx.events.on_message(&peer, &message.content);
            }
        },

        MessageKind::Ack => match AckPayload::parse(&message.content) {
            Some(ack) => {
                ctx.sender.process_ack(&ack);
            }
            None => debug!("malformed ack content from server"),
        },

        MessageKind::Status => ctx.events.on_status(&message.content, false),
        MessageKind::Error => ctx.events.on_status(&message.content, true),
        MessageKind::Test => resolve_probe(message, &ctx.probes),

        kind => debug!("ignoring {} from server", kind),
    }
}

/// Surface exhausted retry ceilings to the application
async fn monitor_expired(
    events: Arc<dyn ChatEvents>,
    mut expired_rx: mpsc::UnboundedReceiver<u64>,
) {
    while let Some(sequence) = expired_rx.recv().await {
        let error = SessionError::RetriesExhausted(sequence);
        warn!("{}", error);
        events.on_status(&error.to_string(), true);
    }
}
