//! Stream chat server.
//!
//! The listener accepts connections and spawns one
//! [`chat_session::run_stream_session`] task per peer; each task owns its
//! socket exclusively. Cross-peer traffic (join and leave announcements,
//! chat relay) flows through the notice channel back to a single relay
//! loop here, so no session ever writes to another session's socket.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chat_session::{
    listen, run_stream_session, ChatEvents, PeerRecord, PeerRegistry, SessionConfig,
    SessionNotice, StreamSessionContext,
};
use chat_wire::{Message, MessageKind};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Listener and relay hub for stream peers
#[derive(Debug)]
pub struct TcpChatServer {
    config: SessionConfig,
    registry: Arc<PeerRegistry>,
    events: Arc<dyn ChatEvents>,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: Option<JoinHandle<()>>,
    relay_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpChatServer {
    /// Create a stopped server with the given callbacks
    pub fn new(config: SessionConfig, events: Arc<dyn ChatEvents>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(PeerRegistry::new()),
            events,
            shutdown_tx,
            accept_handle: None,
            relay_handle: None,
            local_addr: None,
        }
    }

    /// Registry of currently connected stream peers
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start accepting peers.
    ///
    /// Returns the bound address, which differs from `addr` when an
    /// ephemeral port was requested.
    pub async fn start(&mut self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        if self.accept_handle.is_some() {
            anyhow::bail!("server already started");
        }

        let listener = listen(addr)
            .await
            .with_context(|| format!("binding stream listener on {addr}"))?;
        let local_addr = listener.local_addr().context("reading bound address")?;
        self.local_addr = Some(local_addr);

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let ctx = StreamSessionContext::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.events),
            notice_tx,
            self.shutdown_tx.subscribe(),
        );

        self.relay_handle = Some(tokio::spawn(run_relay_loop(
            Arc::clone(&self.registry),
            self.config.identity.clone(),
            notice_rx,
        )));
        self.accept_handle = Some(tokio::spawn(run_accept_loop(
            listener,
            ctx,
            self.shutdown_tx.subscribe(),
        )));

        info!("stream chat server started on {}", local_addr);
        Ok(local_addr)
    }

    /// Broadcast a message to connected stream peers.
    ///
    /// `exclude` skips one peer by identifier, for relaying a message back
    /// to everyone but its origin.
    pub async fn broadcast(&self, message: Message, exclude: Option<&str>) {
        broadcast_to_streams(&self.registry, message, exclude).await;
    }

    /// Stop accepting, close every session, and drain the relay loop
    pub async fn stop(&mut self) {
        if self.accept_handle.is_none() {
            return;
        }
        info!("stopping stream chat server");

        self.shutdown_tx.send(true).ok();
        if let Some(handle) = self.accept_handle.take() {
            handle.await.ok();
        }
        // Ends once every session has dropped its notice sender
        if let Some(handle) = self.relay_handle.take() {
            handle.await.ok();
        }

        for record in self.registry.clear().await {
            self.events.on_peer_disconnected(&record.info);
        }
        self.local_addr = None;
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    ctx: StreamSessionContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("accept loop stopping");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        info!("accepted stream peer: {}", peer_addr);
                        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                        ctx.registry
                            .register(PeerRecord::stream(peer_addr, outbound_tx))
                            .await;

                        let session_ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                run_stream_session(session_ctx, socket, peer_addr, outbound_rx).await
                            {
                                debug!("session ended: peer={} error={}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Consume session notices and fan traffic out to the other peers
async fn run_relay_loop(
    registry: Arc<PeerRegistry>,
    identity: String,
    mut notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
) {
    while let Some(notice) = notice_rx.recv().await {
        match notice {
            SessionNotice::Joined { info } => {
                let text = format!("{} joined the chat", info.name);
                info!("{}", text);
                let status = Message::new(MessageKind::Status, text, Some(identity.clone()));
                broadcast_to_streams(&registry, status, Some(&info.identifier)).await;
            }
            SessionNotice::Chat { info, message } => {
                broadcast_to_streams(&registry, message, Some(&info.identifier)).await;
            }
            SessionNotice::Closed { info } => {
                let text = format!("{} left the chat", info.name);
                info!("{}", text);
                let status = Message::new(MessageKind::Status, text, Some(identity.clone()));
                broadcast_to_streams(&registry, status, Some(&info.identifier)).await;
            }
        }
    }
    debug!("relay loop drained");
}

async fn broadcast_to_streams(registry: &PeerRegistry, message: Message, exclude: Option<&str>) {
    let targets = registry.stream_targets(exclude).await;
    let mut sent = 0;
    for (info, tx) in targets {
        if tx.send(message.clone()).is_ok() {
            sent += 1;
        } else {
            debug!("broadcast skipped closing peer: {}", info.identifier);
        }
    }
    debug!("broadcast {} to {} stream peers", message.kind, sent);
}
