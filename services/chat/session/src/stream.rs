//! Per-connection session loop for stream peers.
//!
//! Each accepted connection gets one [`run_stream_session`] task that owns
//! the socket for its whole life: it reads frames, dispatches decoded
//! messages, writes replies, and drains an outbound channel the listener
//! uses for relayed traffic. Cross-session effects (join and leave notices,
//! chat relay) are reported to the listener over a notice channel instead
//! of touching other sockets directly.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use chat_wire::{encode_frame, FrameDecoder, Message, MessageKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::ChatEvents;
use crate::registry::{PeerInfo, PeerRegistry};

/// Cross-session effect reported to the listener that owns the session
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// A peer completed its handshake
    Joined {
        /// The newly named peer
        info: PeerInfo,
    },
    /// A peer sent chat text to relay to everyone else
    Chat {
        /// Originating peer, for relay exclusion
        info: PeerInfo,
        /// The original message, forwarded verbatim
        message: Message,
    },
    /// A peer's session ended and its record was removed
    Closed {
        /// The departed peer
        info: PeerInfo,
    },
}

/// Consecutive decode-failure counter for one session.
///
/// Isolated decode failures are tolerated; a run of them means the peer is
/// not speaking the protocol and the session should drop.
#[derive(Debug)]
pub struct DecodeFailureTracker {
    consecutive: u32,
    limit: u32,
}

impl DecodeFailureTracker {
    /// Tracker that turns fatal at `limit` consecutive failures
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
        }
    }

    /// Record one failure; true when the limit is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        warn!(
            "decode failure {} of {} tolerated",
            self.consecutive, self.limit
        );
        self.consecutive >= self.limit
    }

    /// A successful decode resets the run
    pub fn record_success(&mut self) {
        if self.consecutive > 0 {
            debug!("decode recovered after {} failures", self.consecutive);
        }
        self.consecutive = 0;
    }

    /// Current run length
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Shared dependencies handed to every stream session
#[derive(Debug, Clone)]
pub struct StreamSessionContext {
    /// Session tuning knobs
    pub config: SessionConfig,
    /// Registry the session's record lives in
    pub registry: Arc<PeerRegistry>,
    /// Application callbacks
    pub events: Arc<dyn ChatEvents>,
    /// Channel to the owning listener for cross-session effects
    pub notice_tx: mpsc::UnboundedSender<SessionNotice>,
    /// Listener shutdown signal
    pub shutdown_rx: watch::Receiver<bool>,
}

impl StreamSessionContext {
    /// Bundle the dependencies for one listener's sessions
    pub fn new(
        config: SessionConfig,
        registry: Arc<PeerRegistry>,
        events: Arc<dyn ChatEvents>,
        notice_tx: mpsc::UnboundedSender<SessionNotice>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
            notice_tx,
            shutdown_rx,
        }
    }
}

enum SessionFlow {
    Continue,
    Close,
}

/// Drive one stream peer's session to completion.
///
/// The caller registers the peer's record (with the outbound channel's
/// sender) before spawning this; the loop removes the record on the way
/// out, so disconnect notification happens exactly once no matter how the
/// session ends.
pub async fn run_stream_session<S>(
    ctx: StreamSessionContext,
    mut stream: S,
    peer_addr: SocketAddr,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identifier = peer_addr.to_string();
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(ctx.config.read_buffer_size);
    let mut failures = DecodeFailureTracker::new(ctx.config.max_decode_failures);
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    debug!("session started: peer={}", identifier);

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("session stopping on shutdown signal: peer={}", identifier);
                break Ok(());
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(e) = write_message(&mut stream, &message).await {
                            break Err(e);
                        }
                    }
                    // Listener dropped the record and its sender
                    None => break Ok(()),
                }
            }

            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("peer closed the stream: peer={}", identifier);
                        break Ok(());
                    }
                    Ok(_) => {
                        match drain_frames(&ctx, &mut stream, &identifier, &mut decoder, &mut buf, &mut failures).await {
                            Ok(SessionFlow::Continue) => {}
                            Ok(SessionFlow::Close) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Err(e) => break Err(SessionError::TransportReset(e)),
                }
            }
        }
    };

    if let Err(e) = &result {
        warn!("session failed: peer={} error={}", identifier, e);
    }
    teardown(&ctx, &identifier).await;
    result
}

/// Decode and dispatch every complete frame buffered so far
async fn drain_frames<S>(
    ctx: &StreamSessionContext,
    stream: &mut S,
    identifier: &str,
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
    failures: &mut DecodeFailureTracker,
) -> Result<SessionFlow, SessionError>
where
    S: AsyncWrite + Unpin,
{
    loop {
        let frame = match decoder.decode(buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(SessionFlow::Continue),
            // An oversized length prefix poisons the byte stream
            Err(e) => return Err(e.into()),
        };

        match Message::decode(&frame) {
            Ok(message) => {
                failures.record_success();
                match dispatch(ctx, stream, identifier, message).await? {
                    SessionFlow::Continue => {}
                    SessionFlow::Close => return Ok(SessionFlow::Close),
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("undecodable frame: peer={} error={}", identifier, e);
                if failures.record_failure() {
                    return Err(SessionError::DecodeOverflow(failures.consecutive()));
                }
            }
        }
    }
}

/// Handle one decoded message from the peer
async fn dispatch<S>(
    ctx: &StreamSessionContext,
    stream: &mut S,
    identifier: &str,
    message: Message,
) -> Result<SessionFlow, SessionError>
where
    S: AsyncWrite + Unpin,
{
    ctx.registry.touch(identifier).await;

    match message.kind {
        MessageKind::Connect => {
            let name = message.content.trim();
            if let Some((info, newly_active)) = ctx.registry.activate(identifier, name).await {
                let welcome = Message::new(
                    MessageKind::Status,
                    format!("Welcome, {}!", info.name),
                    Some(ctx.config.identity.clone()),
                );
                write_message(stream, &welcome).await?;

                if newly_active {
                    debug!("peer joined: id={} name={}", identifier, info.name);
                    ctx.events.on_peer_connected(&info);
                    ctx.notice_tx.send(SessionNotice::Joined { info }).ok();
                }
            } else {
                warn!("handshake from unregistered peer: id={}", identifier);
            }
        }

        MessageKind::Chat => {
            if let Some(info) = ctx.registry.get(identifier).await {
                ctx.events.on_message(&info, &message.content);
                ctx.notice_tx.send(SessionNotice::Chat { info, message }).ok();
            }
        }

        MessageKind::Status => {
            ctx.events.on_status(&message.content, false);
        }

        MessageKind::Error => {
            ctx.events.on_status(&message.content, true);
        }

        MessageKind::Test => {
            let echo = message.echo(ctx.config.identity.clone());
            write_message(stream, &echo).await?;
        }

        // Stream traffic is not sequenced; a stray ack is transport noise
        MessageKind::Ack => {
            debug!("ignoring ack on stream transport: peer={}", identifier);
        }

        MessageKind::Disconnect => {
            debug!("peer requested disconnect: id={}", identifier);
            return Ok(SessionFlow::Close);
        }
    }

    Ok(SessionFlow::Continue)
}

/// Remove the peer's record and notify, exactly once across racing paths
async fn teardown(ctx: &StreamSessionContext, identifier: &str) {
    if let Some(record) = ctx.registry.remove(identifier).await {
        debug!("session closed: peer={} name={}", identifier, record.info.name);
        ctx.events.on_peer_disconnected(&record.info);
        ctx.notice_tx
            .send(SessionNotice::Closed { info: record.info })
            .ok();
    }
}

async fn write_message<S>(stream: &mut S, message: &Message) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_frame(&message.encode()?)?;
    stream
        .write_all(&frame)
        .await
        .map_err(SessionError::SendFailure)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerRecord;
    use chat_wire::{WireError, LENGTH_PREFIX_SIZE};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    #[derive(Debug, Default)]
    struct RecordingEvents {
        messages: Mutex<Vec<(String, String)>>,
        statuses: Mutex<Vec<(String, bool)>>,
        connected: Mutex<Vec<String>>,
        disconnected: Mutex<Vec<String>>,
    }

    impl ChatEvents for RecordingEvents {
        fn on_message(&self, peer: &PeerInfo, text: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((peer.name.clone(), text.to_string()));
        }

        fn on_status(&self, text: &str, is_error: bool) {
            self.statuses
                .lock()
                .unwrap()
                .push((text.to_string(), is_error));
        }

        fn on_peer_connected(&self, peer: &PeerInfo) {
            self.connected.lock().unwrap().push(peer.name.clone());
        }

        fn on_peer_disconnected(&self, peer: &PeerInfo) {
            self.disconnected.lock().unwrap().push(peer.name.clone());
        }
    }

    struct TestSession {
        client: DuplexStream,
        events: Arc<RecordingEvents>,
        registry: Arc<PeerRegistry>,
        notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
        outbound_tx: mpsc::UnboundedSender<Message>,
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<Result<(), SessionError>>,
        addr: SocketAddr,
    }

    async fn start_session() -> TestSession {
        let (client, server) = tokio::io::duplex(4096);
        let registry = Arc::new(PeerRegistry::new());
        let events = Arc::new(RecordingEvents::default());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        registry
            .register(PeerRecord::stream(addr, outbound_tx.clone()))
            .await;

        let ctx = StreamSessionContext::new(
            SessionConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&events) as Arc<dyn ChatEvents>,
            notice_tx,
            shutdown_rx,
        );
        let handle = tokio::spawn(run_stream_session(ctx, server, addr, outbound_rx));

        TestSession {
            client,
            events,
            registry,
            notice_rx,
            outbound_tx,
            shutdown_tx,
            handle,
            addr,
        }
    }

    async fn send(client: &mut DuplexStream, message: &Message) {
        let frame = encode_frame(&message.encode().unwrap()).unwrap();
        client.write_all(&frame).await.unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> Message {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        loop {
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                return Message::decode(&frame).unwrap();
            }
            let n = client.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed while waiting for a message");
        }
    }

    #[tokio::test]
    async fn handshake_names_peer_and_welcomes() {
        let mut session = start_session().await;

        send(&mut session.client, &Message::connect("alice")).await;

        let welcome = timeout(Duration::from_secs(2), recv(&mut session.client))
            .await
            .unwrap();
        assert_eq!(welcome.kind, MessageKind::Status);
        assert_eq!(welcome.content, "Welcome, alice!");
        assert_eq!(welcome.sender.as_deref(), Some("server"));

        match session.notice_rx.recv().await.unwrap() {
            SessionNotice::Joined { info } => assert_eq!(info.name, "alice"),
            other => panic!("expected Joined, got {other:?}"),
        }
        assert_eq!(*session.events.connected.lock().unwrap(), vec!["alice"]);

        let info = session.registry.get(&session.addr.to_string()).await.unwrap();
        assert_eq!(info.name, "alice");
    }

    #[tokio::test]
    async fn chat_reaches_callbacks_and_listener() {
        let mut session = start_session().await;

        send(&mut session.client, &Message::connect("alice")).await;
        let _welcome = recv(&mut session.client).await;
        let _joined = session.notice_rx.recv().await;

        send(&mut session.client, &Message::chat("hello", "alice")).await;

        let notice = timeout(Duration::from_secs(2), session.notice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match notice {
            SessionNotice::Chat { info, message } => {
                assert_eq!(info.name, "alice");
                assert_eq!(message.content, "hello");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
        assert_eq!(
            *session.events.messages.lock().unwrap(),
            vec![("alice".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_probe_is_echoed_with_original_timestamp() {
        let mut session = start_session().await;

        let mut probe = Message::test_probe("alice");
        probe.timestamp = 1000.0;
        send(&mut session.client, &probe).await;

        let echo = timeout(Duration::from_secs(2), recv(&mut session.client))
            .await
            .unwrap();
        assert_eq!(echo.kind, MessageKind::Test);
        assert_eq!(echo.content, "ping");
        assert_eq!(echo.timestamp, 1000.0);
        assert_eq!(echo.version, probe.version);
        assert_eq!(echo.sender.as_deref(), Some("server"));
    }

    #[tokio::test]
    async fn single_decode_failure_is_tolerated() {
        let mut session = start_session().await;

        let garbage = encode_frame(b"not json at all").unwrap();
        session.client.write_all(&garbage).await.unwrap();

        send(&mut session.client, &Message::chat("still here", "alice")).await;

        let notice = timeout(Duration::from_secs(2), session.notice_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match notice {
            SessionNotice::Chat { message, .. } => assert_eq!(message.content, "still here"),
            other => panic!("expected Chat, got {other:?}"),
        }
        assert!(!session.handle.is_finished());
    }

    #[tokio::test]
    async fn consecutive_decode_failures_close_the_session() {
        let mut session = start_session().await;

        for _ in 0..3 {
            let garbage = encode_frame(b"\x01\x02\x03").unwrap();
            session.client.write_all(&garbage).await.unwrap();
        }

        let result = timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::DecodeOverflow(3))));
        assert_eq!(session.events.disconnected.lock().unwrap().len(), 1);
        assert!(session.registry.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_kind_counts_as_decode_failure() {
        let mut session = start_session().await;

        let payload = br#"{"type":"bogus","content":"x","timestamp":1.0}"#;
        for _ in 0..3 {
            let frame = encode_frame(payload).unwrap();
            session.client.write_all(&frame).await.unwrap();
        }

        let result = timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::DecodeOverflow(3))));
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal_immediately() {
        let mut session = start_session().await;

        let two_mib: u32 = 2 * 1024 * 1024;
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&two_mib.to_be_bytes());
        session.client.write_all(&prefix).await.unwrap();

        let result = timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Wire(WireError::FrameTooLarge(_)))
        ));
        assert_eq!(session.events.disconnected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_message_closes_cleanly() {
        let mut session = start_session().await;

        send(&mut session.client, &Message::connect("alice")).await;
        let _welcome = recv(&mut session.client).await;
        let _joined = session.notice_rx.recv().await;

        send(&mut session.client, &Message::disconnect("alice")).await;

        let result = timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        match session.notice_rx.recv().await.unwrap() {
            SessionNotice::Closed { info } => assert_eq!(info.name, "alice"),
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(*session.events.disconnected.lock().unwrap(), vec!["alice"]);
        assert!(session.registry.is_empty().await);
    }

    #[tokio::test]
    async fn eof_closes_cleanly_and_notifies_once() {
        let session = start_session().await;

        drop(session.client);

        let result = timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(session.events.disconnected.lock().unwrap().len(), 1);
        assert!(session.registry.is_empty().await);
    }

    #[tokio::test]
    async fn outbound_channel_reaches_the_peer() {
        let mut session = start_session().await;

        session
            .outbound_tx
            .send(Message::chat("relayed text", "bob"))
            .unwrap();

        let relayed = timeout(Duration::from_secs(2), recv(&mut session.client))
            .await
            .unwrap();
        assert_eq!(relayed.kind, MessageKind::Chat);
        assert_eq!(relayed.content, "relayed text");
        assert_eq!(relayed.sender.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_session() {
        let session = start_session().await;

        session.shutdown_tx.send(true).unwrap();

        let result = timeout(Duration::from_secs(2), session.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(session.registry.is_empty().await);
    }

    #[test]
    fn failure_tracker_trips_at_limit_and_resets_on_success() {
        let mut tracker = DecodeFailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }
}
