//! Stream chat client.
//!
//! Connects with a bounded timeout, sends the handshake, and runs a
//! background receive loop that dispatches relayed chat, notices, and
//! probe echoes to the injected callbacks. Sends go straight to the
//! socket from the calling task; the write half is guarded so callers can
//! share the client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chat_session::{
    transport, ChatEvents, DecodeFailureTracker, Protocol, SessionConfig, SessionError,
};
use chat_wire::{encode_frame, FrameDecoder, Message, MessageKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::inbound::{remote_peer, resolve_probe, ProbePending};

/// Client for the framed stream transport
#[derive(Debug)]
pub struct TcpChatClient {
    name: String,
    server_addr: SocketAddr,
    config: SessionConfig,
    writer: Mutex<OwnedWriteHalf>,
    probes: Arc<ProbePending>,
    recv_handle: JoinHandle<()>,
    connected: AtomicBool,
}

impl TcpChatClient {
    /// Connect, handshake, and start receiving.
    ///
    /// Fails fast: an unreachable or unresponsive server surfaces as
    /// [`SessionError::PeerUnreachable`] within the configured connect
    /// timeout instead of blocking.
    pub async fn connect(
        addr: SocketAddr,
        name: impl Into<String>,
        config: SessionConfig,
        events: Arc<dyn ChatEvents>,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        let stream = transport::connect(addr, config.connect_timeout).await?;
        let (read_half, write_half) = stream.into_split();

        let probes: Arc<ProbePending> = Arc::new(ProbePending::new());
        let recv_handle = tokio::spawn(run_recv_loop(
            read_half,
            addr,
            Arc::clone(&events),
            Arc::clone(&probes),
            config.clone(),
        ));

        let client = Self {
            name,
            server_addr: addr,
            config,
            writer: Mutex::new(write_half),
            probes,
            recv_handle,
            connected: AtomicBool::new(true),
        };
        client
            .send_message(&Message::connect(client.name.clone()))
            .await?;

        debug!("connected to {} as {}", addr, client.name);
        Ok(client)
    }

    /// Display name this client connected under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send chat text to the server
    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.send_message(&Message::chat(text, self.name.clone()))
            .await
    }

    /// Round trip latency to the server, measured with a probe echo
    pub async fn probe_latency(&self) -> Result<Duration, SessionError> {
        let probe = Message::test_probe(self.name.clone());
        let key = probe.timestamp.to_bits();
        let (tx, rx) = oneshot::channel();
        self.probes.insert(key, tx);

        self.send_message(&probe).await?;

        match timeout(self.config.probe_timeout, rx).await {
            Ok(Ok(rtt)) => Ok(rtt),
            _ => {
                self.probes.remove(&key);
                Err(SessionError::PeerUnreachable {
                    addr: self.server_addr,
                })
            }
        }
    }

    /// Tell the server goodbye and release the connection.
    ///
    /// Best effort and idempotent: the notice may be lost, and calling
    /// this again does nothing.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("disconnecting from {}", self.server_addr);

        if let Err(e) = self
            .send_message(&Message::disconnect(self.name.clone()))
            .await
        {
            debug!("disconnect notice not sent: {}", e);
        }
        self.writer.lock().await.shutdown().await.ok();
        self.recv_handle.abort();
    }

    async fn send_message(&self, message: &Message) -> Result<(), SessionError> {
        let frame = encode_frame(&message.encode()?)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(SessionError::SendFailure)
    }
}

impl Drop for TcpChatClient {
    fn drop(&mut self) {
        self.recv_handle.abort();
    }
}

async fn run_recv_loop(
    mut read_half: OwnedReadHalf,
    server_addr: SocketAddr,
    events: Arc<dyn ChatEvents>,
    probes: Arc<ProbePending>,
    config: SessionConfig,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(config.read_buffer_size);
    let mut failures = DecodeFailureTracker::new(config.max_decode_failures);

    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("server closed the stream");
                events.on_status("disconnected from server", true);
                break;
            }
            Ok(_) => loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(frame)) => match Message::decode(&frame) {
                        Ok(message) => {
                            failures.record_success();
                            dispatch(&message, server_addr, &events, &probes);
                        }
                        Err(e) => {
                            warn!("undecodable frame from server: {}", e);
                            if failures.record_failure() {
                                events.on_status("server is not speaking the protocol", true);
                                return;
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("framing failure from server: {}", e);
                        events.on_status("server is not speaking the protocol", true);
                        return;
                    }
                }
            },
            Err(e) => {
                warn!("read from server failed: {}", e);
                events.on_status("connection to server lost", true);
                break;
            }
        }
    }
}

fn dispatch(
    message: &Message,
    server_addr: SocketAddr,
    events: &Arc<dyn ChatEvents>,
    probes: &ProbePending,
) {
    match message.kind {
        MessageKind::Chat => {
            let peer = remote_peer(message, server_addr, Protocol::Tcp);
            events.on_message(&peer, &message.content);
        }
        MessageKind::Status => events.on_status(&message.content, false),
        MessageKind::Error => events.on_status(&message.content, true),
        MessageKind::Test => resolve_probe(message, probes),
        kind => debug!("ignoring {} from server", kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_server::TcpChatServer;
    use chat_session::{NullEvents, PeerInfo};
    use std::sync::Mutex as StdMutex;
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Default)]
    struct RecordingEvents {
        messages: StdMutex<Vec<(String, String)>>,
        statuses: StdMutex<Vec<(String, bool)>>,
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

        fn on_peer_connected(&self, _peer: &PeerInfo) {}
        fn on_peer_disconnected(&self, _peer: &PeerInfo) {}
    }

    struct FakeServer {
        stream: TcpStream,
        decoder: FrameDecoder,
        buf: BytesMut,
    }

    impl FakeServer {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            Self {
                stream,
                decoder: FrameDecoder::new(),
                buf: BytesMut::new(),
            }
        }

        async fn recv(&mut self) -> Message {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return Message::decode(&frame).unwrap();
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "client closed the stream");
            }
        }

        async fn send(&mut self, message: &Message) {
            let frame = encode_frame(&message.encode().unwrap()).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_sends_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            TcpChatClient::connect(addr, "alice", quick_config(), Arc::new(NullEvents)).await
        });

        let mut server = FakeServer::accept(&listener).await;
        let handshake = server.recv().await;
        assert_eq!(handshake.kind, MessageKind::Connect);
        assert_eq!(handshake.content, "alice");
        assert_eq!(handshake.sender.as_deref(), Some("alice"));

        let client = client_task.await.unwrap().unwrap();
        assert_eq!(client.name(), "alice");
    }

    #[tokio::test]
    async fn connect_to_dead_port_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let started = std::time::Instant::now();
        let result =
            TcpChatClient::connect(addr, "alice", quick_config(), Arc::new(NullEvents)).await;
        assert!(matches!(result, Err(SessionError::PeerUnreachable { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn incoming_chat_and_status_reach_callbacks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(RecordingEvents::default());

        let events_for_client = Arc::clone(&events) as Arc<dyn ChatEvents>;
        let client_task = tokio::spawn(async move {
            TcpChatClient::connect(addr, "alice", quick_config(), events_for_client).await
        });

        let mut server = FakeServer::accept(&listener).await;
        let _handshake = server.recv().await;
        server.send(&Message::status("Welcome, alice!")).await;
        server.send(&Message::chat("hi alice", "bob")).await;

        let _client = client_task.await.unwrap().unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                if !events.messages.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *events.messages.lock().unwrap(),
            vec![("bob".to_string(), "hi alice".to_string())]
        );
        assert_eq!(
            *events.statuses.lock().unwrap(),
            vec![("Welcome, alice!".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn probe_latency_resolves_from_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            TcpChatClient::connect(addr, "alice", quick_config(), Arc::new(NullEvents)).await
        });

        let mut server = FakeServer::accept(&listener).await;
        let _handshake = server.recv().await;
        let client = client_task.await.unwrap().unwrap();

        let server_task = tokio::spawn(async move {
            let probe = server.recv().await;
            assert_eq!(probe.kind, MessageKind::Test);
            server.send(&probe.echo("server")).await;
        });

        let rtt = client.probe_latency().await.unwrap();
        assert!(rtt < Duration::from_secs(2));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn probe_timeout_is_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            TcpChatClient::connect(addr, "alice", quick_config(), Arc::new(NullEvents)).await
        });

        let mut server = FakeServer::accept(&listener).await;
        let _handshake = server.recv().await;
        let client = client_task.await.unwrap().unwrap();

        // Server swallows the probe
        let started = std::time::Instant::now();
        let result = client.probe_latency().await;
        assert!(matches!(result, Err(SessionError::PeerUnreachable { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        let _ = server.recv().await;
    }

    #[tokio::test]
    async fn disconnect_notifies_and_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            TcpChatClient::connect(addr, "alice", quick_config(), Arc::new(NullEvents)).await
        });

        let mut server = FakeServer::accept(&listener).await;
        let _handshake = server.recv().await;
        let client = client_task.await.unwrap().unwrap();

        client.disconnect().await;
        client.disconnect().await;

        let goodbye = timeout(Duration::from_secs(2), server.recv()).await.unwrap();
        assert_eq!(goodbye.kind, MessageKind::Disconnect);
        assert_eq!(goodbye.sender.as_deref(), Some("alice"));

        // Exactly one notice, then the stream closes
        let mut scratch = [0u8; 64];
        let n = timeout(Duration::from_secs(2), server.stream.read(&mut scratch))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn two_clients_chat_through_a_real_server() {
        let mut server = TcpChatServer::new(SessionConfig::default(), Arc::new(NullEvents));
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let alice_events = Arc::new(RecordingEvents::default());
        let alice = TcpChatClient::connect(
            addr,
            "alice",
            quick_config(),
            Arc::clone(&alice_events) as Arc<dyn ChatEvents>,
        )
        .await
        .unwrap();

        let bob_events = Arc::new(RecordingEvents::default());
        let bob = TcpChatClient::connect(
            addr,
            "bob",
            quick_config(),
            Arc::clone(&bob_events) as Arc<dyn ChatEvents>,
        )
        .await
        .unwrap();

        // Bob's welcome proves the server finished his handshake
        timeout(Duration::from_secs(2), async {
            while bob_events.statuses.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("welcome never arrived");

        alice.send_chat("hello bob").await.unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                if !bob_events.messages.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relayed chat never arrived");

        assert_eq!(
            *bob_events.messages.lock().unwrap(),
            vec![("alice".to_string(), "hello bob".to_string())]
        );
        // The relay must not loop traffic back to its origin
        assert!(alice_events.messages.lock().unwrap().is_empty());

        alice.disconnect().await;
        bob.disconnect().await;
        server.stop().await;
    }
}
