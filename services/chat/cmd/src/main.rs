//! Chat node binary.
//!
//! Runs the relay server with both TCP and UDP listeners, or a terminal
//! chat client against a running server, selected by `--mode`.

use chat_client::{TcpChatClient, UdpChatClient};
use chat_server::{TcpChatServer, UdpChatServer};
use chat_session::{ChatEvents, PeerInfo, SessionError};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::ChatLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// Chat relay node with TCP and UDP transports
#[derive(Parser, Debug)]
#[command(name = "chat-node", version, about = "Chat relay node with TCP and UDP transports")]
struct Args {
    /// Run mode: server, client
    #[arg(long, default_value = "server")]
    mode: String,

    /// Client transport: tcp, udp
    #[arg(long, default_value = "tcp")]
    transport: String,

    /// Display name announced to the server (client mode)
    #[arg(long, default_value = "anonymous")]
    name: String,

    /// Server address to dial in client mode, e.g. 127.0.0.1:5050
    #[arg(long)]
    server: Option<SocketAddr>,

    /// TCP listen address, e.g. 0.0.0.0:5050 (overrides config)
    #[arg(long)]
    tcp_listen: Option<SocketAddr>,

    /// UDP listen address, e.g. 0.0.0.0:5051 (overrides config)
    #[arg(long)]
    udp_listen: Option<SocketAddr>,

    /// Interval between retry sweeps on the reliable datagram path, e.g. 500ms
    #[arg(long)]
    retry_interval: Option<humantime::Duration>,

    /// Age at which an unacknowledged datagram is retransmitted, e.g. 2s
    #[arg(long)]
    retry_timeout: Option<humantime::Duration>,

    /// Resend ceiling per datagram; unlimited when omitted
    #[arg(long)]
    max_retries: Option<u32>,

    /// Idle time before a datagram peer is dropped, e.g. 30s
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Interval between reaper sweeps over idle datagram peers, e.g. 5s
    #[arg(long)]
    sweep_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Log level precedence: flag, then CHAT_LOG_LEVEL, then info
    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("CHAT_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("chat_wire={}", log_level).parse()?)
        .add_directive(format!("chat_session={}", log_level).parse()?)
        .add_directive(format!("chat_server={}", log_level).parse()?)
        .add_directive(format!("chat_client={}", log_level).parse()?)
        .add_directive(format!("chat_node={}", log_level).parse()?);

    let formatter = ChatLogFormatter::new("chat-node".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!(
        "Starting chat node v{} (protocol {})",
        env!("CARGO_PKG_VERSION"),
        chat_wire::PROTOCOL_VERSION
    );

    let mut node_config = NodeConfig::load_from_file(&args.config)?;

    // Explicit flags beat file and environment values
    if let Some(interval) = args.retry_interval {
        node_config.retry_interval_ms = Duration::from(interval).as_millis() as u64;
    }
    if let Some(timeout) = args.retry_timeout {
        node_config.retry_timeout_ms = Duration::from(timeout).as_millis() as u64;
    }
    if let Some(max) = args.max_retries {
        node_config.max_retries = Some(max);
    }
    if let Some(idle) = args.idle_timeout {
        node_config.idle_timeout_secs = Duration::from(idle).as_secs();
    }
    if let Some(sweep) = args.sweep_interval {
        node_config.sweep_interval_secs = Duration::from(sweep).as_secs();
    }

    match args.mode.as_str() {
        "server" => run_server(&args, &node_config).await,
        "client" => run_client(&args, &node_config).await,
        _ => anyhow::bail!("Invalid mode: {}. Use 'server' or 'client'", args.mode),
    }
}

/// Start both listeners and relay until a shutdown signal arrives.
async fn run_server(args: &Args, config: &NodeConfig) -> anyhow::Result<()> {
    let session_config = config.session_config();
    let tcp_addr = match args.tcp_listen {
        Some(addr) => addr,
        None => config.tcp_listen_addr()?,
    };
    let udp_addr = match args.udp_listen {
        Some(addr) => addr,
        None => config.udp_listen_addr()?,
    };

    let events: Arc<dyn ChatEvents> = Arc::new(RelayLogger);

    let mut tcp_server = TcpChatServer::new(session_config.clone(), events.clone());
    let mut udp_server = UdpChatServer::new(session_config, events);

    let tcp_bound = tcp_server.start(tcp_addr).await?;
    component_info!("tcp", "Listening for stream peers on {}", tcp_bound);
    let udp_bound = udp_server.start(udp_addr).await?;
    component_info!("udp", "Listening for datagram peers on {}", udp_bound);

    wait_for_signal().await?;

    info!("Chat node shutting down");
    tcp_server.stop().await;
    udp_server.stop().await;
    info!("Chat node shutdown complete");
    Ok(())
}

/// Connect to a server and run the terminal chat loop.
async fn run_client(args: &Args, config: &NodeConfig) -> anyhow::Result<()> {
    let session_config = config.session_config();
    let events: Arc<dyn ChatEvents> = Arc::new(ConsoleEvents);

    let client = match args.transport.as_str() {
        "tcp" => {
            let addr = match args.server {
                Some(addr) => addr,
                None => config.dial_addr(config.tcp_port)?,
            };
            info!("Connecting to {} over TCP as {}", addr, args.name);
            let client =
                TcpChatClient::connect(addr, args.name.clone(), session_config, events).await?;
            ChatClient::Tcp(client)
        }
        "udp" => {
            let addr = match args.server {
                Some(addr) => addr,
                None => config.dial_addr(config.udp_port)?,
            };
            info!("Connecting to {} over UDP as {}", addr, args.name);
            let client =
                UdpChatClient::connect(addr, args.name.clone(), session_config, events).await?;
            ChatClient::Udp(client)
        }
        _ => anyhow::bail!("Invalid transport: {}. Use 'tcp' or 'udp'", args.transport),
    };

    chat_loop(client).await
}

/// Uniform handle over the two client transports.
enum ChatClient {
    Tcp(TcpChatClient),
    Udp(UdpChatClient),
}

impl ChatClient {
    fn name(&self) -> &str {
        match self {
            ChatClient::Tcp(client) => client.name(),
            ChatClient::Udp(client) => client.name(),
        }
    }

    async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        match self {
            ChatClient::Tcp(client) => client.send_chat(text).await,
            ChatClient::Udp(client) => client.send_chat(text).await.map(|_sequence| ()),
        }
    }

    async fn probe_latency(&self) -> Result<Duration, SessionError> {
        match self {
            ChatClient::Tcp(client) => client.probe_latency().await,
            ChatClient::Udp(client) => client.probe_latency().await,
        }
    }

    async fn disconnect(&self) {
        match self {
            ChatClient::Tcp(client) => client.disconnect().await,
            ChatClient::Udp(client) => client.disconnect().await,
        }
    }
}

/// Forward terminal lines to the server until EOF, `/quit`, or a signal.
async fn chat_loop(client: ChatClient) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "Connected as {}. Type to chat, /ping probes latency, /quit leaves.",
        client.name()
    );

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        match text {
                            "/quit" | "/exit" => break,
                            "/ping" => match client.probe_latency().await {
                                Ok(rtt) => println!("* server answered in {:?}", rtt),
                                Err(err) => println!("! probe failed: {}", err),
                            },
                            _ => {
                                if let Err(err) = client.send_chat(text).await {
                                    warn!("Send failed: {}", err);
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("Failed to read input: {}", err);
                        break;
                    }
                }
            }
        }
    }

    client.disconnect().await;
    info!("Disconnected");
    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
    }
    Ok(())
}

/// Logs relay traffic through the component-tagged tracing macros.
#[derive(Debug)]
struct RelayLogger;

impl ChatEvents for RelayLogger {
    fn on_message(&self, peer: &PeerInfo, text: &str) {
        component_info!("relay", "[{}] {}: {}", peer.protocol, peer.name, text);
    }

    fn on_status(&self, text: &str, is_error: bool) {
        if is_error {
            component_warn!("relay", "{}", text);
        } else {
            component_info!("relay", "{}", text);
        }
    }

    fn on_peer_connected(&self, peer: &PeerInfo) {
        component_info!(
            "relay",
            "{} connected over {} from {}",
            peer.name,
            peer.protocol,
            peer.addr
        );
    }

    fn on_peer_disconnected(&self, peer: &PeerInfo) {
        component_info!("relay", "{} disconnected ({})", peer.name, peer.protocol);
    }
}

/// Prints conversation traffic to the terminal; stdout is the user
/// interface in client mode.
#[derive(Debug)]
struct ConsoleEvents;

impl ChatEvents for ConsoleEvents {
    fn on_message(&self, peer: &PeerInfo, text: &str) {
        println!("{}: {}", peer.name, text);
    }

    fn on_status(&self, text: &str, is_error: bool) {
        if is_error {
            eprintln!("! {}", text);
        } else {
            println!("* {}", text);
        }
    }

    fn on_peer_connected(&self, peer: &PeerInfo) {
        println!("* {} connected", peer.name);
    }

    fn on_peer_disconnected(&self, peer: &PeerInfo) {
        println!("* {} left", peer.name);
    }
}
