//! Configuration handling for the chat node.
//!
//! This module reads the optional YAML config file and applies environment
//! variable overrides, producing the effective configuration for both the
//! server and client run modes.

use anyhow::{Context, Result};
use chat_session::{RetryPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Chat node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host the server binds on
    pub host: String,
    /// Port for stream chat connections
    pub tcp_port: u16,
    /// Port for datagram chat traffic
    pub udp_port: u16,
    /// Socket read buffer size in bytes
    pub read_buffer_size: usize,
    /// Seconds of silence before a datagram peer is dropped
    pub idle_timeout_secs: u64,
    /// Seconds between reaper sweeps over datagram peers
    pub sweep_interval_secs: u64,
    /// Milliseconds between retry sweeps on the reliable datagram path
    pub retry_interval_ms: u64,
    /// Milliseconds before an unacknowledged datagram is retransmitted
    pub retry_timeout_ms: u64,
    /// Retransmission ceiling, unlimited when absent
    pub max_retries: Option<u32>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_port: 5050,
            udp_port: 5051,
            read_buffer_size: 4096,
            idle_timeout_secs: 30,
            sweep_interval_secs: 5,
            retry_interval_ms: 500,
            retry_timeout_ms: 2000,
            max_retries: None,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    server: Option<ServerSection>,
    session: Option<SessionSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    host: Option<String>,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct SessionSection {
    read_buffer_size: Option<usize>,
    idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    retry_interval_ms: Option<u64>,
    retry_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        // Try to read the config file
        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root_config) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root_config);
                info!("Loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!(
                    "Failed to parse config file {:?}, using defaults",
                    config_path.as_ref()
                );
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        // Override with environment variables
        config.apply_environment_overrides();

        info!(
            "Final node configuration: host={}, tcp_port={}, udp_port={}, idle_timeout={}s",
            config.host, config.tcp_port, config.udp_port, config.idle_timeout_secs
        );

        Ok(config)
    }

    /// Apply configuration from the root config structure
    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(server) = root_config.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.tcp_port {
                self.tcp_port = port;
            }
            if let Some(port) = server.udp_port {
                self.udp_port = port;
            }
        }

        if let Some(session) = root_config.session {
            if let Some(size) = session.read_buffer_size {
                self.read_buffer_size = size;
            }
            if let Some(secs) = session.idle_timeout_secs {
                self.idle_timeout_secs = secs;
            }
            if let Some(secs) = session.sweep_interval_secs {
                self.sweep_interval_secs = secs;
            }
            if let Some(ms) = session.retry_interval_ms {
                self.retry_interval_ms = ms;
            }
            if let Some(ms) = session.retry_timeout_ms {
                self.retry_timeout_ms = ms;
            }
            if session.max_retries.is_some() {
                self.max_retries = session.max_retries;
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(host) = std::env::var("CHAT_SERVER_HOST") {
            self.host = host;
            info!("Server host overridden by environment: {}", self.host);
        }

        if let Ok(tcp_port) = std::env::var("CHAT_SERVER_TCP_PORT") {
            if let Ok(port) = tcp_port.parse::<u16>() {
                self.tcp_port = port;
                info!("TCP port overridden by environment: {}", port);
            }
        }

        if let Ok(udp_port) = std::env::var("CHAT_SERVER_UDP_PORT") {
            if let Ok(port) = udp_port.parse::<u16>() {
                self.udp_port = port;
                info!("UDP port overridden by environment: {}", port);
            }
        }
    }

    /// Address the TCP listener binds on.
    pub fn tcp_listen_addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.tcp_port)
    }

    /// Address the UDP socket binds on.
    pub fn udp_listen_addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.udp_port)
    }

    /// Address a client dials for the given port.
    ///
    /// The wildcard listen host is not a dialable address, so it falls
    /// back to loopback for client mode.
    pub fn dial_addr(&self, port: u16) -> Result<SocketAddr> {
        let host = if self.host == "0.0.0.0" {
            "localhost"
        } else {
            self.host.as_str()
        };
        resolve(host, port)
    }

    /// Session tuning shared by the servers and the clients.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            read_buffer_size: self.read_buffer_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            retry: RetryPolicy {
                interval: Duration::from_millis(self.retry_interval_ms),
                timeout: Duration::from_millis(self.retry_timeout_ms),
                max_retries: self.max_retries,
            },
            ..SessionConfig::default()
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let target = format!("{}:{}", host, port);
    target
        .to_socket_addrs()
        .with_context(|| format!("invalid address {}", target))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("address {} did not resolve", target))
}
