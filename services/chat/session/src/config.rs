//! Configuration for chat sessions and transports.

use std::time::Duration;

use chat_wire::SERVER_SENDER;

/// Retransmission policy for the reliable datagram path
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Interval between retry sweeps
    pub interval: Duration,
    /// Age after which an unacknowledged send is retransmitted
    pub timeout: Duration,
    /// Retransmission ceiling; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(2),
            max_retries: None,
        }
    }
}

/// Configuration for a chat session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Local identity stamped on echoes and server-origin notices
    pub identity: String,
    /// Socket read buffer size in bytes
    pub read_buffer_size: usize,
    /// Consecutive decode failures tolerated before the session is fatal
    pub max_decode_failures: u32,
    /// Timeout for establishing a stream connection
    pub connect_timeout: Duration,
    /// Bounded wait for a reply to the datagram connectivity probe
    pub probe_timeout: Duration,
    /// Inactivity window after which a datagram peer is reaped
    pub idle_timeout: Duration,
    /// Interval between reaper sweeps over datagram peers
    pub sweep_interval: Duration,
    /// Retransmission policy for reliable datagram sends
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: SERVER_SENDER.to_string(),
            read_buffer_size: 4096,
            max_decode_failures: 3,
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
