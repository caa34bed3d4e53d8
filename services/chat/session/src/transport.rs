//! Socket construction for the stream and datagram transports.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::SessionError;

/// Bind the stream listener
pub async fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening for stream peers on {}", listener.local_addr()?);
    Ok(listener)
}

/// Bind a datagram socket
pub async fn bind_datagram(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    info!("datagram socket bound on {}", socket.local_addr()?);
    Ok(socket)
}

/// Connect to a stream peer, failing fast when it is unreachable.
///
/// Both a refused connection and one that hangs past `connect_timeout`
/// surface as [`SessionError::PeerUnreachable`]; the caller never blocks
/// longer than the timeout.
pub async fn connect(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, SessionError> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!("connected to {}", addr);
            Ok(stream)
        }
        Ok(Err(e)) => {
            debug!("connection to {} failed: {}", addr, e);
            Err(SessionError::PeerUnreachable { addr })
        }
        Err(_) => {
            debug!("connection to {} timed out", addr);
            Err(SessionError::PeerUnreachable { addr })
        }
    }
}
