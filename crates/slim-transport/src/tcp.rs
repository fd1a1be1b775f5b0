//! Plaintext TCP transport.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Result, TransportError};
use crate::transport::{Connection, FramedConnection, Listener, Transport};

/// Dial and accept options shared by the plaintext and TLS transports.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Upper bound on a single dial.
    pub connect_timeout_ms: u64,
    /// Sets TCP_NODELAY on every stream.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    pub(crate) fn prepare(&self, stream: &TcpStream) -> Result<()> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(())
    }
}

/// A framed plaintext TCP connection.
pub type TcpConnection = FramedConnection<OwnedReadHalf, OwnedWriteHalf>;

/// Plaintext transport over tokio sockets.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Transport with the given dial options.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

/// Dials `addr` within the configured timeout. A refused dial is reported
/// separately from other socket errors so callers can tell "nobody home"
/// from a broken network.
pub(crate) async fn dial(config: &TcpTransportConfig, addr: &str) -> Result<TcpStream> {
    let limit = Duration::from_millis(config.connect_timeout_ms);
    let attempt = match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(attempt) => attempt,
        Err(_) => {
            return Err(TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: config.connect_timeout_ms,
            })
        }
    };
    let stream = attempt.map_err(|err| {
        if err.kind() == ErrorKind::ConnectionRefused {
            TransportError::ConnectionRefused {
                addr: addr.to_string(),
            }
        } else {
            TransportError::IoError(err)
        }
    })?;
    config.prepare(&stream)?;
    Ok(stream)
}

fn addr_label(addr: std::io::Result<std::net::SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

pub(crate) fn framed(stream: TcpStream) -> TcpConnection {
    let peer = addr_label(stream.peer_addr());
    let local = addr_label(stream.local_addr());
    let (read, write) = stream.into_split();
    FramedConnection::new(read, write, peer, local)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let stream = dial(&self.config, addr).await?;
        tracing::debug!(%addr, "dialed");
        Ok(Box::new(framed(stream)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let socket = tokio::net::TcpListener::bind(addr).await?;
        tracing::debug!(%addr, "bound");
        Ok(Box::new(TcpAcceptor {
            socket,
            config: self.config.clone(),
        }))
    }
}

/// Bound plaintext socket handing out framed connections.
#[derive(Debug)]
pub struct TcpAcceptor {
    socket: tokio::net::TcpListener,
    config: TcpTransportConfig,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, peer) = self.socket.accept().await?;
        self.config.prepare(&stream)?;
        tracing::debug!(%peer, "accepted");
        Ok(Box::new(framed(stream)))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.socket.local_addr()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, FrameFlags};

    #[tokio::test]
    async fn test_send_recv_frame() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.payload, b"ping");
            conn.send_frame(&Frame::new(b"pong".to_vec(), FrameFlags::NONE))
                .await
                .unwrap();
        });

        let conn = transport.connect(&addr).await.unwrap();
        assert!(!conn.peer_addr().is_empty());
        assert!(!conn.local_addr().is_empty());
        conn.send_frame(&Frame::new(b"ping".to_vec(), FrameFlags::NONE))
            .await
            .unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert_eq!(response.payload, b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(transport.connect(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_listener_local_addr() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.starts_with("127.0.0.1:"));
    }
}
