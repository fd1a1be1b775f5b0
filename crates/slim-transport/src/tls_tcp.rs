//! TCP with a TLS session layered on top.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::TlsConfig;
use crate::error::Result;
use crate::tcp::{dial, TcpTransportConfig};
use crate::tls::{TlsAcceptor, TlsConnector};
use crate::transport::{Connection, FramedConnection, Listener, Transport};

/// Transport that dials and accepts TLS (optionally mutual) over TCP.
#[derive(Debug, Clone)]
pub struct TlsTcpTransport {
    tcp_config: TcpTransportConfig,
    tls_config: TlsConfig,
}

impl TlsTcpTransport {
    /// Transport dialing with `tcp_config` and securing with `tls_config`.
    pub fn new(tcp_config: TcpTransportConfig, tls_config: TlsConfig) -> Self {
        Self {
            tcp_config,
            tls_config,
        }
    }
}

/// Host part of `host:port`, without IPv6 brackets; used as the SNI name.
fn server_name(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn boxed<S>(stream: S, peer: String, local: String) -> Box<dyn Connection>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    Box::new(FramedConnection::new(read, write, peer, local))
}

#[async_trait]
impl Transport for TlsTcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let connector = TlsConnector::new(&self.tls_config)?;
        let tcp = dial(&self.tcp_config, addr).await?;
        let local = tcp.local_addr()?.to_string();
        let tls = connector.connect(server_name(addr), tcp).await?;
        tracing::debug!(
            %addr,
            version = self.tls_config.tls_version.as_str(),
            "tls handshake complete"
        );
        Ok(boxed(tls, addr.to_string(), local))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let acceptor = TlsAcceptor::new(&self.tls_config)?;
        let socket = tokio::net::TcpListener::bind(addr).await?;
        tracing::debug!(%addr, "tls listener bound");
        Ok(Box::new(TlsTcpListener {
            socket,
            acceptor,
            tcp_config: self.tcp_config.clone(),
        }))
    }
}

/// Bound socket that completes the server-side handshake before handing a
/// connection out.
#[derive(Debug)]
pub struct TlsTcpListener {
    socket: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    tcp_config: TcpTransportConfig,
}

#[async_trait]
impl Listener for TlsTcpListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (tcp, peer) = self.socket.accept().await?;
        self.tcp_config.prepare(&tcp)?;
        let local = tcp.local_addr()?.to_string();
        let tls = self.acceptor.accept(tcp).await?;
        tracing::debug!(%peer, "tls peer accepted");
        Ok(boxed(tls, peer.to_string(), local))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.socket.local_addr()?.to_string())
    }
}
