//! Transport surface: the set of live outbound connections and servers.
//!
//! Connections are keyed by a process-unique [`ConnectionId`] handed out on
//! connect and on accept. Each connection gets a reader task that pushes
//! [`SurfaceEvent`]s into a single channel consumed by the datapath. A lost
//! connection is reported once with [`SurfaceEvent::Closed`]; reconnecting is
//! up to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, TransportError};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::Frame;
use crate::tcp::{TcpTransport, TcpTransportConfig};
use crate::tls_tcp::TlsTcpTransport;
use crate::transport::{Connection, Listener, Transport};

/// Opaque identifier of one transport connection, unique within the process.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate an id from the process-wide connection id space.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Default depth of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Something that happened on the surface.
#[derive(Debug)]
pub enum SurfaceEvent {
    /// A new connection is ready. `server` is set for accepted connections.
    Connected {
        /// New connection.
        conn_id: ConnectionId,
        /// Server endpoint that accepted it.
        server: Option<String>,
    },
    /// A frame arrived.
    Frame {
        /// Connection it arrived on.
        conn_id: ConnectionId,
        /// The frame.
        frame: Frame,
    },
    /// The connection is gone; no further frames will be reported for it.
    Closed {
        /// Closed connection.
        conn_id: ConnectionId,
    },
}

/// Public view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id, unique within the process.
    pub id: ConnectionId,
    /// Endpoint dialed for outbound connections, peer address for accepted ones.
    pub endpoint: String,
    /// Server endpoint that accepted this connection, if any.
    pub server: Option<String>,
}

struct ConnectionEntry {
    info: ConnectionInfo,
    conn: Arc<dyn Connection>,
    reader: Option<JoinHandle<()>>,
}

struct ServerEntry {
    local_addr: String,
    accept_task: JoinHandle<()>,
}

struct SurfaceInner {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    servers: Mutex<HashMap<String, ServerEntry>>,
    events: mpsc::Sender<SurfaceEvent>,
    metrics: TransportMetrics,
    tcp_config: TcpTransportConfig,
}

impl SurfaceInner {
    fn register(
        self: &Arc<Self>,
        conn: Box<dyn Connection>,
        endpoint: String,
        server: Option<String>,
    ) -> ConnectionId {
        let conn_id = next_connection_id();
        let conn: Arc<dyn Connection> = Arc::from(conn);
        let info = ConnectionInfo {
            id: conn_id,
            endpoint,
            server: server.clone(),
        };
        self.connections.write().insert(
            conn_id,
            ConnectionEntry {
                info,
                conn: conn.clone(),
                reader: None,
            },
        );
        self.metrics.inc_connections_opened();

        // Connected must precede any Frame event for this id.
        let events = self.events.clone();
        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            if events
                .send(SurfaceEvent::Connected { conn_id, server })
                .await
                .is_err()
            {
                return;
            }
            read_loop(conn_id, conn, events, weak).await;
        });
        if let Some(entry) = self.connections.write().get_mut(&conn_id) {
            entry.reader = Some(reader);
        }
        conn_id
    }

    /// Removes the connection; returns true when this call removed it.
    fn remove(&self, conn_id: ConnectionId, abort_reader: bool) -> bool {
        let entry = self.connections.write().remove(&conn_id);
        match entry {
            Some(entry) => {
                if abort_reader {
                    if let Some(reader) = entry.reader {
                        reader.abort();
                    }
                }
                self.metrics.inc_connections_closed();
                debug!(conn_id, endpoint = %entry.info.endpoint, "connection removed");
                true
            }
            None => false,
        }
    }

    fn notify_closed(&self, conn_id: ConnectionId) {
        match self.events.try_send(SurfaceEvent::Closed { conn_id }) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let events = self.events.clone();
                    handle.spawn(async move {
                        let _ = events.send(event).await;
                    });
                } else {
                    warn!(conn_id, "event queue full, close notification lost");
                }
            }
        }
    }
}

impl Drop for SurfaceInner {
    fn drop(&mut self) {
        for (_, entry) in self.connections.get_mut().drain() {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
        for (_, server) in self.servers.get_mut().drain() {
            server.accept_task.abort();
        }
    }
}

async fn read_loop(
    conn_id: ConnectionId,
    conn: Arc<dyn Connection>,
    events: mpsc::Sender<SurfaceEvent>,
    surface: Weak<SurfaceInner>,
) {
    loop {
        match conn.recv_frame().await {
            Ok(frame) => {
                if let Some(inner) = surface.upgrade() {
                    inner.metrics.record_received(frame.payload.len());
                }
                if events
                    .send(SurfaceEvent::Frame { conn_id, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                if e.is_disconnect() {
                    debug!(conn_id, "connection closed by peer");
                } else {
                    warn!(conn_id, error = %e, "connection read failed");
                }
                break;
            }
        }
    }
    if let Some(inner) = surface.upgrade() {
        if inner.remove(conn_id, false) {
            let _ = events.send(SurfaceEvent::Closed { conn_id }).await;
        }
    }
}

async fn accept_loop(
    endpoint: String,
    listener: Box<dyn Listener>,
    surface: Weak<SurfaceInner>,
) {
    loop {
        let accepted = listener.accept().await;
        let Some(inner) = surface.upgrade() else {
            break;
        };
        match accepted {
            Ok(conn) => {
                let peer = conn.peer_addr().to_string();
                let conn_id = inner.register(conn, peer.clone(), Some(endpoint.clone()));
                info!(conn_id, peer = %peer, server = %endpoint, "accepted connection");
            }
            Err(e) => {
                warn!(server = %endpoint, error = %e, "accept failed");
            }
        }
    }
}

/// Manages outbound connections and listening servers.
#[derive(Clone)]
pub struct TransportSurface {
    inner: Arc<SurfaceInner>,
}

impl std::fmt::Debug for TransportSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSurface")
            .field("connections", &self.inner.connections.read().len())
            .field("servers", &self.inner.servers.lock().len())
            .finish()
    }
}

impl TransportSurface {
    /// Creates a surface and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::Receiver<SurfaceEvent>) {
        Self::with_config(TcpTransportConfig::default())
    }

    /// Surface with explicit dial options, plus its event stream.
    pub fn with_config(tcp_config: TcpTransportConfig) -> (Self, mpsc::Receiver<SurfaceEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(SurfaceInner {
            connections: RwLock::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            events,
            metrics: TransportMetrics::new(),
            tcp_config,
        });
        (Self { inner }, rx)
    }

    fn transport_for(&self, tls: &crate::config::TlsConfig) -> Box<dyn Transport> {
        if tls.insecure {
            Box::new(TcpTransport::new(self.inner.tcp_config.clone()))
        } else {
            Box::new(TlsTcpTransport::new(
                self.inner.tcp_config.clone(),
                tls.clone(),
            ))
        }
    }

    /// Establishes a new connection and returns its id.
    pub async fn connect(&self, config: &ClientConfig) -> Result<ConnectionId> {
        config.validate()?;
        let transport = self.transport_for(&config.tls);
        let conn = transport.connect(config.address()).await?;
        let conn_id = self
            .inner
            .register(conn, config.endpoint.clone(), None);
        info!(conn_id, endpoint = %config.endpoint, "connected");
        Ok(conn_id)
    }

    /// Tears down exactly one connection.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Result<()> {
        if self.inner.remove(conn_id, true) {
            self.inner.notify_closed(conn_id);
            info!(conn_id, "disconnected");
            Ok(())
        } else {
            Err(TransportError::UnknownConnection(conn_id))
        }
    }

    /// Starts a listener; returns the bound local address.
    pub async fn run_server(&self, config: &ServerConfig) -> Result<String> {
        config.validate()?;
        if self.inner.servers.lock().contains_key(&config.endpoint) {
            return Err(TransportError::ServerAlreadyRunning(config.endpoint.clone()));
        }
        let transport = self.transport_for(&config.tls);
        let listener = transport.listen(config.address()).await?;
        let local_addr = listener.local_addr()?;

        let mut servers = self.inner.servers.lock();
        if servers.contains_key(&config.endpoint) {
            return Err(TransportError::ServerAlreadyRunning(config.endpoint.clone()));
        }
        let accept_task = tokio::spawn(accept_loop(
            config.endpoint.clone(),
            listener,
            Arc::downgrade(&self.inner),
        ));
        servers.insert(
            config.endpoint.clone(),
            ServerEntry {
                local_addr: local_addr.clone(),
                accept_task,
            },
        );
        info!(endpoint = %config.endpoint, local_addr = %local_addr, "server started");
        Ok(local_addr)
    }

    /// Stops the server on `endpoint` and closes the connections it accepted.
    pub fn stop_server(&self, endpoint: &str) -> Result<()> {
        let entry = self
            .inner
            .servers
            .lock()
            .remove(endpoint)
            .ok_or_else(|| TransportError::ServerNotRunning(endpoint.to_string()))?;
        entry.accept_task.abort();

        let accepted: Vec<ConnectionId> = self
            .inner
            .connections
            .read()
            .values()
            .filter(|e| e.info.server.as_deref() == Some(endpoint))
            .map(|e| e.info.id)
            .collect();
        for conn_id in accepted {
            let _ = self.disconnect(conn_id);
        }
        info!(endpoint, "server stopped");
        Ok(())
    }

    /// Sends one frame on a connection.
    pub async fn send(&self, conn_id: ConnectionId, frame: &Frame) -> Result<()> {
        let conn = self
            .inner
            .connections
            .read()
            .get(&conn_id)
            .map(|e| e.conn.clone())
            .ok_or(TransportError::UnknownConnection(conn_id))?;
        match conn.send_frame(frame).await {
            Ok(()) => {
                self.inner.metrics.record_sent(frame.payload.len());
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.inc_send_errors();
                if e.is_disconnect() && self.inner.remove(conn_id, true) {
                    self.inner.notify_closed(conn_id);
                }
                Err(e)
            }
        }
    }

    /// True while `conn_id` is open.
    pub fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.inner.connections.read().contains_key(&conn_id)
    }

    /// Details of one open connection.
    pub fn connection(&self, conn_id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner
            .connections
            .read()
            .get(&conn_id)
            .map(|e| e.info.clone())
    }

    /// All live connections, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .inner
            .connections
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Outbound connections only, ordered by id.
    pub fn outbound_connections(&self) -> Vec<ConnectionId> {
        self.connections()
            .into_iter()
            .filter(|c| c.server.is_none())
            .map(|c| c.id)
            .collect()
    }

    /// Running servers as `(endpoint, bound address)` pairs.
    pub fn servers(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .inner
            .servers
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.local_addr.clone()))
            .collect();
        list.sort();
        list
    }

    /// Stops every server and closes every connection.
    pub fn shutdown(&self) {
        let endpoints: Vec<String> = self.inner.servers.lock().keys().cloned().collect();
        for endpoint in endpoints {
            let _ = self.stop_server(&endpoint);
        }
        let ids: Vec<ConnectionId> = self.inner.connections.read().keys().copied().collect();
        for conn_id in ids {
            let _ = self.disconnect(conn_id);
        }
    }

    /// Current transport counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameFlags;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<SurfaceEvent>) -> SurfaceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let (server, mut server_rx) = TransportSurface::new();
        let addr = server
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();

        let (client, _client_rx) = TransportSurface::new();
        let conn_id = client.connect(&ClientConfig::insecure(addr)).await.unwrap();
        assert!(client.is_connected(conn_id));

        client
            .send(conn_id, &Frame::new(b"hello".to_vec(), FrameFlags::NONE))
            .await
            .unwrap();

        let accepted = match next_event(&mut server_rx).await {
            SurfaceEvent::Connected { conn_id, server } => {
                assert_eq!(server.as_deref(), Some("127.0.0.1:0"));
                conn_id
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert_ne!(accepted, conn_id);
        match next_event(&mut server_rx).await {
            SurfaceEvent::Frame { conn_id, frame } => {
                assert_eq!(conn_id, accepted);
                assert_eq!(frame.payload, b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(client.metrics().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_duplicate_server_rejected() {
        let (surface, _rx) = TransportSurface::new();
        let config = ServerConfig::insecure("127.0.0.1:0");
        surface.run_server(&config).await.unwrap();
        let err = surface.run_server(&config).await.unwrap_err();
        assert!(matches!(err, TransportError::ServerAlreadyRunning(_)));
        surface.stop_server("127.0.0.1:0").unwrap();
        assert!(surface.servers().is_empty());
        assert!(matches!(
            surface.stop_server("127.0.0.1:0"),
            Err(TransportError::ServerNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_emits_closed_and_fails_sends() {
        let (server, _server_rx) = TransportSurface::new();
        let addr = server
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();
        let (client, mut client_rx) = TransportSurface::new();
        let conn_id = client.connect(&ClientConfig::insecure(addr)).await.unwrap();

        assert!(matches!(
            next_event(&mut client_rx).await,
            SurfaceEvent::Connected { .. }
        ));
        client.disconnect(conn_id).unwrap();
        assert!(matches!(
            next_event(&mut client_rx).await,
            SurfaceEvent::Closed { conn_id: id } if id == conn_id
        ));
        assert!(client.disconnect(conn_id).is_err());
        let err = client
            .send(conn_id, &Frame::new(vec![], FrameFlags::NONE))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn test_peer_close_reported() {
        let (server, _server_rx) = TransportSurface::new();
        let addr = server
            .run_server(&ServerConfig::insecure("127.0.0.1:0"))
            .await
            .unwrap();
        let (client, mut client_rx) = TransportSurface::new();
        let conn_id = client.connect(&ClientConfig::insecure(addr)).await.unwrap();
        assert!(matches!(
            next_event(&mut client_rx).await,
            SurfaceEvent::Connected { .. }
        ));

        // Give the accept loop a moment to register the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        assert!(matches!(
            next_event(&mut client_rx).await,
            SurfaceEvent::Closed { conn_id: id } if id == conn_id
        ));
        assert!(!client.is_connected(conn_id));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }
}
