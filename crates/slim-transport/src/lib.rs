#![warn(missing_docs)]

//! SLIM transport subsystem: framed peer connections over TCP and TLS,
//! client/server configuration and the connection surface used by the datapath.

pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod surface;
pub mod tcp;
pub mod tls;
pub mod tls_tcp;
pub mod transport;

pub use config::{load_config, ClientConfig, ServerConfig, TlsConfig, TlsVersion};
pub use error::{Result, TransportError};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use protocol::{Frame, FrameFlags, MAX_PAYLOAD_SIZE};
pub use surface::{next_connection_id, ConnectionId, ConnectionInfo, SurfaceEvent, TransportSurface};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use tls_tcp::TlsTcpTransport;
pub use transport::{Connection, Listener, Transport};
