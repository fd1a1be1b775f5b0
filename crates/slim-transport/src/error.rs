//! Transport errors.

use thiserror::Error;

/// Errors raised by the transport surface.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing listens at `addr`.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Dialled address.
        addr: String,
    },

    /// The dial did not finish within the connect timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Dialled address.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The peer closed the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// No open connection has this id.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// A server already listens on this endpoint.
    #[error("server already running on {0}")]
    ServerAlreadyRunning(String),

    /// No server listens on this endpoint.
    #[error("no server running on {0}")]
    ServerNotRunning(String),

    /// Malformed frame.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong.
        reason: String,
    },

    /// Frame does not start with the expected magic.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Wire magic.
        expected: u32,
        /// Value read.
        got: u32,
    },

    /// Frame uses another wire version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Local wire version.
        expected: u8,
        /// Version read.
        got: u8,
    },

    /// Payload CRC does not match the header.
    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// CRC from the header.
        expected: u32,
        /// CRC of the payload.
        computed: u32,
    },

    /// Payload exceeds the frame limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Payload length.
        size: u32,
        /// Frame limit.
        max_size: u32,
    },

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Certificate loading or handshake failure.
    #[error("TLS error: {reason}")]
    TlsError {
        /// Underlying failure.
        reason: String,
    },

    /// The surface was shut down.
    #[error("transport shut down")]
    Shutdown,

    /// Socket error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// True when the error came from the peer going away rather than from
    /// local misuse.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::ConnectionReset | TransportError::UnknownConnection(_) => true,
            TransportError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Transport result.
pub type Result<T> = std::result::Result<T, TransportError>;
