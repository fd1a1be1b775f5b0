//! Application-facing error type.

use slim_datapath::DatapathError;
use slim_transport::TransportError;
use thiserror::Error;

/// The closed error taxonomy seen by applications and foreign callers.
///
/// Discriminants 1..8 are stable across the foreign boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlimError {
    /// Node or connection level failure.
    #[error("service error: {0}")]
    ServiceError(String),

    /// Session lifecycle failure.
    #[error("session error: {0}")]
    SessionError(String),

    /// Failure receiving a message.
    #[error("receive error: {0}")]
    ReceiveError(String),

    /// Failure sending a message.
    #[error("send error: {0}")]
    SendError(String),

    /// Token issue or verification failure.
    #[error("auth error: {0}")]
    AuthError(String),

    /// A deadline elapsed.
    #[error("timeout")]
    Timeout,

    /// Bad input from the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl SlimError {
    /// Stable integer code, 1..8.
    pub fn discriminant(&self) -> i32 {
        match self {
            SlimError::ServiceError(_) => 1,
            SlimError::SessionError(_) => 2,
            SlimError::ReceiveError(_) => 3,
            SlimError::SendError(_) => 4,
            SlimError::AuthError(_) => 5,
            SlimError::Timeout => 6,
            SlimError::InvalidArgument(_) => 7,
            SlimError::InternalError(_) => 8,
        }
    }

    /// Rebuilds an error from its discriminant. `message` is ignored for `Timeout`.
    pub fn from_discriminant(discriminant: i32, message: String) -> Option<Self> {
        Some(match discriminant {
            1 => SlimError::ServiceError(message),
            2 => SlimError::SessionError(message),
            3 => SlimError::ReceiveError(message),
            4 => SlimError::SendError(message),
            5 => SlimError::AuthError(message),
            6 => SlimError::Timeout,
            7 => SlimError::InvalidArgument(message),
            8 => SlimError::InternalError(message),
            _ => return None,
        })
    }

    /// The carried message; `None` for `Timeout`.
    pub fn message(&self) -> Option<&str> {
        match self {
            SlimError::ServiceError(m)
            | SlimError::SessionError(m)
            | SlimError::ReceiveError(m)
            | SlimError::SendError(m)
            | SlimError::AuthError(m)
            | SlimError::InvalidArgument(m)
            | SlimError::InternalError(m) => Some(m),
            SlimError::Timeout => None,
        }
    }

    /// Maps a failure raised while setting up connectivity (connect, run_server).
    pub fn service(err: impl Into<DatapathError>) -> Self {
        match err.into() {
            DatapathError::Transport(e) => SlimError::ServiceError(e.to_string()),
            other => other.into(),
        }
    }
}

impl From<DatapathError> for SlimError {
    fn from(err: DatapathError) -> Self {
        match err {
            DatapathError::NoRoute { .. } => SlimError::SendError("no route".to_string()),
            DatapathError::InvalidName(_)
            | DatapathError::SubscriptionNotFound { .. }
            | DatapathError::RouteNotFound { .. }
            | DatapathError::InvalidArgument(_) => SlimError::InvalidArgument(err.to_string()),
            DatapathError::Codec(e) => SlimError::InternalError(e.to_string()),
            DatapathError::Shutdown => SlimError::ServiceError(err.to_string()),
            DatapathError::Transport(e) => e.into(),
        }
    }
}

impl From<TransportError> for SlimError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ServerAlreadyRunning(_)
            | TransportError::ServerNotRunning(_)
            | TransportError::InvalidConfig(_)
            | TransportError::TlsError { .. } => SlimError::ServiceError(err.to_string()),
            other => SlimError::SendError(other.to_string()),
        }
    }
}

impl From<bincode::Error> for SlimError {
    fn from(err: bincode::Error) -> Self {
        SlimError::InternalError(err.to_string())
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SlimError>;
