//! Datapath errors.

use slim_transport::{ConnectionId, TransportError};
use thiserror::Error;

use crate::name::Name;

/// Errors raised by the routing fabric and the message processor.
#[derive(Debug, Error)]
pub enum DatapathError {
    /// A name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Neither a subscription nor a route matched the destination.
    #[error("no route to {destination}")]
    NoRoute {
        /// Unreachable name.
        destination: Name,
    },

    /// No such `(name, connection)` subscription.
    #[error("subscription not found: {name} on {}", describe_connection(*.connection))]
    SubscriptionNotFound {
        /// Subscribed name.
        name: Name,
        /// Connection, `None` for local.
        connection: Option<ConnectionId>,
    },

    /// No such route.
    #[error("route not found: {name} via connection {connection}")]
    RouteNotFound {
        /// Routed name.
        name: Name,
        /// Connection of the route.
        connection: ConnectionId,
    },

    /// A caller-supplied value was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The processor was shut down.
    #[error("datapath shut down")]
    Shutdown,

    /// Failure in the transport surface.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn describe_connection(connection: Option<ConnectionId>) -> String {
    match connection {
        Some(id) => format!("connection {}", id),
        None => "local".to_string(),
    }
}

/// Datapath result.
pub type Result<T> = std::result::Result<T, DatapathError>;
