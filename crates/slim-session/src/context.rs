//! Metadata handed to applications with each received message.

use std::collections::HashMap;

use slim_datapath::Name;
use slim_transport::ConnectionId;

/// Payload type used when the sender does not set one.
pub const DEFAULT_PAYLOAD_TYPE: &str = "msg";

/// Where a received message came from and how to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Sending app.
    pub source_name: Name,
    /// Group name for group traffic, `None` for point-to-point.
    pub destination_name: Option<Name>,
    /// Application-chosen type tag.
    pub payload_type: String,
    /// Sender-supplied key/value pairs.
    pub metadata: HashMap<String, String>,
    /// Connection the message arrived on; replies prefer it.
    pub input_connection: ConnectionId,
    /// Sender identity as established by the token verifier.
    pub identity: String,
}

/// A payload together with its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Where it came from.
    pub context: MessageContext,
    /// Decrypted application bytes.
    pub payload: Vec<u8>,
}
