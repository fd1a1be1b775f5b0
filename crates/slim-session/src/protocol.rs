//! Session messages carried inside datapath `Session` bodies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use slim_datapath::Name;

use crate::config::SessionType;
use crate::crypto::Sealed;
use crate::error::Result;

/// Application payload, sealed when the session is encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Cleartext payload.
    Plain(Vec<u8>),
    /// Payload encrypted with the session key.
    Sealed(Sealed),
}

/// Session control and data messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Point-to-point handshake request.
    Open {
        /// Payload encryption requested.
        mls: bool,
        /// Creator metadata.
        metadata: HashMap<String, String>,
        /// Initiator key share when encrypted.
        public_key: Option<Vec<u8>>,
    },
    /// Handshake accepted.
    OpenAck {
        /// Responder key share when encrypted.
        public_key: Option<Vec<u8>>,
    },
    /// Handshake refused.
    OpenReject {
        /// Why it was refused.
        reason: String,
    },
    /// Moderator invites an app to a group.
    Invite {
        /// Group name.
        group: Name,
        /// Payload encryption requested.
        mls: bool,
        /// Creator metadata.
        metadata: HashMap<String, String>,
        /// Moderator key share when encrypted.
        public_key: Option<Vec<u8>>,
    },
    /// Invitation accepted.
    InviteAck {
        /// Invitee key share when encrypted.
        public_key: Option<Vec<u8>>,
    },
    /// Invitation refused.
    InviteReject {
        /// Why it was refused.
        reason: String,
    },
    /// Membership (and, when encrypted, epoch secret) pushed by the moderator.
    GroupUpdate {
        /// New epoch.
        epoch: u64,
        /// Full membership.
        participants: Vec<Name>,
        /// Epoch secret sealed for the receiver.
        secret: Option<Sealed>,
    },
    /// Membership update applied.
    GroupUpdateAck,
    /// Moderator removes the receiver from the group.
    Remove,
    /// Removal applied.
    RemoveAck,
    /// Application data.
    Publish {
        /// Application type tag.
        payload_type: String,
        /// Sender metadata.
        metadata: HashMap<String, String>,
        /// The data.
        payload: Payload,
    },
    /// Data received.
    PublishAck,
    /// Session teardown.
    Close,
    /// Teardown acknowledged.
    CloseAck,
}

impl SessionMessage {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionMessage::Open { .. } => "open",
            SessionMessage::OpenAck { .. } => "open_ack",
            SessionMessage::OpenReject { .. } => "open_reject",
            SessionMessage::Invite { .. } => "invite",
            SessionMessage::InviteAck { .. } => "invite_ack",
            SessionMessage::InviteReject { .. } => "invite_reject",
            SessionMessage::GroupUpdate { .. } => "group_update",
            SessionMessage::GroupUpdateAck => "group_update_ack",
            SessionMessage::Remove => "remove",
            SessionMessage::RemoveAck => "remove_ack",
            SessionMessage::Publish { .. } => "publish",
            SessionMessage::PublishAck => "publish_ack",
            SessionMessage::Close => "close",
            SessionMessage::CloseAck => "close_ack",
        }
    }

    /// Responses that resolve a pending request by correlation id.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            SessionMessage::OpenAck { .. }
                | SessionMessage::OpenReject { .. }
                | SessionMessage::InviteAck { .. }
                | SessionMessage::InviteReject { .. }
                | SessionMessage::GroupUpdateAck
                | SessionMessage::RemoveAck
                | SessionMessage::PublishAck
                | SessionMessage::CloseAck
        )
    }
}

/// Header shared by every session message.
///
/// `initiator` and `session_id` identify the session on every participant:
/// the id is the one chosen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// App that created the session.
    pub initiator: Name,
    /// Id chosen by the initiator.
    pub session_id: u32,
    /// Kind of the session.
    pub session_type: SessionType,
    /// True when sent by the initiator side.
    pub from_initiator: bool,
    /// Set on requests that expect a response and echoed by the response.
    pub correlation_id: Option<u64>,
    /// The message itself.
    pub message: SessionMessage,
}

impl SessionEnvelope {
    /// Serializes with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Inverse of [`SessionEnvelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let env = SessionEnvelope {
            initiator: Name::new(["org", "ns", "svc"], Some(1)).unwrap(),
            session_id: 42,
            session_type: SessionType::Group,
            from_initiator: true,
            correlation_id: Some(7),
            message: SessionMessage::Publish {
                payload_type: "ping".to_string(),
                metadata: HashMap::from([("k".to_string(), "v".to_string())]),
                payload: Payload::Plain(vec![1, 2, 3]),
            },
        };
        let decoded = SessionEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.message.name(), "publish");
        assert!(!decoded.message.is_response());
    }

    #[test]
    fn test_responses() {
        assert!(SessionMessage::PublishAck.is_response());
        assert!(SessionMessage::OpenReject { reason: "x".into() }.is_response());
        assert!(!SessionMessage::Close.is_response());
    }
}
