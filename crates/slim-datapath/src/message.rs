//! Message envelope carried in peer frames.

use serde::{Deserialize, Serialize};
use slim_transport::{Frame, FrameFlags};

use crate::error::Result;
use crate::name::Name;

/// Fanout for unicast and anycast traffic.
pub const UNICAST: u32 = 1;

/// Fanout for multicast traffic: every matching subscriber.
pub const BROADCAST: u32 = u32::MAX;

/// What a message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Asks the receiving peer to forward traffic for `name` over this connection.
    Subscribe {
        /// Subscribed name.
        name: Name,
    },
    /// Withdraws an earlier `Subscribe`.
    Unsubscribe {
        /// Name to withdraw.
        name: Name,
    },
    /// Opaque session-layer payload.
    Session(Vec<u8>),
}

impl MessageBody {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Subscribe { .. } => "subscribe",
            MessageBody::Unsubscribe { .. } => "unsubscribe",
            MessageBody::Session(_) => "session",
        }
    }
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender name.
    pub source: Name,
    /// Name the message is routed to.
    pub destination: Name,
    /// Maximum number of targets: [`UNICAST`] or [`BROADCAST`].
    pub fanout: u32,
    /// Identity token of the sender, checked by the receiving session layer.
    pub identity: String,
    /// Control or session payload.
    pub body: MessageBody,
}

impl Message {
    /// Message without an identity token.
    pub fn new(source: Name, destination: Name, fanout: u32, body: MessageBody) -> Self {
        Self {
            source,
            destination,
            fanout,
            identity: String::new(),
            body,
        }
    }

    /// Subscription control message for `name`, sent from `source`.
    pub fn subscribe(source: Name, name: Name) -> Self {
        Self::new(source, name.clone(), UNICAST, MessageBody::Subscribe { name })
    }

    /// Withdrawal of a subscription for `name`, sent from `source`.
    pub fn unsubscribe(source: Name, name: Name) -> Self {
        Self::new(source, name.clone(), UNICAST, MessageBody::Unsubscribe { name })
    }

    /// Attaches the sender's identity token.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// True for subscription traffic.
    pub fn is_control(&self) -> bool {
        !matches!(self.body, MessageBody::Session(_))
    }

    /// Bincode encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Inverse of [`Message::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Wraps the encoded message in a peer frame.
    pub fn to_frame(&self) -> Result<Frame> {
        let flags = if self.is_control() {
            FrameFlags::CONTROL
        } else {
            FrameFlags::NONE
        };
        Ok(Frame::new(self.encode()?, flags))
    }

    /// Decodes the payload of a peer frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Self::decode(&frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(id: Option<u64>) -> Name {
        Name::new(["org", "ns", "svc"], id).unwrap()
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = Message::new(
            name(Some(1)),
            name(Some(2)),
            UNICAST,
            MessageBody::Session(vec![1, 2, 3]),
        )
        .with_identity("token");
        let frame = msg.to_frame().unwrap();
        assert!(!frame.flags().contains(FrameFlags::CONTROL));
        assert_eq!(Message::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_subscribe_is_control() {
        let msg = Message::subscribe(name(Some(1)), name(None));
        assert!(msg.is_control());
        assert_eq!(msg.body.kind(), "subscribe");
        assert!(msg.to_frame().unwrap().flags().contains(FrameFlags::CONTROL));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Message::decode(&[0xff, 0x01]).is_err());
    }
}
