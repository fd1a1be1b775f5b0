//! Frame format for peer-to-peer traffic.
//!
//! Every message exchanged between two SLIM processes travels in a frame with
//! a fixed 16-byte header followed by an opaque payload. The payload is the
//! serialized datapath message; this layer only cares about framing and
//! integrity.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + flags:1 + reserved:2 + payload_length:4 + checksum:4)
pub const FRAME_HEADER_SIZE: usize = 16;

/// Protocol magic number ("SLIM").
pub const MAGIC: u32 = 0x534C_494D;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted on the wire (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: FrameFlags = FrameFlags(0);
    /// Payload is end-to-end encrypted.
    pub const ENCRYPTED: FrameFlags = FrameFlags(0x01);
    /// Control traffic (subscriptions, session signalling).
    pub const CONTROL: FrameFlags = FrameFlags(0x02);

    /// Raw byte value.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from a raw byte.
    pub fn from_bits(b: u8) -> Self {
        FrameFlags(b)
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Frame header containing metadata about the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Control flags
    pub flags: FrameFlags,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 checksum of payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize the header into its 16-byte wire form.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u16(0);
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
    }

    /// Parse and sanity-check a header.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("short header: {} bytes", bytes.len()),
            });
        }
        let magic = bytes.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_bits(bytes.get_u8());
        let _reserved = bytes.get_u16();
        let payload_length = bytes.get_u32();
        let checksum = bytes.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            magic,
            version,
            flags,
            payload_length,
            checksum,
        })
    }
}

/// A single frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame, computing length and checksum.
    pub fn new(payload: Vec<u8>, flags: FrameFlags) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Header plus payload, ready for the socket.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    /// Check that the payload matches the header.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() as u64 != self.header.payload_length as u64 {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    self.payload.len(),
                    self.header.payload_length
                ),
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Flags carried by this frame.
    pub fn flags(&self) -> FrameFlags {
        self.header.flags
    }
}
