//! Wire codec for values crossing the foreign boundary.
//!
//! Integers are big-endian and fixed width, booleans one byte, strings, byte
//! sequences, sequences and maps carry a 32-bit length prefix, optionals a
//! presence byte and tagged unions a 32-bit discriminant.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use slim_datapath::Name;
use slim_session::{
    AuthConfig, JwtAlgorithm, JwtConfig, MessageContext, ReceivedMessage, Result,
    SessionConfig, SessionState, SessionType, SlimError, SpireConfig,
};
use slim_transport::{ClientConfig, ServerConfig, TlsConfig, TlsVersion};

/// Serialises a value into the wire format.
pub trait Lower {
    /// Appends the encoded value to `buf`.
    fn write(&self, buf: &mut BytesMut) -> Result<()>;
}

/// Reads a value from the wire format, advancing `buf`.
pub trait Lift: Sized {
    /// Decodes one value.
    fn read(buf: &mut &[u8]) -> Result<Self>;
}

/// Encodes `value` into a fresh byte vector.
pub fn lower<T: Lower + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    value.write(&mut buf)?;
    Ok(buf.to_vec())
}

/// Reads one value and rejects trailing bytes.
pub fn lift<T: Lift>(mut bytes: &[u8]) -> Result<T> {
    let value = T::read(&mut bytes)?;
    if !bytes.is_empty() {
        return Err(invalid(format!("{} trailing bytes", bytes.len())));
    }
    Ok(value)
}

fn invalid(msg: impl Into<String>) -> SlimError {
    SlimError::InvalidArgument(msg.into())
}

fn ensure(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(invalid(format!(
            "buffer too short: need {} bytes, have {}",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn write_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = i32::try_from(len).map_err(|_| invalid("length exceeds i32::MAX"))?;
    buf.put_i32(len);
    Ok(())
}

fn read_len(buf: &mut &[u8]) -> Result<usize> {
    let len = i32::read(buf)?;
    usize::try_from(len).map_err(|_| invalid(format!("negative length {}", len)))
}

macro_rules! int_codec {
    ($($t:ty => $put:ident, $get:ident;)*) => {$(
        impl Lower for $t {
            fn write(&self, buf: &mut BytesMut) -> Result<()> {
                buf.$put(*self);
                Ok(())
            }
        }

        impl Lift for $t {
            fn read(buf: &mut &[u8]) -> Result<Self> {
                ensure(buf, std::mem::size_of::<$t>())?;
                Ok(buf.$get())
            }
        }
    )*};
}

int_codec! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    u16 => put_u16, get_u16;
    i16 => put_i16, get_i16;
    u32 => put_u32, get_u32;
    i32 => put_i32, get_i32;
    u64 => put_u64, get_u64;
    i64 => put_i64, get_i64;
}

impl Lower for bool {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Lift for bool {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        match u8::read(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(invalid(format!("invalid bool byte {}", other))),
        }
    }
}

impl Lower for str {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_len(buf, self.len())?;
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Lower for String {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.as_str().write(buf)
    }
}

impl Lift for String {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let len = read_len(buf)?;
        ensure(buf, len)?;
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|e| invalid(format!("invalid utf-8: {}", e)))?
            .to_string();
        buf.advance(len);
        Ok(s)
    }
}

// Byte sequences share the sequence layout: length prefix, one byte per item.
impl<T: Lower> Lower for Vec<T> {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.as_slice().write(buf)
    }
}

impl<T: Lower> Lower for [T] {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_len(buf, self.len())?;
        for item in self {
            item.write(buf)?;
        }
        Ok(())
    }
}

impl<T: Lift> Lift for Vec<T> {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let len = read_len(buf)?;
        let mut items = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            items.push(T::read(buf)?);
        }
        Ok(items)
    }
}

impl<T: Lower> Lower for Option<T> {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            None => buf.put_u8(0),
            Some(v) => {
                buf.put_u8(1);
                v.write(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Lift> Lift for Option<T> {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        match u8::read(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::read(buf)?)),
            other => Err(invalid(format!("invalid option tag {}", other))),
        }
    }
}

impl<K: Lower, V: Lower> Lower for HashMap<K, V> {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_len(buf, self.len())?;
        for (k, v) in self {
            k.write(buf)?;
            v.write(buf)?;
        }
        Ok(())
    }
}

impl<K: Lift + Eq + Hash, V: Lift> Lift for HashMap<K, V> {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let len = read_len(buf)?;
        let mut map = HashMap::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            let k = K::read(buf)?;
            let v = V::read(buf)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl Lower for Duration {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u64(self.as_secs());
        buf.put_u32(self.subsec_nanos());
        Ok(())
    }
}

impl Lift for Duration {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let secs = u64::read(buf)?;
        let nanos = u32::read(buf)?;
        if nanos >= 1_000_000_000 {
            return Err(invalid(format!("invalid sub-second nanos {}", nanos)));
        }
        Ok(Duration::new(secs, nanos))
    }
}

/// Converts a foreign millisecond timeout; negative values are rejected.
pub fn duration_from_millis(ms: i64) -> Result<Duration> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| invalid(format!("negative duration {} ms", ms)))
}

impl Lower for PathBuf {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.to_str()
            .ok_or_else(|| invalid(format!("non utf-8 path {}", self.display())))?
            .write(buf)
    }
}

impl Lift for PathBuf {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(PathBuf::from(String::read(buf)?))
    }
}

impl Lower for SlimError {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(self.discriminant());
        if let Some(message) = self.message() {
            message.write(buf)?;
        }
        Ok(())
    }
}

impl Lift for SlimError {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let discriminant = i32::read(buf)?;
        let message = if discriminant == SlimError::Timeout.discriminant() {
            String::new()
        } else {
            String::read(buf)?
        };
        SlimError::from_discriminant(discriminant, message)
            .ok_or_else(|| invalid(format!("unknown error discriminant {}", discriminant)))
    }
}

impl Lower for SessionType {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(self.discriminant());
        Ok(())
    }
}

impl Lift for SessionType {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let d = i32::read(buf)?;
        SessionType::from_discriminant(d)
            .ok_or_else(|| invalid(format!("unknown session type {}", d)))
    }
}

impl Lower for SessionState {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(match self {
            SessionState::Init => 1,
            SessionState::Handshaking => 2,
            SessionState::Established => 3,
            SessionState::Closing => 4,
            SessionState::Closed => 5,
        });
        Ok(())
    }
}

impl Lift for SessionState {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(match i32::read(buf)? {
            1 => SessionState::Init,
            2 => SessionState::Handshaking,
            3 => SessionState::Established,
            4 => SessionState::Closing,
            5 => SessionState::Closed,
            other => return Err(invalid(format!("unknown session state {}", other))),
        })
    }
}

impl Lower for Name {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.components().write(buf)?;
        self.id().write(buf)
    }
}

impl Lift for Name {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        let components = Vec::<String>::read(buf)?;
        let id = Option::<u64>::read(buf)?;
        Ok(Name::new(components, id)?)
    }
}

impl Lower for TlsConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.insecure.write(buf)?;
        self.insecure_skip_verify.write(buf)?;
        self.cert_file.write(buf)?;
        self.key_file.write(buf)?;
        self.ca_file.write(buf)?;
        self.tls_version.as_str().write(buf)?;
        self.include_system_ca_certs_pool.write(buf)
    }
}

impl Lift for TlsConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(TlsConfig {
            insecure: bool::read(buf)?,
            insecure_skip_verify: bool::read(buf)?,
            cert_file: Lift::read(buf)?,
            key_file: Lift::read(buf)?,
            ca_file: Lift::read(buf)?,
            tls_version: TlsVersion::parse(&String::read(buf)?)
                .map_err(|e| invalid(e.to_string()))?,
            include_system_ca_certs_pool: bool::read(buf)?,
        })
    }
}

impl Lower for ClientConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.endpoint.write(buf)?;
        self.tls.write(buf)
    }
}

impl Lift for ClientConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(ClientConfig::new(String::read(buf)?, TlsConfig::read(buf)?))
    }
}

impl Lower for ServerConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.endpoint.write(buf)?;
        self.tls.write(buf)
    }
}

impl Lift for ServerConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(ServerConfig::new(String::read(buf)?, TlsConfig::read(buf)?))
    }
}

impl Lower for SessionConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.session_type.write(buf)?;
        self.max_retries.write(buf)?;
        self.interval_ms.write(buf)?;
        self.mls_enabled.write(buf)?;
        self.metadata.write(buf)
    }
}

impl Lift for SessionConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(SessionConfig {
            session_type: SessionType::read(buf)?,
            max_retries: u32::read(buf)?,
            interval_ms: u64::read(buf)?,
            mls_enabled: bool::read(buf)?,
            metadata: HashMap::read(buf)?,
        })
    }
}

impl Lower for MessageContext {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.source_name.write(buf)?;
        self.destination_name.write(buf)?;
        self.payload_type.write(buf)?;
        self.metadata.write(buf)?;
        self.input_connection.write(buf)?;
        self.identity.write(buf)
    }
}

impl Lift for MessageContext {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(MessageContext {
            source_name: Name::read(buf)?,
            destination_name: Lift::read(buf)?,
            payload_type: String::read(buf)?,
            metadata: HashMap::read(buf)?,
            input_connection: u64::read(buf)?,
            identity: String::read(buf)?,
        })
    }
}

impl Lower for ReceivedMessage {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.context.write(buf)?;
        self.payload.write(buf)
    }
}

impl Lift for ReceivedMessage {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(ReceivedMessage {
            context: MessageContext::read(buf)?,
            payload: Vec::read(buf)?,
        })
    }
}

impl Lower for JwtAlgorithm {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32(match self {
            JwtAlgorithm::HS256 => 1,
            JwtAlgorithm::RS256 => 2,
            JwtAlgorithm::ES256 => 3,
        });
        Ok(())
    }
}

impl Lift for JwtAlgorithm {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(match i32::read(buf)? {
            1 => JwtAlgorithm::HS256,
            2 => JwtAlgorithm::RS256,
            3 => JwtAlgorithm::ES256,
            other => return Err(invalid(format!("unknown jwt algorithm {}", other))),
        })
    }
}

impl Lower for JwtConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.algorithm.write(buf)?;
        self.secret.write(buf)?;
        self.private_key_file.write(buf)?;
        self.public_key_file.write(buf)?;
        self.issuer.write(buf)?;
        self.audience.write(buf)?;
        self.subject.write(buf)?;
        self.duration_secs.write(buf)
    }
}

impl Lift for JwtConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(JwtConfig {
            algorithm: JwtAlgorithm::read(buf)?,
            secret: Lift::read(buf)?,
            private_key_file: Lift::read(buf)?,
            public_key_file: Lift::read(buf)?,
            issuer: Lift::read(buf)?,
            audience: Lift::read(buf)?,
            subject: Lift::read(buf)?,
            duration_secs: u64::read(buf)?,
        })
    }
}

impl Lower for SpireConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.jwt_svid_file.write(buf)?;
        self.bundle_key_file.write(buf)?;
        self.algorithm.write(buf)?;
        self.audience.write(buf)
    }
}

impl Lift for SpireConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(SpireConfig {
            jwt_svid_file: PathBuf::read(buf)?,
            bundle_key_file: PathBuf::read(buf)?,
            algorithm: JwtAlgorithm::read(buf)?,
            audience: Lift::read(buf)?,
        })
    }
}

impl Lower for AuthConfig {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            AuthConfig::SharedSecret { secret } => {
                buf.put_i32(1);
                secret.write(buf)
            }
            AuthConfig::Jwt(config) => {
                buf.put_i32(2);
                config.write(buf)
            }
            AuthConfig::Spire(config) => {
                buf.put_i32(3);
                config.write(buf)
            }
            AuthConfig::StaticToken { token_file } => {
                buf.put_i32(4);
                token_file.write(buf)
            }
        }
    }
}

impl Lift for AuthConfig {
    fn read(buf: &mut &[u8]) -> Result<Self> {
        Ok(match i32::read(buf)? {
            1 => AuthConfig::SharedSecret {
                secret: String::read(buf)?,
            },
            2 => AuthConfig::Jwt(JwtConfig::read(buf)?),
            3 => AuthConfig::Spire(SpireConfig::read(buf)?),
            4 => AuthConfig::StaticToken {
                token_file: PathBuf::read(buf)?,
            },
            other => return Err(invalid(format!("unknown auth kind {}", other))),
        })
    }
}
