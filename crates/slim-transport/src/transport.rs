//! Abstract transport layer for SLIM peer connections.
//!
//! The [`Transport`], [`Connection`] and [`Listener`] traits give the
//! transport surface one interface over plaintext TCP and TLS-over-TCP.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// Something that can open and accept peer connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to a remote peer at `addr` (`host:port`).
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;

    /// Listen for incoming connections on `addr`.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// An established, ordered, message-framed connection.
///
/// Sends and receives may run concurrently from different tasks; each
/// direction is serialized internally.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Writes one frame.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Reads the next frame, validating its header and checksum.
    async fn recv_frame(&self) -> Result<Frame>;

    /// Remote peer address.
    fn peer_addr(&self) -> &str;

    /// Local address.
    fn local_addr(&self) -> &str;
}

/// A bound listener.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Waits for the next peer.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// Bound address, useful after binding port 0.
    fn local_addr(&self) -> Result<String>;
}

/// A framed connection over any split byte stream.
pub struct FramedConnection<R, W> {
    read: Mutex<R>,
    write: Mutex<W>,
    peer_addr: String,
    local_addr: String,
}

impl<R, W> std::fmt::Debug for FramedConnection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl<R, W> FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps the two halves of a stream.
    pub fn new(read: R, write: W, peer_addr: String, local_addr: String) -> Self {
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
        }
    }
}

#[async_trait]
impl<R, W> Connection for FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        let mut sink = self.write.lock().await;
        sink.write_all(&bytes).await?;
        sink.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut source = self.read.lock().await;
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        source.read_exact(&mut raw).await?;
        let header = FrameHeader::decode(&raw)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        source.read_exact(&mut payload).await?;
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }
}
