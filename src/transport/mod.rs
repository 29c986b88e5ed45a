//! Transport layer.
//!
//! A transport carries whole wire frames over a reliable, order-preserving
//! stream. Frames are JSON messages behind a little-endian u32 length
//! prefix, capped to keep a hostile peer from forcing huge allocations.
//!
//! The seams are traits so the manager never cares what the stream is:
//! production dials peers through [`socks::Socks5Connector`] (the
//! anonymizing daemon's proxy) and accepts inbound streams the daemon
//! forwards to a local listener; tests run the same code over loopback
//! TCP.

pub mod socks;
pub mod tcp;

pub use socks::Socks5Connector;
pub use tcp::{TcpAcceptor, TcpConnector, TcpTransport};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;
use crate::protocol::message::WireMessage;

/// Maximum encoded frame size.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Bidirectional, order-preserving frame stream to one peer.
#[async_trait]
pub trait FrameTransport: Send {
    /// Send one frame.
    async fn send(&mut self, frame: &WireMessage) -> Result<(), CoreError>;

    /// Receive the next frame.
    async fn receive(&mut self) -> Result<WireMessage, CoreError>;

    /// Flush and shut the stream down.
    async fn close(&mut self) -> Result<(), CoreError>;

    /// The peer's address, as well as this transport knows it.
    fn peer_addr(&self) -> String;
}

/// Dials peers by network address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a frame transport to the peer at `address`.
    async fn connect(&self, address: &str) -> Result<Box<dyn FrameTransport>, CoreError>;
}

/// Accepts inbound frame transports.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound transport.
    async fn accept(&mut self) -> Result<Box<dyn FrameTransport>, CoreError>;
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &WireMessage,
) -> Result<(), CoreError> {
    let data = frame.to_json()?;
    if data.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<WireMessage, CoreError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    WireMessage::from_json(&data)
}
