//! Length-prefixed framing for TCP streams.
//!
//! Every packet on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------------------+
//! | length (4 bytes)  |   payload                      |
//! | u32 little-endian |   [version] [postcard Packet]  |
//! +-------------------+--------------------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. Frames carry exactly
//! one encoded [`Packet`]; [`read_packet`] and [`write_packet`] combine the
//! framing with the codec from [`crate::packet`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::packet::{Packet, PacketError, decode_packet, encode_packet};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame did not contain a valid packet.
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn closed_or_io(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single length-prefixed frame from the stream.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(closed_or_io)?;

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len as usize,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    }

    Ok(payload)
}

/// Write a single length-prefixed frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    if payload.len() > config.max_payload_size as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read one frame and decode the [`Packet`] inside it.
pub async fn read_packet<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Packet, FrameError> {
    let frame = read_frame(reader, config).await?;
    Ok(decode_packet(&frame)?)
}

/// Encode a [`Packet`] and write it as one frame.
pub async fn write_packet<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    packet: &Packet,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let bytes = encode_packet(packet)?;
    write_frame(writer, &bytes, config).await
}
