//! Message framing for the reliable stream and the datagram channel
//!
//! Stream: `[i32 length][payload]`, repeated, little-endian.
//! Datagram: `[i32 sender][i32 length][payload]`, one message per datagram.
//! The payload always starts with the packet ID.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::game::constants::net::HEADER_SIZE;
use crate::game::entity::PeerId;

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("Invalid frame length: {0}")]
    InvalidLength(i32),
    #[error("Datagram truncated: {0} bytes")]
    TruncatedDatagram(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Write a length-prefixed message to a stream
///
/// Format: [4 bytes little-endian length][payload]
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    payload: &[u8],
    max_frame: usize,
) -> Result<(), FramingError> {
    if payload.len() > max_frame {
        return Err(FramingError::MessageTooLarge(payload.len(), max_frame));
    }
    stream.write_all(&(payload.len() as i32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks
///
/// Bytes persist across reads; every complete frame is sliced out as soon
/// as it is available, and a partial frame waits for the next chunk.
#[derive(Debug)]
pub struct StreamAccumulator {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl StreamAccumulator {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_frame,
        }
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one read's worth of bytes; returns the payloads completed by it
    ///
    /// A negative or oversized length is unrecoverable for the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        while self.buffer.len() - start >= HEADER_SIZE {
            let mut header = [0u8; HEADER_SIZE];
            header.copy_from_slice(&self.buffer[start..start + HEADER_SIZE]);
            let length = i32::from_le_bytes(header);
            if length < 0 {
                return Err(FramingError::InvalidLength(length));
            }
            let length = length as usize;
            if length > self.max_frame {
                return Err(FramingError::MessageTooLarge(length, self.max_frame));
            }
            let end = start + HEADER_SIZE + length;
            if end > self.buffer.len() {
                break;
            }
            frames.push(self.buffer[start + HEADER_SIZE..end].to_vec());
            start = end;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        Ok(frames)
    }
}

/// Build a datagram: sender header, then the length-prefixed payload
pub fn encode_datagram(sender: PeerId, payload: &[u8], max_size: usize) -> Result<Vec<u8>, FramingError> {
    let total = 2 * HEADER_SIZE + payload.len();
    if total > max_size {
        return Err(FramingError::MessageTooLarge(total, max_size));
    }
    let mut datagram = Vec::with_capacity(total);
    datagram.extend_from_slice(&sender.to_le_bytes());
    datagram.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Split a datagram into its sender and payload
///
/// A datagram with only the sender header is a registration (empty payload).
pub fn decode_datagram(datagram: &[u8]) -> Result<(PeerId, &[u8]), FramingError> {
    if datagram.len() < HEADER_SIZE {
        return Err(FramingError::TruncatedDatagram(datagram.len()));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&datagram[..HEADER_SIZE]);
    let sender = i32::from_le_bytes(header);
    let rest = &datagram[HEADER_SIZE..];
    if rest.is_empty() {
        return Ok((sender, rest));
    }
    if rest.len() < HEADER_SIZE {
        return Err(FramingError::TruncatedDatagram(datagram.len()));
    }
    header.copy_from_slice(&rest[..HEADER_SIZE]);
    let length = i32::from_le_bytes(header);
    if length < 0 {
        return Err(FramingError::InvalidLength(length));
    }
    let body = &rest[HEADER_SIZE..];
    if body.len() < length as usize {
        return Err(FramingError::TruncatedDatagram(datagram.len()));
    }
    Ok((sender, &body[..length as usize]))
}
