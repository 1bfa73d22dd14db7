//! Length-prefixed frame codec
//!
//! Wire format: 4-byte big-endian length followed by exactly that many
//! payload bytes. The decoder tolerates arbitrary fragmentation from the
//! transport and yields every complete frame when several arrive
//! back-to-back. A declared length above the bound closes the channel.
//!
//! Payloads may additionally be wrapped in a padding envelope (marker +
//! inner length + zero fill to a 256-byte bucket) as a traffic-analysis
//! mitigation; [`unpad`] must run before any handshake or decryption logic
//! sees the payload.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::MAX_FRAME_SIZE;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Padding bucket size: padded payloads are a multiple of this
pub const PADDING_BUCKET: usize = 256;

/// First byte of every padding envelope
pub const PADDING_MARKER: u8 = 0xF5;

// marker + inner length
const PADDING_HEADER_SIZE: usize = 5;

/// Encode one payload as a length-prefixed frame
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Streaming frame decoder.
///
/// Feed raw transport bytes with [`push`](FrameCodec::push), then drain
/// complete frames with [`next_frame`](FrameCodec::next_frame) until it
/// returns `None`.
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default 8 MiB frame bound
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame bound
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Append raw bytes received from the transport
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one has fully arrived.
    ///
    /// An oversized declared length is a hard error; the caller must close
    /// the channel and discard the codec.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        len_bytes.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let declared = u32::from_be_bytes(len_bytes) as usize;

        if declared > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_SIZE + declared {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buffer.split_to(declared);
        Ok(Some(payload.to_vec()))
    }

    /// Bytes currently buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a payload in the padding envelope
pub fn pad(payload: &[u8]) -> Vec<u8> {
    let raw = PADDING_HEADER_SIZE + payload.len();
    let padded = raw.div_ceil(PADDING_BUCKET) * PADDING_BUCKET;

    let mut out = Vec::with_capacity(padded);
    out.push(PADDING_MARKER);
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    out.resize(padded, 0);
    out
}

/// Unwrap a padding envelope, returning the inner payload
pub fn unpad(wrapped: &[u8]) -> Result<Vec<u8>> {
    if wrapped.len() < PADDING_HEADER_SIZE {
        return Err(Error::MalformedFrame(
            "padding envelope shorter than header".to_string(),
        ));
    }
    if wrapped[0] != PADDING_MARKER {
        return Err(Error::MalformedFrame("missing padding marker".to_string()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&wrapped[1..PADDING_HEADER_SIZE]);
    let inner_len = u32::from_be_bytes(len_bytes) as usize;

    if PADDING_HEADER_SIZE + inner_len > wrapped.len() {
        return Err(Error::MalformedFrame(format!(
            "padding envelope declares {} inner bytes but holds {}",
            inner_len,
            wrapped.len() - PADDING_HEADER_SIZE
        )));
    }

    Ok(wrapped[PADDING_HEADER_SIZE..PADDING_HEADER_SIZE + inner_len].to_vec())
}
