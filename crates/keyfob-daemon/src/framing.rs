//! Length-prefixed frame codec.
//!
//! Everything that moves bytes in this daemon — the IPC socket, the stream
//! channel, beacon delivery, and the rendezvous-point request bodies —
//! shares one frame format:
//!
//! ```text
//! +----------------------+------------------+
//! | length (4 bytes, BE) | payload          |
//! +----------------------+------------------+
//! ```
//!
//! The decoder validates the length prefix against the frame cap before
//! reserving space, so a hostile peer cannot make the daemon allocate
//! unbounded memory from a four-byte header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame. Handshake messages are small; anything
/// near this size is already abuse.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Bytes taken by the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Errors raised by the codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame advertised or carried more bytes than the cap allows.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    TooLong {
        /// Advertised payload length.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec producing and consuming length-prefixed frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    /// Codec with the default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_len: MAX_FRAME_LEN,
        }
    }

    /// Codec with a tighter frame cap, for transports with small payloads.
    #[must_use]
    pub const fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_len {
            return Err(FrameError::TooLong {
                len,
                max: self.max_len,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.len() > self.max_len {
            return Err(FrameError::TooLong {
                len: frame.len(),
                max: self.max_len,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + frame.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_len above
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Frame a payload into a standalone buffer.
///
/// Used where no [`tokio_util::codec::Framed`] wrapper is in play: POST
/// bodies for the rendezvous channel and one-shot beacon writes.
#[must_use]
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}
