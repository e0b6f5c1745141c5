//! Wire dialects.
//!
//! Every device family speaks its own framing. Each one is a [`FrameCodec`]:
//! it encodes outgoing commands and tries to cut one frame off the front of
//! an accumulating receive buffer. Decoding never blocks and never guesses;
//! it reports one of three outcomes:
//!
//! - [`Decoded::Ready`]: a complete frame was consumed from the buffer
//! - [`Decoded::Incomplete`]: more bytes are needed, the buffer is untouched
//! - [`Decoded::Invalid`]: the bytes can never become a valid frame
//!
//! Running out of time is the reader's business, see
//! [`crate::hardware::polling::read_frame`].

pub mod fixed_header;
pub mod length_prefixed;
pub mod line;
pub mod sentinel;
pub mod telegram;

use crate::error::DaqError;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use fixed_header::{FixedHeader, FixedHeaderCodec, FixedHeaderFrame};
pub use length_prefixed::{LengthPrefixedCodec, LengthPrefixedFrame};
pub use line::LineCodec;
pub use sentinel::{SentinelCodec, SentinelLayout};
pub use telegram::{TelegramCodec, TelegramReply};

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<F> {
    Ready(F),
    Incomplete,
    Invalid(FrameError),
}

impl<F> Decoded<F> {
    /// Map the frame type, keeping the outcome.
    pub fn map<G>(self, f: impl FnOnce(F) -> G) -> Decoded<G> {
        match self {
            Decoded::Ready(frame) => Decoded::Ready(f(frame)),
            Decoded::Incomplete => Decoded::Incomplete,
            Decoded::Invalid(err) => Decoded::Invalid(err),
        }
    }
}

/// Why a byte sequence was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("checksum mismatch: expected {expected}, received {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl FrameError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl From<FrameError> for DaqError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Malformed(msg) => DaqError::MalformedFrame(msg),
            FrameError::ChecksumMismatch { expected, actual } => {
                DaqError::ChecksumMismatch { expected, actual }
            }
        }
    }
}

/// Encoder/decoder pair for one wire dialect.
pub trait FrameCodec {
    /// Decoded unit handed to the session.
    type Frame;

    /// Serialize a command for this dialect.
    fn encode_command(&self, command: &str) -> Bytes;

    /// Try to split one frame off the front of `buf`.
    ///
    /// Must leave `buf` untouched when returning [`Decoded::Incomplete`].
    fn try_decode(&self, buf: &mut BytesMut) -> Decoded<Self::Frame>;

    /// Last chance to decode once the stream closed or the read deadline passed.
    ///
    /// Binary dialects cannot salvage a partial frame, so the default keeps it
    /// incomplete and the reader reports the timeout.
    fn decode_eof(&self, buf: &mut BytesMut) -> Decoded<Self::Frame> {
        let _ = buf;
        Decoded::Incomplete
    }
}

/// Read a little-endian `u32` at `offset`. Callers check bounds first.
pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Text of a fixed-width, NUL padded field.
pub(crate) fn fixed_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}
