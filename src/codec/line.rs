//! Newline-terminated ASCII replies.
//!
//! Used for greetings and command acknowledgements of the text dialects
//! (chopper, wobbler, correlator control channels).

use super::{Decoded, FrameCodec};
use bytes::{Buf, Bytes, BytesMut};

/// One line per frame, `\r\n` or `\n` terminated.
#[derive(Debug, Clone)]
pub struct LineCodec {
    terminator: String,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new("\n")
    }
}

impl LineCodec {
    /// `terminator` is appended to outgoing commands only.
    pub fn new(terminator: impl Into<String>) -> Self {
        Self {
            terminator: terminator.into(),
        }
    }
}

impl FrameCodec for LineCodec {
    type Frame = String;

    fn encode_command(&self, command: &str) -> Bytes {
        Bytes::from(format!("{}{}", command, self.terminator))
    }

    fn try_decode(&self, buf: &mut BytesMut) -> Decoded<String> {
        let Some(end) = buf.iter().position(|&b| b == b'\n') else {
            return Decoded::Incomplete;
        };
        let line = buf.split_to(end);
        buf.advance(1);
        let text = String::from_utf8_lossy(&line);
        Decoded::Ready(text.trim_end_matches('\r').to_string())
    }

    /// A device that stops mid-line still said something.
    fn decode_eof(&self, buf: &mut BytesMut) -> Decoded<String> {
        if buf.is_empty() {
            return Decoded::Incomplete;
        }
        let line = buf.split();
        Decoded::Ready(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string())
    }
}
