//! Checksummed telegram framing (wobbler stage controller).
//!
//! Request: `STX <addr> <command> ':' <checksum> ETX`
//! Reply:   `STX <addr><status> ':' <answer> ':' <checksum> ETX`
//!
//! The checksum is the XOR of the address and payload bytes (the `:`
//! separators are not included), written as two uppercase hex digits. The
//! status is a hex number whose bit 0 means "in motion".
//!
//! A reply that cannot be trusted does not abort the caller: it decodes to
//! [`TelegramReply::Malformed`] (or [`TelegramReply::Silent`] when nothing
//! arrived), both of which report [`SENTINEL_STATUS`].

use super::{Decoded, FrameCodec, FrameError};
use bytes::{Buf, Bytes, BytesMut};
use regex::bytes::Regex;
use std::sync::OnceLock;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Status reported for replies that never arrived or could not be trusted.
pub const SENTINEL_STATUS: u8 = 0xFF;

/// Status bit set while the stage is moving.
pub const STATUS_MOVING: u8 = 0x01;

/// XOR of every byte in `parts`.
pub fn checksum(parts: &[&[u8]]) -> u8 {
    parts
        .iter()
        .flat_map(|part| part.iter())
        .fold(0u8, |acc, b| acc ^ b)
}

#[allow(clippy::expect_used)]
fn reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?-u)^\x02([^:]+):([^:]*):([^:]+)\x03$").expect("static telegram pattern")
    })
}

/// One decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramReply {
    Answer { status: u8, answer: String },
    /// Nothing arrived within the reply window.
    Silent,
    /// Something arrived but failed extraction or checksum verification.
    Malformed(FrameError),
}

impl TelegramReply {
    /// Device status, or [`SENTINEL_STATUS`] when the reply is unusable.
    pub fn status(&self) -> u8 {
        match self {
            TelegramReply::Answer { status, .. } => *status,
            TelegramReply::Silent | TelegramReply::Malformed(_) => SENTINEL_STATUS,
        }
    }

    /// Answer text; empty when the reply is unusable.
    pub fn answer(&self) -> &str {
        match self {
            TelegramReply::Answer { answer, .. } => answer,
            TelegramReply::Silent | TelegramReply::Malformed(_) => "",
        }
    }

    pub fn is_moving(&self) -> bool {
        self.status() & STATUS_MOVING != 0
    }

    /// True for an answer with a device-reported status.
    pub fn is_trusted(&self) -> bool {
        matches!(self, TelegramReply::Answer { .. })
    }
}

/// Codec for one bus address.
#[derive(Debug, Clone, Copy)]
pub struct TelegramCodec {
    address: u8,
}

impl TelegramCodec {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Build a reply telegram as the controller would send it.
    pub fn encode_reply(&self, status: u8, answer: &str) -> Bytes {
        let head = format!("{}{:X}", self.address as char, status);
        let sum = checksum(&[head.as_bytes(), answer.as_bytes()]);
        let mut out = vec![STX];
        out.extend_from_slice(format!("{head}:{answer}:{sum:02X}").as_bytes());
        out.push(ETX);
        Bytes::from(out)
    }

    fn parse(&self, frame: &[u8]) -> Result<TelegramReply, FrameError> {
        let groups = reply_pattern()
            .captures(frame)
            .ok_or_else(|| FrameError::malformed("reply does not match STX a:b:c ETX"))?;
        let head = &groups[1];
        let answer = &groups[2];
        let received = &groups[3];

        if head[0] != self.address {
            return Err(FrameError::malformed(format!(
                "reply addressed to {:?}, expected {:?}",
                head[0] as char, self.address as char
            )));
        }
        let status_text = std::str::from_utf8(&head[1..])
            .map_err(|_| FrameError::malformed("status is not ASCII"))?;
        let status = u8::from_str_radix(status_text, 16)
            .map_err(|_| FrameError::malformed(format!("bad status {status_text:?}")))?;

        let expected = format!("{:02X}", checksum(&[head, answer]));
        let actual = String::from_utf8_lossy(received).to_uppercase();
        if expected != actual {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        Ok(TelegramReply::Answer {
            status,
            answer: String::from_utf8_lossy(answer).into_owned(),
        })
    }
}

impl FrameCodec for TelegramCodec {
    type Frame = TelegramReply;

    fn encode_command(&self, command: &str) -> Bytes {
        let address = [self.address];
        let sum = checksum(&[&address[..], command.as_bytes()]);
        let mut out = Vec::with_capacity(command.len() + 6);
        out.push(STX);
        out.push(self.address);
        out.extend_from_slice(command.as_bytes());
        out.push(b':');
        out.extend_from_slice(format!("{sum:02X}").as_bytes());
        out.push(ETX);
        Bytes::from(out)
    }

    /// Leading line noise before an STX is dropped.
    fn try_decode(&self, buf: &mut BytesMut) -> Decoded<TelegramReply> {
        let Some(start) = buf.iter().position(|&b| b == STX) else {
            if buf.is_empty() {
                return Decoded::Incomplete;
            }
            buf.clear();
            return Decoded::Ready(TelegramReply::Malformed(FrameError::malformed(
                "noise without STX",
            )));
        };
        buf.advance(start);

        let Some(end) = buf.iter().position(|&b| b == ETX) else {
            return Decoded::Incomplete;
        };
        let frame = buf.split_to(end + 1);
        match self.parse(&frame) {
            Ok(reply) => Decoded::Ready(reply),
            Err(err) => Decoded::Ready(TelegramReply::Malformed(err)),
        }
    }

    fn decode_eof(&self, buf: &mut BytesMut) -> Decoded<TelegramReply> {
        if buf.is_empty() {
            return Decoded::Incomplete;
        }
        buf.clear();
        Decoded::Ready(TelegramReply::Malformed(FrameError::malformed(
            "telegram without ETX",
        )))
    }
}
