//! Length-prefixed binary framing (PC104 chirp transform spectrometer).
//!
//! Both directions prefix the message with a 4 byte big-endian length. A data
//! reply body is laid out as three 32 byte text fields (magic, name, date),
//! `index: i32`, `clock: i32`, `first_sample_start: f64`,
//! `last_sample_stop: f64`, `integration_counter: i32`, `sum_counter: i32`,
//! followed by the raw `u32` channel counts. Numeric body fields are
//! little-endian.

use super::{fixed_text, le_u32, Decoded, FrameCodec, FrameError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const PREFIX_LEN: usize = 4;
const TEXT_FIELD_LEN: usize = 32;

/// Size of the reply body before the channel array starts.
pub const BODY_HEADER_LEN: usize = 3 * TEXT_FIELD_LEN + 2 * 4 + 2 * 8 + 2 * 4;

/// Largest reply accepted before the length prefix is considered garbage.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// One decoded data reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LengthPrefixedFrame {
    pub magic: String,
    pub name: String,
    pub date: String,
    pub index: i32,
    pub clock: i32,
    pub first_sample_start: f64,
    pub last_sample_stop: f64,
    pub integration_counter: i32,
    pub sum_counter: i32,
    pub counts: Vec<u32>,
}

impl LengthPrefixedFrame {
    /// Channel counts divided by the sum counter.
    ///
    /// This removes the integration time dependence of the raw counts. Frames
    /// coming out of the codec always have a positive sum counter.
    pub fn normalized(&self) -> Vec<f64> {
        let sum = f64::from(self.sum_counter);
        self.counts.iter().map(|&c| f64::from(c) / sum).collect()
    }

    /// Serialize as the device sends it, length prefix included.
    pub fn to_bytes(&self) -> Bytes {
        let body_len = BODY_HEADER_LEN + self.counts.len() * 4;
        let mut out = BytesMut::with_capacity(PREFIX_LEN + body_len);
        out.put_u32(body_len as u32);
        for text in [&self.magic, &self.name, &self.date] {
            let raw = text.as_bytes();
            let n = raw.len().min(TEXT_FIELD_LEN);
            out.put_slice(&raw[..n]);
            out.put_bytes(0, TEXT_FIELD_LEN - n);
        }
        out.put_i32_le(self.index);
        out.put_i32_le(self.clock);
        out.put_f64_le(self.first_sample_start);
        out.put_f64_le(self.last_sample_stop);
        out.put_i32_le(self.integration_counter);
        out.put_i32_le(self.sum_counter);
        for count in &self.counts {
            out.put_u32_le(*count);
        }
        out.freeze()
    }
}

/// Codec for the length-prefixed dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedCodec;

impl FrameCodec for LengthPrefixedCodec {
    type Frame = LengthPrefixedFrame;

    fn encode_command(&self, command: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(PREFIX_LEN + command.len());
        out.put_u32(command.len() as u32);
        out.put_slice(command.as_bytes());
        out.freeze()
    }

    fn try_decode(&self, buf: &mut BytesMut) -> Decoded<LengthPrefixedFrame> {
        if buf.len() < PREFIX_LEN {
            return Decoded::Incomplete;
        }
        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len < BODY_HEADER_LEN {
            return Decoded::Invalid(FrameError::malformed(format!(
                "reply of {body_len} bytes cannot hold the {BODY_HEADER_LEN} byte header"
            )));
        }
        if body_len > MAX_BODY_LEN {
            return Decoded::Invalid(FrameError::malformed(format!(
                "reply length {body_len} exceeds {MAX_BODY_LEN}"
            )));
        }
        if (body_len - BODY_HEADER_LEN) % 4 != 0 {
            return Decoded::Invalid(FrameError::malformed(format!(
                "channel block of {} bytes is not a whole number of u32",
                body_len - BODY_HEADER_LEN
            )));
        }
        if buf.len() < PREFIX_LEN + body_len {
            return Decoded::Incomplete;
        }

        buf.advance(PREFIX_LEN);
        let body = buf.split_to(body_len);
        let frame = parse_body(&body);
        if frame.sum_counter <= 0 {
            return Decoded::Invalid(FrameError::malformed(format!(
                "sum counter {} cannot normalize the spectrum",
                frame.sum_counter
            )));
        }
        Decoded::Ready(frame)
    }
}

fn parse_body(body: &[u8]) -> LengthPrefixedFrame {
    let mut offset = 0;
    let mut text = || {
        let field = fixed_text(&body[offset..offset + TEXT_FIELD_LEN]);
        offset += TEXT_FIELD_LEN;
        field
    };
    let magic = text();
    let name = text();
    let date = text();

    let mut numbers = &body[3 * TEXT_FIELD_LEN..BODY_HEADER_LEN];
    let index = numbers.get_i32_le();
    let clock = numbers.get_i32_le();
    let first_sample_start = numbers.get_f64_le();
    let last_sample_stop = numbers.get_f64_le();
    let integration_counter = numbers.get_i32_le();
    let sum_counter = numbers.get_i32_le();

    let counts = (BODY_HEADER_LEN..body.len())
        .step_by(4)
        .map(|at| le_u32(body, at))
        .collect();

    LengthPrefixedFrame {
        magic,
        name,
        date,
        index,
        clock,
        first_sample_start,
        last_sample_stop,
        integration_counter,
        sum_counter,
        counts,
    }
}
