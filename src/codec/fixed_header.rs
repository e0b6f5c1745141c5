//! Fixed-header binary framing (FFT spectrometer data stream).
//!
//! Every data frame starts with a 64 byte header:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | format tag                     |
//! | 4      | 4    | byte order tag                 |
//! | 8      | 4    | total frame length (u32, LE)   |
//! | 12     | 8    | backend name                   |
//! | 20     | 28   | timestamp text                 |
//! | 48     | 16   | four u32 counters              |
//!
//! The payload after the header is `(length - 64) / 4` little-endian `f32`.
//! Commands travel separately as `"<prefix><command> "` datagrams.

use super::{fixed_text, le_u32, Decoded, FrameCodec, FrameError};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 64;

const LENGTH_OFFSET: usize = 8;

/// Largest frame accepted before the length field is considered garbage.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedHeader {
    pub format: String,
    pub byte_order: String,
    pub length: u32,
    pub backend: String,
    pub timestamp: String,
    pub counters: [u32; 4],
}

/// One header plus its float payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FixedHeaderFrame {
    pub header: FixedHeader,
    pub values: Vec<f32>,
}

impl FixedHeaderFrame {
    /// Build a frame around `values`, filling in the length field.
    pub fn new(timestamp: &str, values: Vec<f32>) -> Self {
        let length = (HEADER_LEN + values.len() * 4) as u32;
        Self {
            header: FixedHeader {
                format: "FFTS".into(),
                byte_order: "LE".into(),
                length,
                backend: "AFFTS".into(),
                timestamp: timestamp.into(),
                counters: [0; 4],
            },
            values,
        }
    }

    /// Serialize the frame the way the device streams it.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header.length as usize);
        put_padded(&mut out, &self.header.format, 4);
        put_padded(&mut out, &self.header.byte_order, 4);
        out.put_u32_le(self.header.length);
        put_padded(&mut out, &self.header.backend, 8);
        put_padded(&mut out, &self.header.timestamp, 28);
        for counter in self.header.counters {
            out.put_u32_le(counter);
        }
        for value in &self.values {
            out.put_f32_le(*value);
        }
        out.freeze()
    }
}

fn put_padded(out: &mut BytesMut, text: &str, width: usize) {
    let raw = text.as_bytes();
    let n = raw.len().min(width);
    out.put_slice(&raw[..n]);
    out.put_bytes(0, width - n);
}

/// Codec for the fixed-header dialect.
#[derive(Debug, Clone)]
pub struct FixedHeaderCodec {
    prefix: String,
}

impl Default for FixedHeaderCodec {
    fn default() -> Self {
        Self::new("AFFTS:")
    }
}

impl FixedHeaderCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn parse_header(raw: &[u8]) -> FixedHeader {
        FixedHeader {
            format: fixed_text(&raw[0..4]),
            byte_order: fixed_text(&raw[4..8]),
            length: le_u32(raw, LENGTH_OFFSET),
            backend: fixed_text(&raw[12..20]),
            timestamp: fixed_text(&raw[20..48]),
            counters: [
                le_u32(raw, 48),
                le_u32(raw, 52),
                le_u32(raw, 56),
                le_u32(raw, 60),
            ],
        }
    }
}

impl FrameCodec for FixedHeaderCodec {
    type Frame = FixedHeaderFrame;

    fn encode_command(&self, command: &str) -> Bytes {
        Bytes::from(format!("{}{} ", self.prefix, command))
    }

    fn try_decode(&self, buf: &mut BytesMut) -> Decoded<FixedHeaderFrame> {
        if buf.len() < HEADER_LEN {
            return Decoded::Incomplete;
        }

        let length = le_u32(buf, LENGTH_OFFSET) as usize;
        if length < HEADER_LEN {
            return Decoded::Invalid(FrameError::malformed(format!(
                "declared length {length} is shorter than the {HEADER_LEN} byte header"
            )));
        }
        if length > MAX_FRAME_LEN {
            return Decoded::Invalid(FrameError::malformed(format!(
                "declared length {length} exceeds {MAX_FRAME_LEN}"
            )));
        }
        if (length - HEADER_LEN) % 4 != 0 {
            return Decoded::Invalid(FrameError::malformed(format!(
                "payload of {} bytes is not a whole number of floats",
                length - HEADER_LEN
            )));
        }
        if buf.len() < length {
            return Decoded::Incomplete;
        }

        let raw = buf.split_to(length);
        let header = Self::parse_header(&raw[..HEADER_LEN]);
        let values = raw[HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Decoded::Ready(FixedHeaderFrame { header, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_carry_prefix_and_trailing_space() {
        let codec = FixedHeaderCodec::default();
        assert_eq!(&codec.encode_command("dump 2")[..], b"AFFTS:dump 2 ");
    }

    #[test]
    fn waits_for_whole_header_then_payload() {
        let codec = FixedHeaderCodec::default();
        let wire = FixedHeaderFrame::new("2019-03-01T12:00:00", vec![1.5, -2.0, 4.25]).to_bytes();

        let mut buf = BytesMut::from(&wire[..40]);
        assert_eq!(codec.try_decode(&mut buf), Decoded::Incomplete);
        assert_eq!(buf.len(), 40);

        buf.extend_from_slice(&wire[40..70]);
        assert_eq!(codec.try_decode(&mut buf), Decoded::Incomplete);

        buf.extend_from_slice(&wire[70..]);
        match codec.try_decode(&mut buf) {
            Decoded::Ready(frame) => {
                assert_eq!(frame.values, vec![1.5, -2.0, 4.25]);
                assert_eq!(frame.header.length, 76);
                assert_eq!(frame.header.timestamp, "2019-03-01T12:00:00");
                assert_eq!(frame.header.backend, "AFFTS");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn header_only_frame_has_no_values() {
        let codec = FixedHeaderCodec::default();
        let mut buf = BytesMut::from(&FixedHeaderFrame::new("t", vec![]).to_bytes()[..]);
        match codec.try_decode(&mut buf) {
            Decoded::Ready(frame) => assert!(frame.values.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let codec = FixedHeaderCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FixedHeaderFrame::new("first", vec![9.0]).to_bytes());
        buf.extend_from_slice(&FixedHeaderFrame::new("second", vec![1.0, 2.0]).to_bytes());

        let first = codec.try_decode(&mut buf);
        let second = codec.try_decode(&mut buf);
        assert!(matches!(first, Decoded::Ready(f) if f.header.timestamp == "first"));
        assert!(matches!(second, Decoded::Ready(f) if f.values == vec![1.0, 2.0]));
    }

    #[test]
    fn rejects_impossible_lengths() {
        let codec = FixedHeaderCodec::default();
        let mut frame = FixedHeaderFrame::new("t", vec![]);
        frame.header.length = 12;
        let mut buf = BytesMut::from(&frame.to_bytes()[..]);
        assert!(matches!(codec.try_decode(&mut buf), Decoded::Invalid(_)));

        frame.header.length = 66;
        let mut buf = BytesMut::from(&frame.to_bytes()[..]);
        assert!(matches!(codec.try_decode(&mut buf), Decoded::Invalid(_)));
    }
}
