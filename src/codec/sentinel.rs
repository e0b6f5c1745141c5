//! ASCII sentinel-streamed framing (correlator spectrometers).
//!
//! The device streams a block of text until a layout specific end marker
//! shows up. The frame is complete once the marker is present and, for the
//! text layouts, the buffer ends in a newline. Whatever arrived before the
//! read deadline is still parsed by [`FrameCodec::decode_eof`]; a block that
//! cannot be parsed is reported as malformed, never as empty data.

use super::{Decoded, FrameCodec, FrameError};
use bytes::{Bytes, BytesMut};

/// Where the numbers sit inside the streamed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelLayout {
    /// Space separated counts between `{` and `}`, ended by `bufa `.
    Braced,
    /// One count per line between `} \n` and `\nread`, ended by `swaplist {}}`.
    SwapList,
    /// Big-endian `f64` block after the first line, ended by `# end data\n`.
    BinaryBlock,
}

impl SentinelLayout {
    /// Marker that must appear before the block is considered complete.
    pub fn end_marker(self) -> &'static [u8] {
        match self {
            SentinelLayout::Braced => b"bufa ",
            SentinelLayout::SwapList => b"swaplist {}}",
            SentinelLayout::BinaryBlock => b"# end data\n",
        }
    }

    fn is_text(self) -> bool {
        !matches!(self, SentinelLayout::BinaryBlock)
    }
}

/// Codec for the sentinel dialects. Frames are normalized spectra.
#[derive(Debug, Clone, Copy)]
pub struct SentinelCodec {
    layout: SentinelLayout,
}

impl SentinelCodec {
    pub fn new(layout: SentinelLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> SentinelLayout {
        self.layout
    }

    fn parse(&self, block: &[u8]) -> Result<Vec<f64>, FrameError> {
        match self.layout {
            SentinelLayout::Braced => {
                let text = String::from_utf8_lossy(block);
                let body = between(&text, "{", "}")
                    .ok_or_else(|| FrameError::malformed("no braced count block"))?;
                normalize(parse_counts(body.split_whitespace())?, cycles(&text)?)
            }
            SentinelLayout::SwapList => {
                let text = String::from_utf8_lossy(block);
                let body = between(&text, "} \n", "\nread")
                    .ok_or_else(|| FrameError::malformed("no swap list block"))?;
                normalize(parse_counts(body.split('\n'))?, cycles(&text)?)
            }
            SentinelLayout::BinaryBlock => {
                let start = block
                    .iter()
                    .skip(1)
                    .position(|&b| b == b'\n')
                    .map(|p| p + 2)
                    .ok_or_else(|| FrameError::malformed("no header line before data"))?;
                let end = find(block, self.layout.end_marker())
                    .ok_or_else(|| FrameError::malformed("missing end of data marker"))?;
                if end < start {
                    return Err(FrameError::malformed("end marker precedes data"));
                }
                let data = &block[start..end];
                if data.len() % 8 != 0 {
                    return Err(FrameError::malformed(format!(
                        "data block of {} bytes is not a whole number of doubles",
                        data.len()
                    )));
                }
                Ok(data
                    .chunks_exact(8)
                    .map(|c| f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect())
            }
        }
    }

    fn is_complete(&self, buf: &[u8]) -> Option<usize> {
        let marker = self.layout.end_marker();
        let at = find(buf, marker)?;
        if self.layout.is_text() {
            (buf.last() == Some(&b'\n')).then_some(buf.len())
        } else {
            Some(at + marker.len())
        }
    }
}

impl FrameCodec for SentinelCodec {
    type Frame = Vec<f64>;

    fn encode_command(&self, command: &str) -> Bytes {
        Bytes::from(format!("{command}\n"))
    }

    fn try_decode(&self, buf: &mut BytesMut) -> Decoded<Vec<f64>> {
        match self.is_complete(buf) {
            Some(len) => {
                let block = buf.split_to(len);
                match self.parse(&block) {
                    Ok(values) => Decoded::Ready(values),
                    Err(err) => Decoded::Invalid(err),
                }
            }
            None => Decoded::Incomplete,
        }
    }

    fn decode_eof(&self, buf: &mut BytesMut) -> Decoded<Vec<f64>> {
        if buf.is_empty() {
            return Decoded::Incomplete;
        }
        let block = buf.split();
        match self.parse(&block) {
            Ok(values) => Decoded::Ready(values),
            Err(err) => Decoded::Invalid(err),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let len = text[start..].find(close)?;
    Some(&text[start..start + len])
}

fn cycles(text: &str) -> Result<f64, FrameError> {
    let token = text
        .split_once("cycles ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .ok_or_else(|| FrameError::malformed("missing cycles token"))?;
    let cycles: f64 = token
        .parse()
        .map_err(|_| FrameError::malformed(format!("bad cycles value {token:?}")))?;
    if cycles <= 0.0 {
        return Err(FrameError::malformed(format!("cycles {cycles} cannot normalize")));
    }
    Ok(cycles)
}

fn parse_counts<'a>(tokens: impl Iterator<Item = &'a str>) -> Result<Vec<i64>, FrameError> {
    tokens
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<i64>()
                .map_err(|_| FrameError::malformed(format!("bad count {t:?}")))
        })
        .collect()
}

fn normalize(counts: Vec<i64>, cycles: f64) -> Result<Vec<f64>, FrameError> {
    if counts.is_empty() {
        return Err(FrameError::malformed("count block is empty"));
    }
    Ok(counts.into_iter().map(|n| n as f64 / cycles).collect())
}
