//! RCTS104 chirp transform spectrometer behind its text control server.
//!
//! The server greets with `... connected to <host> on <stream>`, reports the
//! channel count of the stream, and after `cts run` streams the spectrum as
//! text. The stream layout depends on the channel count:
//!
//! - 7504 channels: `{c0 c1 ...}` terminated by `bufa `
//! - 4096 channels: one count per line, terminated by `swaplist {}}`

use super::{link_mut, DialectTiming};
use crate::codec::{LineCodec, SentinelCodec, SentinelLayout};
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use crate::session::{DeviceInfo, Dialect, SessionConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Channel counts the server can stream.
pub const SUPPORTED_CHANNELS: [usize; 2] = [7504, 4096];

pub struct Rcts104 {
    connector: Box<dyn StreamConnector>,
    control: LineCodec,
    data: Option<SentinelCodec>,
    timing: DialectTiming,
    link: Option<Link>,
}

impl Rcts104 {
    pub fn new(connector: Box<dyn StreamConnector>) -> Self {
        Self {
            connector,
            control: LineCodec::default(),
            data: None,
            timing: DialectTiming::default(),
            link: None,
        }
    }

    pub fn with_timing(mut self, timing: DialectTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Layout chosen from the reported channel count.
    pub fn layout(&self) -> Option<SentinelLayout> {
        self.data.map(|codec| codec.layout())
    }
}

/// Split `... connected to <host> on <stream>` into host and stream.
pub fn parse_greeting(greeting: &str) -> AppResult<(String, String)> {
    let flat = greeting.replace('\n', "");
    flat.split_once("connected to ")
        .and_then(|(_, rest)| rest.split_once(" on "))
        .map(|(host, stream)| (host.trim().to_string(), stream.trim().to_string()))
        .filter(|(host, stream)| !host.is_empty() && !stream.is_empty())
        .ok_or_else(|| DaqError::Instrument(format!("unexpected greeting {greeting:?}")))
}

/// Collect banner lines until one names the connection.
///
/// A banner that never gets there within `timeout` is handed back as read so
/// far; parsing it reports what the server actually said.
async fn read_banner(link: &mut Link, codec: &LineCodec, timeout: Duration) -> AppResult<String> {
    let deadline = Instant::now() + timeout;
    let mut banner = String::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = match link.read(codec, PollSchedule::within(remaining)).await {
            Ok(line) => line,
            Err(DaqError::ReadTimeout(_)) if !banner.is_empty() => return Ok(banner),
            Err(err) => return Err(err),
        };
        banner.push_str(&line);
        banner.push('\n');
        if line.contains("connected to") {
            return Ok(banner);
        }
    }
}

/// Channel count from a `... channels N cycles ...` reply.
pub fn parse_channel_count(reply: &str) -> AppResult<usize> {
    let token = reply
        .split_once("channels ")
        .and_then(|(_, rest)| rest.split_once(" cycles"))
        .map(|(n, _)| n.trim())
        .ok_or_else(|| DaqError::Instrument(format!("no channel count in {reply:?}")))?;
    let parsed = match token.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| DaqError::Instrument(format!("bad channel count {token:?}")))
}

#[async_trait]
impl Dialect for Rcts104 {
    fn kind(&self) -> &'static str {
        "rcts104"
    }

    async fn open(&mut self, config: &SessionConfig) -> AppResult<DeviceInfo> {
        let link = self.link.insert(Link::new(self.connector.connect().await?));
        let reply_timeout = self.timing.reply_timeout;

        let greeting = read_banner(link, &self.control, reply_timeout).await?;
        let (host, stream) = parse_greeting(&greeting)?;

        let reply = link
            .ask(&self.control, &format!("cts config datafile {stream}"), reply_timeout)
            .await?;
        let channels = parse_channel_count(&reply)?;
        let layout = match channels {
            7504 => SentinelLayout::Braced,
            4096 => SentinelLayout::SwapList,
            other => {
                return Err(DaqError::Instrument(format!(
                    "wrong number of channels: {other}, expected one of {SUPPORTED_CHANNELS:?}"
                )))
            }
        };

        let runtime = config.integration_time.as_secs_f64();
        if layout == SentinelLayout::Braced {
            link.ask(&self.control, "cts init time 1.0", reply_timeout)
                .await?;
        } else {
            link.ask(&self.control, &format!("cts config time {runtime:.4}"), reply_timeout)
                .await?;
        }
        link.ask(&self.control, &format!("cts init time {runtime:.4}"), reply_timeout)
            .await?;

        self.data = Some(SentinelCodec::new(layout));
        tracing::info!(%host, %stream, channels, "RCTS104 configured");
        Ok(DeviceInfo {
            channels: Some(channels),
            identity: Some(format!("{host} on {stream}")),
        })
    }

    async fn arm(&mut self) -> AppResult<()> {
        let link = link_mut(&mut self.link)?;
        link.discard_stale(self.timing.drain_window).await;
        link.send(&self.control, "cts run").await
    }

    async fn fetch(&mut self, schedule: PollSchedule) -> AppResult<Vec<f64>> {
        let codec = self.data.ok_or(DaqError::NotConnected)?;
        link_mut(&mut self.link)?.read(&codec, schedule).await
    }

    async fn close(&mut self) -> AppResult<()> {
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        self.link = None;
        self.data = None;
    }

    fn integration_entry(&self, config: &SessionConfig) -> (&'static str, Value) {
        ("Integration [s]", json!(config.integration_time.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_yields_host_and_stream() {
        let (host, stream) =
            parse_greeting("Welcome\nyou are connected to pc104 on /dev/cts0\n").unwrap();
        assert_eq!(host, "pc104");
        assert_eq!(stream, "/dev/cts0");
        assert!(parse_greeting("hello there").is_err());
    }

    #[test]
    fn channel_count_accepts_decimal_and_hex() {
        assert_eq!(parse_channel_count("ok channels 7504 cycles 12").unwrap(), 7504);
        assert_eq!(parse_channel_count("channels 0x1000 cycles 3").unwrap(), 4096);
        assert!(parse_channel_count("channels many cycles").is_err());
    }
}
