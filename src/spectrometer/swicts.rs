//! SWICTS chirp transform spectrometer.
//!
//! Text control channel; spectra arrive as a block of big-endian doubles
//! between the first line break and `# end data\n`.

use super::{link_mut, DialectTiming};
use crate::codec::{LineCodec, SentinelCodec, SentinelLayout};
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use crate::session::{DeviceInfo, Dialect, SessionConfig};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct Swicts {
    connector: Box<dyn StreamConnector>,
    control: LineCodec,
    data: SentinelCodec,
    timing: DialectTiming,
    link: Option<Link>,
}

impl Swicts {
    pub fn new(connector: Box<dyn StreamConnector>) -> Self {
        Self {
            connector,
            control: LineCodec::default(),
            data: SentinelCodec::new(SentinelLayout::BinaryBlock),
            timing: DialectTiming::default(),
            link: None,
        }
    }

    pub fn with_timing(mut self, timing: DialectTiming) -> Self {
        self.timing = timing;
        self
    }
}

#[async_trait]
impl Dialect for Swicts {
    fn kind(&self) -> &'static str {
        "swicts"
    }

    async fn open(&mut self, config: &SessionConfig) -> AppResult<DeviceInfo> {
        let link = self.link.insert(Link::new(self.connector.connect().await?));
        let reply_timeout = self.timing.reply_timeout;

        let greeting = link
            .read(&self.control, PollSchedule::within(reply_timeout))
            .await?;
        if greeting.trim().is_empty() {
            return Err(DaqError::Instrument(format!(
                "empty greeting from {}",
                self.connector.peer()
            )));
        }

        link.ask(&self.control, "init", reply_timeout).await?;
        link.ask(
            &self.control,
            &format!("time {}", config.integration_ms()),
            reply_timeout,
        )
        .await?;

        tracing::info!(greeting = %greeting.trim(), "SWICTS configured");
        Ok(DeviceInfo {
            channels: None,
            identity: Some(greeting.trim().to_string()),
        })
    }

    async fn arm(&mut self) -> AppResult<()> {
        let link = link_mut(&mut self.link)?;
        link.discard_stale(self.timing.drain_window).await;
        link.send(&self.control, "run").await
    }

    async fn fetch(&mut self, schedule: PollSchedule) -> AppResult<Vec<f64>> {
        link_mut(&mut self.link)?.read(&self.data, schedule).await
    }

    async fn close(&mut self) -> AppResult<()> {
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        self.link = None;
    }

    fn integration_entry(&self, config: &SessionConfig) -> (&'static str, Value) {
        ("Integration [ms]", json!(config.integration_ms()))
    }
}
