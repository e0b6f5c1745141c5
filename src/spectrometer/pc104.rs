//! PC104 chirp transform spectrometer.
//!
//! Length-prefixed messages over one TCP stream. `INIT` makes the device
//! push two data frames that carry nothing useful; they are read and thrown
//! away before the integration time is set.

use super::{link_mut, DialectTiming};
use crate::codec::LengthPrefixedCodec;
use crate::error::AppResult;
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use crate::session::{DeviceInfo, Dialect, SessionConfig};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct Pc104 {
    connector: Box<dyn StreamConnector>,
    codec: LengthPrefixedCodec,
    timing: DialectTiming,
    link: Option<Link>,
}

impl Pc104 {
    pub fn new(connector: Box<dyn StreamConnector>) -> Self {
        Self {
            connector,
            codec: LengthPrefixedCodec,
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
impl Dialect for Pc104 {
    fn kind(&self) -> &'static str {
        "pc104"
    }

    async fn open(&mut self, config: &SessionConfig) -> AppResult<DeviceInfo> {
        let link = self.link.insert(Link::new(self.connector.connect().await?));

        link.send(&self.codec, "MAIN").await?;
        link.send(&self.codec, "INIT\0").await?;
        let settle = PollSchedule::within(
            self.timing
                .reply_timeout
                .max(config.integration_time * 2),
        );
        for _ in 0..2 {
            let frame = link.read(&self.codec, settle).await?;
            tracing::trace!(index = frame.index, "Discarded INIT frame");
        }
        link.send(&self.codec, &format!("TIME \"{}\"\0", config.integration_ms()))
            .await?;

        tracing::info!(peer = %self.connector.peer(), "PC104 configured");
        Ok(DeviceInfo::default())
    }

    async fn arm(&mut self) -> AppResult<()> {
        let link = link_mut(&mut self.link)?;
        link.discard_stale(self.timing.drain_window).await;
        link.send(&self.codec, "RUN\0").await
    }

    async fn fetch(&mut self, schedule: PollSchedule) -> AppResult<Vec<f64>> {
        let frame = link_mut(&mut self.link)?.read(&self.codec, schedule).await?;
        tracing::debug!(
            index = frame.index,
            sum_counter = frame.sum_counter,
            channels = frame.counts.len(),
            "PC104 spectrum"
        );
        Ok(frame.normalized())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        self.link = None;
    }

    fn integration_entry(&self, config: &SessionConfig) -> (&'static str, Value) {
        ("Integration [s]", json!(config.integration_time.as_secs_f64()))
    }
}
