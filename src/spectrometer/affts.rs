//! AFFTS fast Fourier transform spectrometer.
//!
//! Commands go out as UDP datagrams (`"AFFTS:<cmd> "`), spectra come back on
//! a TCP stream as fixed-header frames. The device emits a throwaway frame
//! before every real one, so each acquisition reads two frames and keeps the
//! second.

use super::{format_mhz, link_mut, DialectTiming};
use crate::codec::{FixedHeaderCodec, FrameCodec};
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::{DatagramConnector, DynDatagram, StreamConnector};
use crate::session::{DeviceInfo, Dialect, SessionConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Longest integration the firmware accepts.
pub const MAX_INTEGRATION: Duration = Duration::from_millis(5000);

pub struct Affts {
    data: Box<dyn StreamConnector>,
    commands: Box<dyn DatagramConnector>,
    codec: FixedHeaderCodec,
    timing: DialectTiming,
    link: Option<Link>,
    control: Option<DynDatagram>,
    last_timestamp: Option<String>,
}

impl Affts {
    pub fn new(data: Box<dyn StreamConnector>, commands: Box<dyn DatagramConnector>) -> Self {
        Self {
            data,
            commands,
            codec: FixedHeaderCodec::default(),
            timing: DialectTiming::default(),
            link: None,
            control: None,
            last_timestamp: None,
        }
    }

    pub fn with_timing(mut self, timing: DialectTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Timestamp of the last spectrum kept.
    pub fn last_timestamp(&self) -> Option<&str> {
        self.last_timestamp.as_deref()
    }

    /// Sync time in microseconds: half the integration, whole milliseconds.
    pub fn sync_time_us(config: &SessionConfig) -> u64 {
        config.integration_ms() / 2 * 1000
    }

    async fn command(&mut self, command: &str) -> AppResult<()> {
        let control = self.control.as_mut().ok_or(DaqError::NotConnected)?;
        let wire = self.codec.encode_command(command);
        tracing::debug!(command, "-> AFFTS");
        control.send_datagram(&wire).await
    }

    fn check(config: &SessionConfig) -> AppResult<()> {
        if config.integration_time > MAX_INTEGRATION {
            return Err(DaqError::Configuration(format!(
                "AFFTS integration time {:?} exceeds {:?}",
                config.integration_time, MAX_INTEGRATION
            )));
        }
        if let Some(i) = config.boards.iter().position(|b| b.frequency_mhz[0] != 0.0) {
            return Err(DaqError::Configuration(format!(
                "AFFTS band {} must start at 0 MHz",
                i + 1
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Dialect for Affts {
    fn kind(&self) -> &'static str {
        "affts"
    }

    async fn open(&mut self, config: &SessionConfig) -> AppResult<DeviceInfo> {
        Self::check(config)?;

        self.link = Some(Link::new(self.data.connect().await?));
        self.control = Some(self.commands.connect().await?);
        let gap = self.timing.command_gap;

        self.command("cmdMode INTERNAL").await?;
        tokio::time::sleep(gap).await;

        self.command(&format!("cmdSynctime {}", Self::sync_time_us(config)))
            .await?;
        tokio::time::sleep(gap).await;

        let blank_us = config.blank_time.as_millis() * 1000;
        self.command(&format!("cmdBlanktime {blank_us}")).await?;
        tokio::time::sleep(gap).await;

        for (i, board) in config.boards.iter().enumerate() {
            let band = i + 1;
            self.command(&format!("Band{band}:cmdNumspecchan {}", board.channels))
                .await?;
            self.command(&format!(
                "Band{band}:cmdBandWidth {} MHz",
                format_mhz(board.frequency_mhz[1])
            ))
            .await?;
            tokio::time::sleep(gap).await;
        }

        let sections = vec!["1"; config.boards.len()].join(" ");
        self.command(&format!("cmdUsedsections {sections}")).await?;
        tokio::time::sleep(gap).await;

        self.command("configure").await?;
        tokio::time::sleep(self.timing.configure_settle).await;
        self.command("calADC").await?;
        tokio::time::sleep(self.timing.calibration_settle).await;

        tracing::info!(peer = %self.data.peer(), boards = config.boards.len(), "AFFTS configured");
        Ok(DeviceInfo::default())
    }

    async fn arm(&mut self) -> AppResult<()> {
        link_mut(&mut self.link)?
            .discard_stale(self.timing.drain_window)
            .await;
        self.command("dump 2").await
    }

    async fn fetch(&mut self, schedule: PollSchedule) -> AppResult<Vec<f64>> {
        let link = link_mut(&mut self.link)?;
        let discarded = link.read(&self.codec, schedule).await?;
        tracing::trace!(timestamp = %discarded.header.timestamp, "Discarded lead-in frame");
        let frame = link.read(&self.codec, schedule).await?;
        self.last_timestamp = Some(frame.header.timestamp.clone());
        Ok(frame.values.into_iter().map(f64::from).collect())
    }

    async fn close(&mut self) -> AppResult<()> {
        let stopped = self.command("stop").await;
        self.abort();
        stopped
    }

    fn abort(&mut self) {
        self.link = None;
        self.control = None;
    }

    fn integration_entry(&self, config: &SessionConfig) -> (&'static str, Value) {
        ("Integration [micro-s]", json!(Self::sync_time_us(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Board;

    #[test]
    fn sync_time_is_half_the_integration() {
        let config = SessionConfig::new("a", 8192, Duration::from_millis(1001));
        assert_eq!(Affts::sync_time_us(&config), 500_000);
    }

    #[test]
    fn rejects_long_integrations_and_offset_bands() {
        let long = SessionConfig::new("a", 8192, Duration::from_millis(5001));
        assert!(matches!(Affts::check(&long), Err(DaqError::Configuration(_))));

        let offset = SessionConfig::new("a", 8192, Duration::from_millis(1000)).with_boards(vec![
            Board {
                channels: 8192,
                frequency_mhz: [0.0, 1500.0],
            },
            Board {
                channels: 8192,
                frequency_mhz: [100.0, 1500.0],
            },
        ]);
        assert!(matches!(Affts::check(&offset), Err(DaqError::Configuration(msg)) if msg.contains("band 2")));
    }
}
