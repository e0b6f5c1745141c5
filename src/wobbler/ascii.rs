//! Line-protocol wobbler (WASPAM water vapour radiometer stage).
//!
//! | command  | reply                         |
//! |----------|-------------------------------|
//! | `G`      | identity, contains `Wobbler`  |
//! | `Z`      | homing done (may take 20 s)   |
//! | `F<f>`   | `F:<f>`                       |
//! | `F?`     | `F:<f>`                       |
//! | `P<pos>` | completion line once arrived  |
//! | `P?`     | `P:<pos>`                     |

use super::{MotionRequest, PositionReply, WobblerDrive};
use crate::codec::LineCodec;
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_FREQUENCY: u32 = 2000;

/// Fastest step rate of the stage.
pub const MAX_FREQUENCY: f64 = 5000.0;
/// Stage travel per step in metres.
pub const STEP_LENGTH_M: f64 = 1.5625e-6;
/// Longest integration `frequency_and_time` plans for.
pub const MAX_INTEGRATION_MS: u64 = 7500;

const SPEED_OF_LIGHT: f64 = 3e8;

/// Wobbler frequency and integration time for a line at `f0_hz`.
///
/// Fits the largest whole number of wavelengths the stage can travel within
/// `integration_ms`, rounds the step period to 2 µs and returns
/// `(frequency, integration_ms)` for that path.
pub fn frequency_and_time(f0_hz: f64, integration_ms: u64) -> AppResult<(u32, u64)> {
    if integration_ms > MAX_INTEGRATION_MS {
        return Err(DaqError::InvalidParameter(format!(
            "integration time maximum {MAX_INTEGRATION_MS} ms"
        )));
    }
    if f0_hz <= 0.0 {
        return Err(DaqError::InvalidParameter(format!("line frequency {f0_hz} Hz")));
    }

    let ti0 = integration_ms as f64 * 1e-3;
    let max_steps = ti0 * MAX_FREQUENCY;
    let wave_steps = SPEED_OF_LIGHT / f0_hz / STEP_LENGTH_M;
    let wavelengths = (max_steps / wave_steps).floor();
    if wavelengths <= 0.0 {
        return Err(DaqError::InvalidParameter(format!(
            "integration time {integration_ms} ms too short for {f0_hz} Hz"
        )));
    }

    let path = wavelengths * wave_steps;
    let fw = (path / ti0).floor();
    let fw = (5e5 / (5e5 / fw).floor()).trunc();
    let ti_ms = (path / fw / 1e-3).floor();
    Ok((fw as u32, ti_ms as u64))
}

/// Number after an `X:` prefix.
fn parse_tagged(reply: &str, tag: &str) -> AppResult<i64> {
    let value = reply.trim();
    let value = value.strip_prefix(tag).unwrap_or(value);
    value
        .trim()
        .parse()
        .map_err(|_| DaqError::MalformedFrame(format!("expected {tag}<n>, got {reply:?}")))
}

pub struct AsciiWobbler {
    connector: Box<dyn StreamConnector>,
    codec: LineCodec,
    link: Option<Link>,
    frequency: u32,
    reply_timeout: Duration,
    homing_timeout: Duration,
    motion_timeout: Duration,
    max_attempts: u32,
}

impl AsciiWobbler {
    pub fn new(connector: Box<dyn StreamConnector>, frequency: u32) -> Self {
        Self {
            connector,
            codec: LineCodec::default(),
            link: None,
            frequency: frequency.max(1),
            reply_timeout: Duration::from_secs(2),
            homing_timeout: Duration::from_secs(20),
            motion_timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    pub fn with_timeouts(mut self, reply: Duration, homing: Duration, motion: Duration) -> Self {
        self.reply_timeout = reply;
        self.homing_timeout = homing;
        self.motion_timeout = motion;
        self
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    fn link(&mut self) -> AppResult<&mut Link> {
        self.link.as_mut().ok_or(DaqError::NotConnected)
    }

    /// Send `command` and wait for one line, resending on silence.
    async fn ask(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        let codec = self.codec.clone();
        let attempts = self.max_attempts;
        let link = self.link()?;
        link.discard_stale(Duration::from_millis(5)).await;
        for attempt in 1..=attempts {
            link.send(&codec, command).await?;
            match link.read(&codec, PollSchedule::within(timeout)).await {
                Ok(line) => return Ok(line),
                Err(DaqError::ReadTimeout(_)) => {
                    tracing::debug!(command, attempt, "Wobbler silent, resending");
                }
                Err(err) => return Err(err),
            }
        }
        Err(DaqError::ReadTimeout(timeout * attempts))
    }

    /// Set the step frequency; the controller echoes it back.
    pub async fn set_frequency(&mut self, frequency: u32) -> AppResult<u32> {
        let reply = self.ask(&format!("F{frequency}"), self.reply_timeout).await?;
        let echoed = parse_tagged(&reply, "F:")?;
        if echoed != i64::from(frequency) {
            return Err(DaqError::Instrument(format!(
                "wobbler set frequency {echoed} instead of {frequency}"
            )));
        }
        self.frequency = frequency.max(1);
        Ok(frequency)
    }

    pub async fn query_frequency(&mut self) -> AppResult<i64> {
        let reply = self.ask("F?", self.reply_timeout).await?;
        parse_tagged(&reply, "F:")
    }

    async fn handshake(&mut self) -> AppResult<String> {
        let identity = self.ask("G", self.reply_timeout).await?;
        if !identity.contains("Wobbler") {
            return Err(DaqError::Instrument(format!(
                "wobbler is not responding (got {identity:?})"
            )));
        }
        self.ask("Z", self.homing_timeout).await?;
        self.set_frequency(self.frequency).await?;
        Ok(identity)
    }
}

#[async_trait]
impl WobblerDrive for AsciiWobbler {
    async fn open(&mut self) -> AppResult<String> {
        if self.link.is_some() {
            return Err(DaqError::AlreadyConnected);
        }
        self.link = Some(Link::new(self.connector.connect().await?));
        match self.handshake().await {
            Ok(identity) => Ok(identity),
            Err(err) => {
                self.link = None;
                Err(err)
            }
        }
    }

    fn step_period(&self) -> f64 {
        1.0 / f64::from(self.frequency)
    }

    async fn command_move(&mut self, request: MotionRequest) -> AppResult<()> {
        let codec = self.codec.clone();
        let link = self.link()?;
        link.discard_stale(Duration::from_millis(5)).await;
        link.send(&codec, &format!("P{}", request.target_position))
            .await
    }

    async fn settle(&mut self, target: i64) -> AppResult<()> {
        let codec = self.codec.clone();
        let timeout = self.motion_timeout;
        let done = self
            .link()?
            .read(&codec, PollSchedule::within(timeout))
            .await?;
        tracing::debug!(target, reply = %done, "Wobbler move finished");
        Ok(())
    }

    async fn query_position(&mut self) -> AppResult<PositionReply> {
        let reply = self.ask("P?", self.reply_timeout).await?;
        parse_tagged(&reply, "P:").map(PositionReply::Reported)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.link = None;
        Ok(())
    }
}
