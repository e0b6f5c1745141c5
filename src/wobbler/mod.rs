//! Wobbler control.
//!
//! A wobbler moves a mirror along a linear stage to modulate the optical
//! path. [`Wobbler`] validates targets, remembers the last commanded
//! position and verifies arrival; the device half is a [`WobblerDrive`]:
//!
//! - [`TelegramWobbler`]: checksummed telegram controller, polled until motionless
//! - [`AsciiWobbler`]: line protocol with an explicit completion echo

pub mod ascii;
pub mod motion;
pub mod telegram;

pub use ascii::{frequency_and_time, AsciiWobbler};
pub use motion::{recommended_movements, recommended_relative_motion, MotionBounds, MotionRequest};
pub use telegram::TelegramWobbler;

use crate::config::WobblerConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Readback;
use crate::hardware::transport::device_connector;
use crate::housekeeping::HousekeepingSink;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::instrument;

/// Answer to a position query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionReply {
    Reported(i64),
    /// The controller answered with its error status or not at all.
    Unusable,
}

/// Device half of a wobbler.
#[async_trait]
pub trait WobblerDrive: Send {
    /// Open the device, home it and return an identity string.
    async fn open(&mut self) -> AppResult<String>;

    /// Seconds per step.
    fn step_period(&self) -> f64;

    /// Start an absolute move.
    async fn command_move(&mut self, request: MotionRequest) -> AppResult<()>;

    /// Block until the move to `target` has finished.
    async fn settle(&mut self, target: i64) -> AppResult<()>;

    async fn query_position(&mut self) -> AppResult<PositionReply>;

    async fn close(&mut self) -> AppResult<()>;
}

#[async_trait]
impl WobblerDrive for Box<dyn WobblerDrive> {
    async fn open(&mut self) -> AppResult<String> {
        (**self).open().await
    }

    fn step_period(&self) -> f64 {
        (**self).step_period()
    }

    async fn command_move(&mut self, request: MotionRequest) -> AppResult<()> {
        (**self).command_move(request).await
    }

    async fn settle(&mut self, target: i64) -> AppResult<()> {
        (**self).settle(target).await
    }

    async fn query_position(&mut self) -> AppResult<PositionReply> {
        (**self).query_position().await
    }

    async fn close(&mut self) -> AppResult<()> {
        (**self).close().await
    }
}

/// Wobbler controller.
pub struct Wobbler<D> {
    drive: D,
    bounds: MotionBounds,
    last_commanded: Option<i64>,
    connected: bool,
}

impl<D: WobblerDrive> Wobbler<D> {
    pub fn new(drive: D, bounds: MotionBounds) -> Self {
        Self {
            drive,
            bounds,
            last_commanded: None,
            connected: false,
        }
    }

    pub fn drive(&self) -> &D {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut D {
        &mut self.drive
    }

    pub fn bounds(&self) -> &MotionBounds {
        &self.bounds
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_commanded(&self) -> Option<i64> {
        self.last_commanded
    }

    /// Open and home the device, then move to `position` and verify it.
    #[instrument(skip(self), err)]
    pub async fn init(&mut self, position: i64) -> AppResult<String> {
        if self.connected {
            return Err(DaqError::AlreadyConnected);
        }
        self.bounds.request(position, 1.0 / self.drive.step_period())?;
        let identity = self.drive.open().await?;
        self.connected = true;

        let arrived = match self.move_to(position).await {
            Ok(()) => self.wait().await,
            Err(err) => Err(err),
        };
        if let Err(err) = arrived {
            self.connected = false;
            self.last_commanded = None;
            if let Err(close_err) = self.drive.close().await {
                tracing::debug!(error = %close_err, "Closing wobbler after failed init");
            }
            return Err(err);
        }

        tracing::info!(identity = %identity, position, "Wobbler initialized");
        Ok(identity)
    }

    /// Start a move to `position`. Does not wait for it to finish.
    pub async fn move_to(&mut self, position: i64) -> AppResult<()> {
        self.ensure_connected()?;
        let request = self
            .bounds
            .request(position, 1.0 / self.drive.step_period())?;
        self.last_commanded = Some(position);
        self.drive.command_move(request).await
    }

    /// Wait for the last move and check the stage arrived.
    ///
    /// A wrong position is a [`DaqError::MotionMismatch`]. An unusable
    /// readback is taken as arrival at the commanded target and returned as
    /// [`Readback::Substituted`]; this repeats for every consecutive unusable
    /// reply, so a controller that keeps answering with errors is never
    /// actually verified.
    pub async fn wait(&mut self) -> AppResult<Readback<i64>> {
        self.ensure_connected()?;
        let target = self
            .last_commanded
            .ok_or_else(|| DaqError::InvalidState("no wobbler move was commanded".into()))?;
        self.drive.settle(target).await?;

        match self.drive.query_position().await? {
            PositionReply::Reported(reported) if reported == target => {
                Ok(Readback::Reported(reported))
            }
            PositionReply::Reported(reported) => Err(DaqError::MotionMismatch {
                commanded: target,
                reported,
            }),
            PositionReply::Unusable => {
                tracing::warn!(
                    substituted = target,
                    "Wobbler position readback unusable; assuming commanded position"
                );
                Ok(Readback::Substituted(target))
            }
        }
    }

    /// Current position as the controller reports it.
    pub async fn position(&mut self) -> AppResult<Readback<i64>> {
        self.ensure_connected()?;
        match (self.drive.query_position().await?, self.last_commanded) {
            (PositionReply::Reported(p), _) => Ok(Readback::Reported(p)),
            (PositionReply::Unusable, Some(last)) => {
                tracing::warn!(substituted = last, "Wobbler position readback unusable");
                Ok(Readback::Substituted(last))
            }
            (PositionReply::Unusable, None) => Err(DaqError::MalformedFrame(
                "wobbler position readback unusable".into(),
            )),
        }
    }

    /// Oscillation waypoints around the last commanded position.
    pub fn recommended_movements(
        &self,
        integration: Duration,
        legs: usize,
        stride: usize,
    ) -> AppResult<Vec<i64>> {
        self.ensure_connected()?;
        let current = self
            .last_commanded
            .ok_or_else(|| DaqError::InvalidState("wobbler position unknown".into()))?;
        recommended_movements(
            current,
            &self.bounds,
            self.drive.step_period(),
            integration,
            legs,
            stride,
        )
    }

    /// Record `{"Wobbler": {"Position": <last commanded>}}`.
    pub fn set_housekeeping(&self, sink: &mut dyn HousekeepingSink) -> AppResult<()> {
        self.ensure_connected()?;
        sink.record("Wobbler", "Position", json!(self.last_commanded));
        Ok(())
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        self.connected = false;
        self.drive.close().await
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(DaqError::NotConnected)
        }
    }
}

/// Build a wobbler for its configuration.
///
/// Call `init(config.initial_position())` on the result to open and home it.
pub fn build_wobbler(config: &WobblerConfig) -> AppResult<Wobbler<Box<dyn WobblerDrive>>> {
    let open_timeout = Duration::from_secs(2);
    let drive: Box<dyn WobblerDrive> = match config {
        WobblerConfig::Telegram(telegram) => {
            let connector = device_connector(&telegram.device, telegram.baud_rate, open_timeout)?;
            Box::new(TelegramWobbler::new(connector, telegram.address_byte()?))
        }
        WobblerConfig::Ascii(ascii) => {
            let connector = device_connector(&ascii.device, ascii.baud_rate, open_timeout)?;
            Box::new(AsciiWobbler::new(connector, ascii.frequency))
        }
    };
    Ok(Wobbler::new(drive, config.bounds()))
}
