//! Chopper control.
//!
//! A chopper points the optical path at one of four loads. [`Chopper`] holds
//! the motion rules; the device half is a [`ChopperDrive`]:
//!
//! - [`TextChopper`]: serial controller stepping between neighbouring
//!   positions, driven through a waypoint route
//! - [`NanotecChopper`]: register-mapped servo moving straight to an angle
//!
//! A stepping controller must never be moved while it reports its error
//! state: nobody knows where it is, and walking waypoints from the wrong
//! start could sweep the mirror through the wrong loads.

pub mod route;
pub mod servo;
pub mod text;

pub use route::{
    circular_distance, classify_angle, plan_route, ChopperPosition, PositionReading,
    PositionTable, CYCLE,
};
pub use servo::{HttpRegisterClient, NanotecChopper, RegisterClient};
pub use text::TextChopper;

use crate::config::ChopperConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Readback;
use crate::hardware::transport::{device_connector, TcpConnector};
use crate::housekeeping::HousekeepingSink;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::instrument;

/// Default antenna offset sent with the final `A` command.
pub const DEFAULT_ANTENNA_OFFSET: i64 = 1000;

/// How a drive gets from one position to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// One command per neighbouring position along the ring.
    Waypoints,
    /// Straight to the target; the drive guarantees the path.
    Direct,
}

/// Device half of a chopper.
#[async_trait]
pub trait ChopperDrive: Send {
    fn routing(&self) -> Routing;

    /// Open the device and return its greeting.
    async fn open(&mut self) -> AppResult<String>;

    async fn read_position(&mut self) -> AppResult<PositionReading>;

    /// Move to `target` and return once the device accepted the move.
    ///
    /// `antenna_offset` is only set on the final antenna command of a route.
    async fn drive_to(
        &mut self,
        target: ChopperPosition,
        antenna_offset: Option<i64>,
    ) -> AppResult<()>;

    async fn close(&mut self) -> AppResult<()>;
}

#[async_trait]
impl ChopperDrive for Box<dyn ChopperDrive> {
    fn routing(&self) -> Routing {
        (**self).routing()
    }

    async fn open(&mut self) -> AppResult<String> {
        (**self).open().await
    }

    async fn read_position(&mut self) -> AppResult<PositionReading> {
        (**self).read_position().await
    }

    async fn drive_to(
        &mut self,
        target: ChopperPosition,
        antenna_offset: Option<i64>,
    ) -> AppResult<()> {
        (**self).drive_to(target, antenna_offset).await
    }

    async fn close(&mut self) -> AppResult<()> {
        (**self).close().await
    }
}

/// Chopper controller.
pub struct Chopper<D> {
    drive: D,
    settle: Duration,
    antenna_offset: i64,
    last_commanded: Option<ChopperPosition>,
    connected: bool,
}

impl<D: ChopperDrive> Chopper<D> {
    pub fn new(drive: D) -> Self {
        Self {
            drive,
            settle: Duration::ZERO,
            antenna_offset: DEFAULT_ANTENNA_OFFSET,
            last_commanded: None,
            connected: false,
        }
    }

    /// Pause after every waypoint.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_antenna_offset(mut self, offset: i64) -> Self {
        self.antenna_offset = offset;
        self
    }

    pub fn drive(&self) -> &D {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut D {
        &mut self.drive
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Position of the most recent accepted move command.
    pub fn last_commanded(&self) -> Option<ChopperPosition> {
        self.last_commanded
    }

    /// Open the controller and return its greeting.
    #[instrument(skip(self), err)]
    pub async fn init(&mut self) -> AppResult<String> {
        if self.connected {
            return Err(DaqError::AlreadyConnected);
        }
        let greeting = self.drive.open().await?;
        self.connected = true;
        tracing::info!(greeting = %greeting, "Chopper initialized");
        Ok(greeting)
    }

    /// Query the current position.
    ///
    /// A stepping controller that reports its error state after we commanded
    /// a position gets the benefit of the doubt: the last commanded position
    /// is returned as [`Readback::Substituted`] and a warning is logged. With
    /// nothing commanded yet the error reading is returned as is.
    pub async fn position(&mut self) -> AppResult<Readback<PositionReading>> {
        self.ensure_connected()?;
        let reading = self.drive.read_position().await?;
        match (reading, self.last_commanded, self.drive.routing()) {
            (PositionReading::Error, Some(last), Routing::Waypoints) => {
                tracing::warn!(
                    substituted = %last,
                    "Chopper reported its error state; assuming last commanded position"
                );
                Ok(Readback::Substituted(PositionReading::At(last)))
            }
            _ => Ok(Readback::Reported(reading)),
        }
    }

    /// Move to `target`, using the configured antenna offset.
    pub async fn set_position(&mut self, target: ChopperPosition) -> AppResult<()> {
        self.move_to(target, self.antenna_offset).await
    }

    pub async fn set_cold(&mut self) -> AppResult<()> {
        self.set_position(ChopperPosition::Cold).await
    }

    pub async fn set_hot(&mut self) -> AppResult<()> {
        self.set_position(ChopperPosition::Hot).await
    }

    pub async fn set_reference(&mut self) -> AppResult<()> {
        self.set_position(ChopperPosition::Reference).await
    }

    /// Point at the sky, optionally with a non-default offset.
    pub async fn set_antenna(&mut self, offset: Option<i64>) -> AppResult<()> {
        self.move_to(
            ChopperPosition::Antenna,
            offset.unwrap_or(self.antenna_offset),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn move_to(&mut self, target: ChopperPosition, antenna_offset: i64) -> AppResult<()> {
        self.ensure_connected()?;
        let offset_for = |p: ChopperPosition| (p == ChopperPosition::Antenna).then_some(antenna_offset);

        match self.drive.routing() {
            Routing::Direct => {
                self.drive.drive_to(target, offset_for(target)).await?;
                self.last_commanded = Some(target);
                tokio::time::sleep(self.settle).await;
            }
            Routing::Waypoints => {
                let current = match self.position().await?.into_value() {
                    PositionReading::At(p) => p,
                    PositionReading::Error => {
                        return Err(DaqError::PathUnsafe(
                            "chopper reports its error state; reset the controller".into(),
                        ))
                    }
                };
                let route = plan_route(current, target);
                tracing::debug!(from = %current, route = ?route, "Chopper route");
                let last = route.len().saturating_sub(1);
                for (k, &waypoint) in route.iter().enumerate() {
                    let offset = if k == last { offset_for(waypoint) } else { None };
                    self.last_commanded = Some(waypoint);
                    self.drive.drive_to(waypoint, offset).await?;
                    tokio::time::sleep(self.settle).await;
                }
            }
        }
        Ok(())
    }

    /// Record `{"Chopper": {"Position": "<code>"}}`.
    pub async fn set_housekeeping(&mut self, sink: &mut dyn HousekeepingSink) -> AppResult<()> {
        let reading = self.position().await?.into_value();
        sink.record("Chopper", "Position", json!(reading.code().to_string()));
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

/// Build a chopper for its configuration.
///
/// Nothing is opened until `init()` is called on the result.
pub fn build_chopper(config: &ChopperConfig) -> AppResult<Chopper<Box<dyn ChopperDrive>>> {
    let chopper = match config {
        ChopperConfig::Text(text) => {
            let connector = device_connector(&text.device, text.baud_rate, text.resend_after)?;
            let drive: Box<dyn ChopperDrive> =
                Box::new(TextChopper::new(connector).with_retry(text.resend_after, 5));
            Chopper::new(drive)
                .with_settle(text.settle)
                .with_antenna_offset(text.antenna_offset)
        }
        ChopperConfig::Servo(servo) => {
            let connector = TcpConnector::new(
                format!("{}:{}", servo.host, servo.port),
                servo.request_timeout,
            );
            let client = HttpRegisterClient::new(Box::new(connector), servo.request_timeout);
            let drive: Box<dyn ChopperDrive> = Box::new(
                NanotecChopper::new(client)
                    .with_tolerance(servo.tolerance_deg)
                    .with_motion_timeout(servo.motion_timeout),
            );
            Chopper::new(drive).with_settle(servo.settle)
        }
    };
    Ok(chopper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::housekeeping::Housekeeping;
    use ChopperPosition::*;

    /// Drive that records every command and answers from a script.
    struct Recorder {
        routing: Routing,
        at: PositionReading,
        answers: Vec<PositionReading>,
        commands: Vec<(ChopperPosition, Option<i64>)>,
    }

    impl Recorder {
        fn at(routing: Routing, at: PositionReading) -> Self {
            Self {
                routing,
                at,
                answers: Vec::new(),
                commands: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ChopperDrive for Recorder {
        fn routing(&self) -> Routing {
            self.routing
        }

        async fn open(&mut self) -> AppResult<String> {
            Ok("recorder".into())
        }

        async fn read_position(&mut self) -> AppResult<PositionReading> {
            Ok(if self.answers.is_empty() {
                self.at
            } else {
                self.answers.remove(0)
            })
        }

        async fn drive_to(&mut self, target: ChopperPosition, offset: Option<i64>) -> AppResult<()> {
            self.commands.push((target, offset));
            self.at = PositionReading::At(target);
            Ok(())
        }

        async fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    async fn ready(drive: Recorder) -> Chopper<Recorder> {
        let mut chopper = Chopper::new(drive);
        chopper.init().await.unwrap();
        chopper
    }

    #[tokio::test]
    async fn waypoints_end_with_antenna_offset() {
        let mut chopper = ready(Recorder::at(Routing::Waypoints, PositionReading::At(Cold))).await;
        chopper.set_antenna(Some(250)).await.unwrap();
        assert_eq!(
            chopper.drive().commands,
            vec![(Hot, None), (Antenna, Some(250))]
        );
        assert_eq!(chopper.last_commanded(), Some(Antenna));
    }

    #[tokio::test]
    async fn antenna_again_only_resends_offset() {
        let mut chopper =
            ready(Recorder::at(Routing::Waypoints, PositionReading::At(Antenna))).await;
        chopper.set_antenna(None).await.unwrap();
        assert_eq!(
            chopper.drive().commands,
            vec![(Antenna, Some(DEFAULT_ANTENNA_OFFSET))]
        );
    }

    #[tokio::test]
    async fn error_state_without_history_refuses_to_move() {
        let mut chopper = ready(Recorder::at(Routing::Waypoints, PositionReading::Error)).await;
        assert!(matches!(chopper.set_hot().await, Err(DaqError::PathUnsafe(_))));
        assert!(chopper.drive().commands.is_empty());
    }

    #[tokio::test]
    async fn error_state_after_a_move_substitutes_last_command() {
        let mut chopper = ready(Recorder::at(Routing::Waypoints, PositionReading::At(Reference))).await;
        chopper.set_cold().await.unwrap();
        chopper.drive_mut().at = PositionReading::Error;

        let readback = chopper.position().await.unwrap();
        assert_eq!(readback, Readback::Substituted(PositionReading::At(Cold)));
        chopper.set_reference().await.unwrap();
        assert_eq!(chopper.drive().commands.last(), Some(&(Reference, None)));
    }

    #[tokio::test]
    async fn direct_drives_skip_the_route() {
        let mut chopper = ready(Recorder::at(Routing::Direct, PositionReading::Error)).await;
        chopper.set_hot().await.unwrap();
        assert_eq!(chopper.drive().commands, vec![(Hot, None)]);

        chopper.drive_mut().at = PositionReading::Error;
        let readback = chopper.position().await.unwrap();
        assert_eq!(readback, Readback::Reported(PositionReading::Error));
    }

    #[tokio::test]
    async fn housekeeping_reports_position_code() {
        let mut chopper = ready(Recorder::at(Routing::Waypoints, PositionReading::At(Hot))).await;
        let mut hk = Housekeeping::new();
        chopper.set_housekeeping(&mut hk).await.unwrap();
        assert_eq!(hk.get("Chopper", "Position"), Some(&json!("H")));
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let mut chopper = Chopper::new(Recorder::at(Routing::Waypoints, PositionReading::At(Hot)));
        assert!(matches!(chopper.set_cold().await, Err(DaqError::NotConnected)));
        chopper.init().await.unwrap();
        assert!(matches!(chopper.init().await, Err(DaqError::AlreadyConnected)));
        chopper.close().await.unwrap();
        assert!(matches!(chopper.close().await, Err(DaqError::NotConnected)));
    }
}
