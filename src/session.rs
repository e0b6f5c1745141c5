//! Acquisition session state machine.
//!
//! One [`AcquisitionSession`] owns one spectrometer connection. The wire
//! dialect is pluggable ([`Dialect`]); the lifecycle rules are written once
//! here:
//!
//! ```text
//! Disconnected --connect--> Configuring --ok--> Ready <--get_data-- Armed
//!      ^                         |                |  \--run-->------^
//!      |                      failure             |
//!      +-------------------------+----disconnect--+
//! ```
//!
//! - `run()` arms exactly one integration; arming again before `get_data()`
//!   is refused so the device cycle counter stays in step with the caller.
//! - `get_data(slot)` drains the armed integration into one of N slots. A
//!   failed read leaves the slot untouched and drops back to `Ready`; nothing
//!   re-arms on its own.
//! - Slots are handed out by copy. A failure never produces a zero vector.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Spectrometer;
use crate::hardware::polling::PollSchedule;
use crate::housekeeping::HousekeepingSink;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::instrument;

/// One detector board.
#[derive(Debug, Clone, PartialEq)]
pub struct Board {
    pub channels: usize,
    /// Lower and upper edge of the band in MHz.
    pub frequency_mhz: [f64; 2],
}

/// Everything a session needs to bring a spectrometer up.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub name: String,
    pub boards: Vec<Board>,
    pub integration_time: Duration,
    pub blank_time: Duration,
    pub data_storage_containers: usize,
    pub reverse: bool,
}

impl SessionConfig {
    /// Single-board configuration with four slots.
    pub fn new(name: impl Into<String>, channels: usize, integration_time: Duration) -> Self {
        Self {
            name: name.into(),
            boards: vec![Board {
                channels,
                frequency_mhz: [0.0, 1500.0],
            }],
            integration_time,
            blank_time: Duration::from_millis(1),
            data_storage_containers: 4,
            reverse: false,
        }
    }

    pub fn with_boards(mut self, boards: Vec<Board>) -> Self {
        self.boards = boards;
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.data_storage_containers = slots;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_blank_time(mut self, blank_time: Duration) -> Self {
        self.blank_time = blank_time;
        self
    }

    /// Integration time in whole milliseconds.
    pub fn integration_ms(&self) -> u64 {
        self.integration_time.as_millis() as u64
    }

    fn check(&self) -> AppResult<()> {
        if self.boards.is_empty() {
            return Err(DaqError::Configuration(format!(
                "{}: at least one board is required",
                self.name
            )));
        }
        if let Some(board) = self.boards.iter().find(|b| b.channels == 0) {
            return Err(DaqError::Configuration(format!(
                "{}: board with {} MHz upper edge has no channels",
                self.name, board.frequency_mhz[1]
            )));
        }
        if self.data_storage_containers == 0 {
            return Err(DaqError::Configuration(format!(
                "{}: at least one data storage container is required",
                self.name
            )));
        }
        Ok(())
    }
}

/// What the device told us while opening.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    /// Channel count reported by the device, replacing the configured boards.
    pub channels: Option<usize>,
    /// Free-form identity (greeting, host, stream).
    pub identity: Option<String>,
}

/// Wire-specific half of a session.
///
/// Implementations own their transport. The session guarantees the call
/// order: `open`, then any number of `arm`/`fetch` pairs, then `close`.
/// `abort` may be called at any point to drop the transport silently.
#[async_trait]
pub trait Dialect: Send {
    /// Short dialect tag used in logs.
    fn kind(&self) -> &'static str;

    /// Open the transport, run the handshake and apply the configuration.
    async fn open(&mut self, config: &SessionConfig) -> AppResult<DeviceInfo>;

    /// Send the arm/trigger command.
    async fn arm(&mut self) -> AppResult<()>;

    /// Wait for and decode one normalized spectrum.
    async fn fetch(&mut self, schedule: PollSchedule) -> AppResult<Vec<f64>>;

    /// Send the optional stop command and release the transport.
    async fn close(&mut self) -> AppResult<()>;

    /// Drop the transport without talking to the device.
    fn abort(&mut self);

    /// Integration time entry as this device family reports it.
    fn integration_entry(&self, config: &SessionConfig) -> (&'static str, Value);
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Configuring,
    Ready,
    Armed,
}

/// Session over one spectrometer.
pub struct AcquisitionSession<D> {
    dialect: D,
    config: SessionConfig,
    state: SessionState,
    channel_counts: Vec<usize>,
    slots: Vec<Vec<f64>>,
    identity: Option<String>,
}

impl<D: Dialect> AcquisitionSession<D> {
    pub fn new(dialect: D, config: SessionConfig) -> Self {
        let channel_counts = config.boards.iter().map(|b| b.channels).collect();
        Self {
            dialect,
            config,
            state: SessionState::Disconnected,
            channel_counts,
            slots: Vec::new(),
            identity: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Channel count per board, as configured or as reported by the device.
    pub fn channel_counts(&self) -> &[usize] {
        &self.channel_counts
    }

    pub fn slots(&self) -> &[Vec<f64>] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&[f64]> {
        self.slots.get(index).map(Vec::as_slice)
    }

    /// Identity string reported during the handshake, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Budget for one data read: twice the integration time.
    pub fn read_schedule(&self) -> PollSchedule {
        PollSchedule::for_integration(self.config.integration_time)
    }

    /// Open the device and allocate zero-filled slots.
    #[instrument(skip(self), fields(name = %self.config.name, dialect = self.dialect.kind()), err)]
    pub async fn connect(&mut self) -> AppResult<()> {
        if self.state != SessionState::Disconnected {
            return Err(DaqError::AlreadyConnected);
        }
        self.config.check()?;

        self.state = SessionState::Configuring;
        let info = match self.dialect.open(&self.config).await {
            Ok(info) => info,
            Err(err) => {
                self.dialect.abort();
                self.state = SessionState::Disconnected;
                return Err(err);
            }
        };

        if let Some(channels) = info.channels {
            self.channel_counts = vec![channels];
        }
        self.identity = info.identity;

        let width = self.channel_counts[0];
        self.slots = vec![vec![0.0; width]; self.config.data_storage_containers];
        self.state = SessionState::Ready;
        tracing::info!(
            channels = ?self.channel_counts,
            slots = self.slots.len(),
            "Spectrometer configured"
        );
        Ok(())
    }

    /// Arm one integration.
    pub async fn run(&mut self) -> AppResult<()> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Armed => {
                return Err(DaqError::InvalidState(
                    "an acquisition is already armed; call get_data first".into(),
                ))
            }
            SessionState::Disconnected | SessionState::Configuring => {
                return Err(DaqError::NotConnected)
            }
        }
        self.dialect.arm().await?;
        self.state = SessionState::Armed;
        tracing::debug!(name = %self.config.name, "Armed");
        Ok(())
    }

    /// Drain the armed integration into `slot` and return a copy of it.
    #[instrument(skip(self), fields(name = %self.config.name), err)]
    pub async fn get_data(&mut self, slot: usize) -> AppResult<Vec<f64>> {
        match self.state {
            SessionState::Disconnected | SessionState::Configuring => {
                return Err(DaqError::NotConnected)
            }
            SessionState::Ready | SessionState::Armed => {}
        }
        if slot >= self.slots.len() {
            return Err(DaqError::OutOfRange(format!(
                "slot {slot} of {}",
                self.slots.len()
            )));
        }
        if self.state != SessionState::Armed {
            return Err(DaqError::InvalidState(
                "get_data called without a preceding run".into(),
            ));
        }

        let schedule = self.read_schedule();
        let fetched = self.dialect.fetch(schedule).await;
        self.state = SessionState::Ready;
        let mut values = fetched?;

        if self.config.reverse {
            values.reverse();
        }
        if values.len() != self.slots[slot].len() {
            tracing::debug!(
                received = values.len(),
                previous = self.slots[slot].len(),
                "Spectrum length differs from slot"
            );
        }
        self.slots[slot].clone_from(&values);
        Ok(values)
    }

    /// Stop the device and release the connection.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Armed => {
                return Err(DaqError::InvalidState(
                    "cannot disconnect with an armed acquisition; call get_data first".into(),
                ))
            }
            SessionState::Disconnected | SessionState::Configuring => {
                return Err(DaqError::NotConnected)
            }
        }
        let closed = self.dialect.close().await;
        self.state = SessionState::Disconnected;
        self.slots.clear();
        tracing::info!(name = %self.config.name, "Spectrometer disconnected");
        closed
    }

    /// Report frequency, channel and integration entries.
    pub fn set_housekeeping(&self, sink: &mut dyn HousekeepingSink) -> AppResult<()> {
        if matches!(
            self.state,
            SessionState::Disconnected | SessionState::Configuring
        ) {
            return Err(DaqError::NotConnected);
        }
        let name = &self.config.name;
        let bands: Vec<[f64; 2]> = self.config.boards.iter().map(|b| b.frequency_mhz).collect();
        sink.record(name, "Frequency [MHz]", json!(bands));
        sink.record(name, "Channels [#]", json!(self.channel_counts));
        let (metric, value) = self.dialect.integration_entry(&self.config);
        sink.record(name, metric, value);
        Ok(())
    }
}

#[async_trait]
impl<D: Dialect> Spectrometer for AcquisitionSession<D> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self) -> AppResult<()> {
        AcquisitionSession::connect(self).await
    }

    async fn run(&mut self) -> AppResult<()> {
        AcquisitionSession::run(self).await
    }

    async fn get_data(&mut self, slot: usize) -> AppResult<Vec<f64>> {
        AcquisitionSession::get_data(self, slot).await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        AcquisitionSession::disconnect(self).await
    }

    fn set_housekeeping(&self, sink: &mut dyn HousekeepingSink) -> AppResult<()> {
        AcquisitionSession::set_housekeeping(self, sink)
    }

    fn slots(&self) -> &[Vec<f64>] {
        &self.slots
    }
}
