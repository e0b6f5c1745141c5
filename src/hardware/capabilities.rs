//! Caller-facing capabilities.
//!
//! Orchestration code (observation loops, calibration cycles) talks to
//! instruments through these object-safe traits and never sees the wire
//! dialect behind them:
//!
//! - [`Spectrometer`]: `connect` / `run` / `get_data` / `disconnect`
//! - [`crate::chopper::ChopperDrive`] and [`crate::wobbler::WobblerDrive`]
//!   are the device halves of the motion controllers
//!
//! # Example
//!
//! ```rust,ignore
//! async fn calibrate(spec: &mut dyn Spectrometer, chopper: &mut Chopper<impl ChopperDrive>)
//!     -> AppResult<()>
//! {
//!     for (slot, load) in [ChopperPosition::Cold, ChopperPosition::Hot].into_iter().enumerate() {
//!         chopper.set_position(load).await?;
//!         spec.run().await?;
//!         spec.get_data(slot).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::AppResult;
use crate::housekeeping::HousekeepingSink;
use crate::session::SessionState;
use async_trait::async_trait;

/// Capability: Spectrum Acquisition
///
/// # Contract
/// - `connect` fails with `AlreadyConnected` when called twice
/// - `run` arms exactly one integration; a second `run` before `get_data`
///   fails with `InvalidState`
/// - `get_data(slot)` blocks until the armed integration is decoded or the
///   read deadline (twice the integration time) passes
/// - `disconnect` is only allowed while nothing is armed
#[async_trait]
pub trait Spectrometer: Send {
    /// Instrument name used in housekeeping and logs.
    fn name(&self) -> &str;

    fn state(&self) -> SessionState;

    async fn connect(&mut self) -> AppResult<()>;

    async fn run(&mut self) -> AppResult<()>;

    /// Returns a copy of the stored spectrum.
    async fn get_data(&mut self, slot: usize) -> AppResult<Vec<f64>>;

    async fn disconnect(&mut self) -> AppResult<()>;

    fn set_housekeeping(&self, sink: &mut dyn HousekeepingSink) -> AppResult<()>;

    /// Most recent spectrum per slot.
    fn slots(&self) -> &[Vec<f64>];
}

/// A position readback.
///
/// Some controllers occasionally answer a position query with their own
/// error marker although the mechanism is where it was told to go. Callers
/// that patch such answers with the last commanded value return
/// `Substituted`, so the guess stays distinguishable from a real reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readback<T> {
    Reported(T),
    Substituted(T),
}

impl<T> Readback<T> {
    pub fn value(&self) -> &T {
        match self {
            Readback::Reported(v) | Readback::Substituted(v) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Readback::Reported(v) | Readback::Substituted(v) => v,
        }
    }

    pub fn is_substituted(&self) -> bool {
        matches!(self, Readback::Substituted(_))
    }
}
