//! # Radiometer DAQ
//!
//! Session and protocol layer for the instruments of a heterodyne
//! radiometer: the spectrometers that integrate spectra, the chopper that
//! switches between calibration loads and the wobbler that moves the path
//! length mirror.
//!
//! ## Crate Structure
//!
//! - **`codec`**: Wire framing. Fixed-header and length-prefixed binary frames,
//!   newline text, sentinel-delimited ASCII spectra and checksummed telegrams.
//! - **`hardware`**: Transports (TCP, UDP, serial and in-memory), bounded
//!   polling reads and the caller-facing `Spectrometer` capability.
//! - **`session`**: `AcquisitionSession`, the connect / run / get_data /
//!   disconnect state machine shared by every spectrometer dialect.
//! - **`spectrometer`**: The AFFTS, PC104, RCTS104 and SWICTS dialects.
//! - **`chopper`**: Load switching with ring routing, for the serial text
//!   controller and the register-mapped servo.
//! - **`wobbler`**: Bounded linear stage motion and oscillation planning for
//!   the telegram and ASCII controllers.
//! - **`scanner`**: Background worker that keeps polling a slow meter.
//! - **`housekeeping`**: The `{instrument: {metric: value}}` status sink.
//! - **`config`**: Figment-backed TOML and environment configuration.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The `DaqError` enum and `AppResult` alias.

pub mod chopper;
pub mod codec;
pub mod config;
pub mod error;
pub mod hardware;
pub mod housekeeping;
pub mod logging;
pub mod scanner;
pub mod session;
pub mod spectrometer;
pub mod wobbler;

pub use chopper::{build_chopper, Chopper, ChopperDrive, ChopperPosition};
pub use config::DaqConfig;
pub use error::{AppResult, DaqError};
pub use hardware::{Readback, Spectrometer};
pub use housekeeping::{Housekeeping, HousekeepingSink};
pub use session::{AcquisitionSession, SessionConfig, SessionState};
pub use spectrometer::build_spectrometer;
pub use wobbler::{build_wobbler, Wobbler, WobblerDrive};
