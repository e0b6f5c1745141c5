//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! session, codec and motion controller. Using the `thiserror` crate, it gives
//! callers one typed failure surface, from socket and configuration issues to
//! protocol and motion faults.
//!
//! ## Error Hierarchy
//!
//! - **Lifecycle**: `AlreadyConnected`, `NotConnected` and `InvalidState` report
//!   calls made in the wrong session state (e.g. arming twice).
//! - **Transport**: `ConnectTimeout`, `ReadTimeout` and `Io` cover sockets and
//!   serial lines. A read that runs out of time is never turned into empty data.
//! - **Framing**: `ChecksumMismatch` and `MalformedFrame` come out of the wire
//!   codecs (see [`crate::codec::FrameError`]).
//! - **Motion**: `OutOfRange`, `MotionMismatch` and `PathUnsafe` guard the
//!   chopper and wobbler against moves that cannot be verified.
//! - **Setup**: `Config` wraps `figment` extraction failures, `Configuration`
//!   reports semantic validation problems, `InvalidParameter` rejects planning
//!   requests and `Instrument` carries device-reported trouble.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out connecting to {target} after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("No complete reply within {0:?}")]
    ReadTimeout(Duration),

    #[error("Checksum mismatch: expected {expected}, received {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Motion mismatch: commanded {commanded}, device reports {reported}")]
    MotionMismatch { commanded: i64, reported: i64 },

    #[error("Refusing to move: {0}")]
    PathUnsafe(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Instrument error: {0}")]
    Instrument(String),
}

impl DaqError {
    /// True for failures caused by the device staying silent.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout(_) | Self::ConnectTimeout { .. })
    }
}
