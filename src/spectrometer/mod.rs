//! Spectrometer dialects.
//!
//! Each backend implements [`Dialect`] and runs inside the shared
//! [`AcquisitionSession`] state machine:
//!
//! | backend    | transport         | codec                        |
//! |------------|-------------------|------------------------------|
//! | [`Affts`]  | UDP cmd + TCP data| fixed-header binary          |
//! | [`Pc104`]  | TCP               | length-prefixed binary       |
//! | [`Rcts104`]| TCP               | ASCII sentinel (braced/swap) |
//! | [`Swicts`] | TCP               | ASCII sentinel (binary block)|

pub mod affts;
pub mod pc104;
pub mod rcts104;
pub mod swicts;

pub use affts::Affts;
pub use pc104::Pc104;
pub use rcts104::Rcts104;
pub use swicts::Swicts;

use crate::config::{OperationsConfig, SpectrometerConfig, SpectrometerKind};
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::Link;
use crate::hardware::transport::{TcpConnector, UdpConnector};
use crate::hardware::Spectrometer;
use crate::session::{AcquisitionSession, Dialect, SessionConfig};
use std::time::Duration;

/// Settle delays and reply budgets used during handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectTiming {
    /// Pause between consecutive configuration commands.
    pub command_gap: Duration,
    /// Pause after the `configure` command.
    pub configure_settle: Duration,
    /// Pause after ADC calibration before the device accepts a run.
    pub calibration_settle: Duration,
    /// Budget for one command reply or greeting.
    pub reply_timeout: Duration,
    /// Window for discarding stale input before arming.
    pub drain_window: Duration,
}

impl Default for DialectTiming {
    fn default() -> Self {
        Self {
            command_gap: Duration::from_millis(100),
            configure_settle: Duration::from_millis(300),
            calibration_settle: Duration::from_secs(3),
            reply_timeout: Duration::from_secs(5),
            drain_window: Duration::from_millis(20),
        }
    }
}

fn link_mut(link: &mut Option<Link>) -> AppResult<&mut Link> {
    link.as_mut().ok_or(DaqError::NotConnected)
}

/// Format a band edge the way the devices expect it: no decimals when whole.
pub(crate) fn format_mhz(mhz: f64) -> String {
    if mhz.fract() == 0.0 {
        format!("{mhz:.0}")
    } else {
        format!("{mhz}")
    }
}

/// Build a session for a configured spectrometer.
///
/// Nothing is dialed until `connect()` is called on the result.
pub fn build_spectrometer(
    config: &SpectrometerConfig,
    operations: &OperationsConfig,
) -> AppResult<Box<dyn Spectrometer>> {
    let session_config = config.session_config(operations);
    let data = TcpConnector::new(config.tcp_addr(), config.connect_timeout);
    let timing = DialectTiming {
        reply_timeout: config.reply_timeout,
        ..DialectTiming::default()
    };

    let spectrometer: Box<dyn Spectrometer> = match config.kind {
        SpectrometerKind::Affts => {
            let udp = config.udp_addr().ok_or_else(|| {
                DaqError::Configuration(format!("{}: AFFTS needs a udp_port", config.name))
            })?;
            boxed(
                Affts::new(Box::new(data), Box::new(UdpConnector::new(udp))).with_timing(timing),
                session_config,
            )
        }
        SpectrometerKind::Pc104 => boxed(Pc104::new(Box::new(data)).with_timing(timing), session_config),
        SpectrometerKind::Rcts104 => {
            boxed(Rcts104::new(Box::new(data)).with_timing(timing), session_config)
        }
        SpectrometerKind::Swicts => {
            boxed(Swicts::new(Box::new(data)).with_timing(timing), session_config)
        }
    };
    tracing::debug!(name = %config.name, kind = ?config.kind, "Spectrometer session built");
    Ok(spectrometer)
}

fn boxed<D: Dialect + 'static>(dialect: D, config: SessionConfig) -> Box<dyn Spectrometer> {
    Box::new(AcquisitionSession::new(dialect, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges_drop_trailing_zeroes() {
        assert_eq!(format_mhz(1500.0), "1500");
        assert_eq!(format_mhz(812.5), "812.5");
    }
}
