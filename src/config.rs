//! Configuration loading with Figment.
//!
//! Configuration is read from a TOML file and merged with environment
//! variables prefixed `RADIOMETER_DAQ_`. Nested keys are separated by a double
//! underscore, so `RADIOMETER_DAQ_APPLICATION__LOG_LEVEL=debug` overrides
//! `[application] log_level`.
//!
//! Durations are human readable (`"500ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use radiometer_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load_from("config/radiometer.toml")?;
//! config.validate()?;
//! for spectrometer in &config.spectrometers {
//!     println!("{} on {}", spectrometer.name, spectrometer.tcp_addr());
//! }
//! # Ok::<(), radiometer_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::session::{Board, SessionConfig};
use crate::spectrometer::affts;
use crate::wobbler::MotionBounds;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "RADIOMETER_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub spectrometers: Vec<SpectrometerConfig>,
    #[serde(default)]
    pub chopper: Option<ChopperConfig>,
    #[serde(default)]
    pub wobbler: Option<WobblerConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Shared timing of one observation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(with = "humantime_serde", default = "default_integration_time")]
    pub integration_time: Duration,
    #[serde(with = "humantime_serde", default = "default_blank_time")]
    pub blank_time: Duration,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            integration_time: default_integration_time(),
            blank_time: default_blank_time(),
        }
    }
}

// =============================================================================
// Spectrometers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectrometerKind {
    Affts,
    Pc104,
    Rcts104,
    Swicts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub channels: usize,
    /// Lower and upper band edge in MHz.
    #[serde(default = "default_band")]
    pub frequency_mhz: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrometerConfig {
    pub name: String,
    pub kind: SpectrometerKind,
    pub host: String,
    pub tcp_port: u16,
    /// Command port, AFFTS only.
    #[serde(default)]
    pub udp_port: Option<u16>,
    pub boards: Vec<BoardConfig>,
    #[serde(default = "default_containers")]
    pub data_storage_containers: usize,
    #[serde(default)]
    pub reverse: bool,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reply_timeout")]
    pub reply_timeout: Duration,
}

impl SpectrometerConfig {
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    pub fn udp_addr(&self) -> Option<String> {
        self.udp_port.map(|port| format!("{}:{port}", self.host))
    }

    /// Session parameters for this spectrometer.
    pub fn session_config(&self, operations: &OperationsConfig) -> SessionConfig {
        SessionConfig {
            name: self.name.clone(),
            boards: self
                .boards
                .iter()
                .map(|b| Board {
                    channels: b.channels,
                    frequency_mhz: b.frequency_mhz,
                })
                .collect(),
            integration_time: operations.integration_time,
            blank_time: operations.blank_time,
            data_storage_containers: self.data_storage_containers,
            reverse: self.reverse,
        }
    }
}

// =============================================================================
// Motion
// =============================================================================

/// Chopper variant and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "lowercase")]
pub enum ChopperConfig {
    Text(TextChopperConfig),
    Servo(ServoChopperConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChopperConfig {
    /// Serial device path, or `tcp://host:port` for a serial server.
    pub device: String,
    #[serde(default = "default_chopper_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_antenna_offset")]
    pub antenna_offset: i64,
    #[serde(with = "humantime_serde", default)]
    pub settle: Duration,
    #[serde(with = "humantime_serde", default = "default_resend_after")]
    pub resend_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoChopperConfig {
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_tolerance")]
    pub tolerance_deg: f64,
    #[serde(with = "humantime_serde", default = "default_reply_timeout")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_motion_timeout")]
    pub motion_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub settle: Duration,
}

/// Wobbler variant and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "lowercase")]
pub enum WobblerConfig {
    Telegram(TelegramWobblerConfig),
    Ascii(AsciiWobblerConfig),
}

impl WobblerConfig {
    pub fn bounds(&self) -> MotionBounds {
        match self {
            WobblerConfig::Telegram(c) => c.bounds,
            WobblerConfig::Ascii(c) => c.bounds,
        }
    }

    /// Position to move to during `init`.
    pub fn initial_position(&self) -> i64 {
        match self {
            WobblerConfig::Telegram(c) => c.initial_position,
            WobblerConfig::Ascii(c) => c.initial_position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramWobblerConfig {
    pub device: String,
    #[serde(default = "default_telegram_baud")]
    pub baud_rate: u32,
    /// Single-character bus address.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub bounds: MotionBounds,
    pub initial_position: i64,
}

impl TelegramWobblerConfig {
    /// The bus address byte.
    pub fn address_byte(&self) -> AppResult<u8> {
        match self.address.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(DaqError::Configuration(format!(
                "wobbler address must be a single character, got {:?}",
                self.address
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsciiWobblerConfig {
    pub device: String,
    #[serde(default = "default_chopper_baud")]
    pub baud_rate: u32,
    #[serde(default)]
    pub bounds: MotionBounds,
    pub initial_position: i64,
    #[serde(default = "default_wobbler_frequency")]
    pub frequency: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_integration_time() -> Duration {
    Duration::from_secs(1)
}

fn default_blank_time() -> Duration {
    Duration::from_millis(1)
}

fn default_band() -> [f64; 2] {
    [0.0, 1500.0]
}

fn default_containers() -> usize {
    4
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_motion_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_resend_after() -> Duration {
    Duration::from_secs(1)
}

fn default_chopper_baud() -> u32 {
    115_200
}

fn default_telegram_baud() -> u32 {
    9600
}

fn default_antenna_offset() -> i64 {
    1000
}

fn default_http_port() -> u16 {
    80
}

fn default_tolerance() -> f64 {
    0.5
}

fn default_address() -> String {
    "0".to_string()
}

fn default_wobbler_frequency() -> u32 {
    2000
}

impl DaqConfig {
    /// Load from `config/radiometer.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/radiometer.toml")
    }

    /// Load from a specific file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.operations.integration_time.is_zero() {
            return invalid("integration_time must be positive".into());
        }

        let mut names = HashSet::new();
        for spec in &self.spectrometers {
            if !names.insert(&spec.name) {
                return invalid(format!("Duplicate spectrometer name: {}", spec.name));
            }
            if spec.boards.is_empty() {
                return invalid(format!("{}: at least one board is required", spec.name));
            }
            if spec.boards.iter().any(|b| b.channels == 0) {
                return invalid(format!("{}: every board needs channels", spec.name));
            }
            if spec.data_storage_containers == 0 {
                return invalid(format!(
                    "{}: at least one data storage container is required",
                    spec.name
                ));
            }
            if spec.kind == SpectrometerKind::Affts {
                if self.operations.integration_time > affts::MAX_INTEGRATION {
                    return invalid(format!(
                        "{}: AFFTS integration time is limited to {:?}",
                        spec.name, affts::MAX_INTEGRATION
                    ));
                }
                if spec.boards.iter().any(|b| b.frequency_mhz[0] != 0.0) {
                    return invalid(format!("{}: AFFTS bands must start at 0 MHz", spec.name));
                }
                if spec.udp_port.is_none() {
                    return invalid(format!("{}: AFFTS needs a udp_port", spec.name));
                }
            }
        }

        if let Some(ChopperConfig::Servo(servo)) = &self.chopper {
            if !(servo.tolerance_deg > 0.0 && servo.tolerance_deg < 45.0) {
                return invalid(format!(
                    "chopper tolerance {} deg out of range",
                    servo.tolerance_deg
                ));
            }
        }

        if let Some(wobbler) = &self.wobbler {
            let bounds = wobbler.bounds();
            if bounds.min >= bounds.max {
                return invalid(format!(
                    "wobbler bounds ({}, {}) are empty",
                    bounds.min, bounds.max
                ));
            }
            if !bounds.contains(wobbler.initial_position()) {
                return invalid(format!(
                    "wobbler initial position {} outside ({}, {})",
                    wobbler.initial_position(),
                    bounds.min,
                    bounds.max
                ));
            }
            match wobbler {
                WobblerConfig::Telegram(telegram) => {
                    telegram.address_byte()?;
                }
                WobblerConfig::Ascii(ascii) if ascii.frequency == 0 => {
                    return invalid("wobbler frequency must be positive".into());
                }
                WobblerConfig::Ascii(_) => {}
            }
        }

        Ok(())
    }

    pub fn spectrometer(&self, name: &str) -> Option<&SpectrometerConfig> {
        self.spectrometers.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DaqConfig {
        DaqConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
            },
            operations: OperationsConfig::default(),
            spectrometers: vec![SpectrometerConfig {
                name: "AFFTS".to_string(),
                kind: SpectrometerKind::Affts,
                host: "localhost".to_string(),
                tcp_port: 25144,
                udp_port: Some(16210),
                boards: vec![BoardConfig {
                    channels: 8192,
                    frequency_mhz: [0.0, 1500.0],
                }],
                data_storage_containers: 4,
                reverse: false,
                connect_timeout: default_connect_timeout(),
                reply_timeout: default_reply_timeout(),
            }],
            chopper: None,
            wobbler: None,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_spectrometer_names() {
        let mut config = minimal();
        config.spectrometers.push(config.spectrometers[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_affts_limits() {
        let mut config = minimal();
        config.operations.integration_time = affts::MAX_INTEGRATION;
        assert!(config.validate().is_ok());
        config.operations.integration_time = affts::MAX_INTEGRATION + Duration::from_millis(1);
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.spectrometers[0].boards[0].frequency_mhz = [100.0, 1500.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wobbler_checks() {
        let mut config = minimal();
        config.wobbler = Some(WobblerConfig::Telegram(TelegramWobblerConfig {
            device: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
            address: "01".to_string(),
            bounds: MotionBounds::default(),
            initial_position: 20_000,
        }));
        assert!(config.validate().is_err());

        if let Some(WobblerConfig::Telegram(t)) = config.wobbler.as_mut() {
            t.address = "0".to_string();
            t.initial_position = 40_000;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_mapping() {
        let config = minimal();
        let session = config.spectrometers[0].session_config(&config.operations);
        assert_eq!(session.boards[0].channels, 8192);
        assert_eq!(session.integration_time, Duration::from_secs(1));
        assert_eq!(config.spectrometers[0].udp_addr().as_deref(), Some("localhost:16210"));
    }
}
