//! Loading and validating configuration files.

use radiometer_daq::chopper::build_chopper;
use radiometer_daq::config::{ChopperConfig, DaqConfig, SpectrometerKind, WobblerConfig};
use radiometer_daq::error::DaqError;
use radiometer_daq::wobbler::build_wobbler;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const FULL: &str = r#"
[application]
name = "radiometer"
log_level = "debug"
log_format = "json"

[operations]
integration_time = "1s"
blank_time = "2ms"

[[spectrometers]]
name = "AFFTS"
kind = "affts"
host = "192.168.1.20"
tcp_port = 25144
udp_port = 16210
reverse = true

[[spectrometers.boards]]
channels = 8192
frequency_mhz = [0.0, 1500.0]

[[spectrometers.boards]]
channels = 8192
frequency_mhz = [0.0, 2500.0]

[[spectrometers]]
name = "RCTS"
kind = "rcts104"
host = "192.168.1.21"
tcp_port = 1234
reply_timeout = "800ms"

[[spectrometers.boards]]
channels = 7504
frequency_mhz = [1050.0, 1450.0]

[chopper]
variant = "text"
device = "tcp://192.168.1.30:4001"
antenna_offset = 1200
settle = "250ms"

[wobbler]
variant = "telegram"
device = "tcp://192.168.1.31:4001"
address = "1"
initial_position = 20000
bounds = { min = 100, max = 39000 }
"#;

fn write(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn full_file_loads_with_defaults_filled_in() {
    let file = write(FULL);
    let config = DaqConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_format, "json");
    assert_eq!(config.operations.blank_time, Duration::from_millis(2));
    assert_eq!(config.spectrometers.len(), 2);

    let affts = config.spectrometer("AFFTS").unwrap();
    assert_eq!(affts.kind, SpectrometerKind::Affts);
    assert_eq!(affts.udp_addr().as_deref(), Some("192.168.1.20:16210"));
    assert_eq!(affts.data_storage_containers, 4);
    assert_eq!(affts.connect_timeout, Duration::from_secs(5));

    let rcts = config.spectrometer("RCTS").unwrap();
    assert_eq!(rcts.tcp_addr(), "192.168.1.21:1234");
    assert_eq!(rcts.reply_timeout, Duration::from_millis(800));
    let session = rcts.session_config(&config.operations);
    assert_eq!(session.boards[0].frequency_mhz, [1050.0, 1450.0]);
    assert_eq!(session.blank_time, Duration::from_millis(2));

    match config.chopper.as_ref().unwrap() {
        ChopperConfig::Text(text) => {
            assert_eq!(text.antenna_offset, 1200);
            assert_eq!(text.baud_rate, 115_200);
            assert_eq!(text.resend_after, Duration::from_secs(1));
        }
        other => panic!("unexpected chopper {other:?}"),
    }

    let wobbler = config.wobbler.as_ref().unwrap();
    assert_eq!(wobbler.initial_position(), 20_000);
    assert_eq!(wobbler.bounds().max, 39_000);
    match wobbler {
        WobblerConfig::Telegram(t) => {
            assert_eq!(t.address_byte().unwrap(), b'1');
            assert_eq!(t.baud_rate, 9600);
        }
        other => panic!("unexpected wobbler {other:?}"),
    }
}

#[test]
fn configured_motion_controllers_build_without_connecting() {
    let file = write(FULL);
    let config = DaqConfig::load_from(file.path()).unwrap();

    let chopper = build_chopper(config.chopper.as_ref().unwrap()).unwrap();
    assert!(!chopper.is_connected());

    let wobbler = build_wobbler(config.wobbler.as_ref().unwrap()).unwrap();
    assert!(!wobbler.is_connected());
    assert_eq!(wobbler.bounds().min, 100);
}

#[cfg(not(feature = "tokio_serial"))]
#[test]
fn local_serial_devices_need_the_serial_feature() {
    let file = write(&FULL.replace("tcp://192.168.1.31:4001", "/dev/ttyUSB0"));
    let config = DaqConfig::load_from(file.path()).unwrap();
    assert!(matches!(
        build_wobbler(config.wobbler.as_ref().unwrap()),
        Err(DaqError::Configuration(_))
    ));
}

#[test]
fn semantic_errors_are_reported() {
    let cases = [
        FULL.replace("log_level = \"debug\"", "log_level = \"loud\""),
        FULL.replace("integration_time = \"1s\"", "integration_time = \"6s\""),
        FULL.replace("udp_port = 16210\n", ""),
        FULL.replace("name = \"RCTS\"", "name = \"AFFTS\""),
        FULL.replace("initial_position = 20000", "initial_position = 39000"),
        FULL.replace("address = \"1\"", "address = \"12\""),
    ];
    for contents in cases {
        let file = write(&contents);
        let config = DaqConfig::load_from(file.path()).unwrap();
        assert!(
            matches!(config.validate(), Err(DaqError::Configuration(_))),
            "accepted:\n{contents}"
        );
    }
}

#[test]
fn type_errors_surface_from_figment() {
    let file = write(&FULL.replace("tcp_port = 1234", "tcp_port = \"twelve\""));
    assert!(matches!(
        DaqConfig::load_from(file.path()),
        Err(DaqError::Config(_))
    ));

    let file = write(&FULL.replace("variant = \"text\"", "variant = \"laser\""));
    assert!(DaqConfig::load_from(file.path()).is_err());
}

#[test]
fn environment_overrides_nested_keys() {
    let file = write(FULL);
    std::env::set_var("RADIOMETER_DAQ_APPLICATION__NAME", "override");
    let loaded = DaqConfig::load_from(file.path());
    std::env::remove_var("RADIOMETER_DAQ_APPLICATION__NAME");

    assert_eq!(loaded.unwrap().application.name, "override");
}

#[test]
fn shipped_configuration_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/radiometer.toml");
    let config = DaqConfig::load_from(path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.spectrometers.len(), 2);
    assert!(config.spectrometer("SWICTS").unwrap().reverse);
}
