//! Sessions built from configuration and driven through the `Spectrometer`
//! capability over real sockets.

use radiometer_daq::codec::LengthPrefixedFrame;
use radiometer_daq::config::{BoardConfig, DaqConfig, SpectrometerConfig, SpectrometerKind};
use radiometer_daq::error::DaqError;
use radiometer_daq::housekeeping::Housekeeping;
use radiometer_daq::session::SessionState;
use radiometer_daq::spectrometer::build_spectrometer;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_command(stream: &mut TcpStream) -> String {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    String::from_utf8(body).unwrap()
}

fn frame(counts: Vec<u32>, sum_counter: i32) -> Vec<u8> {
    LengthPrefixedFrame {
        magic: "CTS".into(),
        sum_counter,
        counts,
        ..Default::default()
    }
    .to_bytes()
    .to_vec()
}

fn write_config(port: u16) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[application]
name = "lab"

[operations]
integration_time = "100ms"

[[spectrometers]]
name = "PC104"
kind = "pc104"
host = "127.0.0.1"
tcp_port = {port}
data_storage_containers = 2
connect_timeout = "1s"
reply_timeout = "1s"

[[spectrometers.boards]]
channels = 2
frequency_mhz = [0.0, 40.0]
"#
    )
    .unwrap();
    file
}

#[tokio::test]
async fn configured_pc104_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let device = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(read_command(&mut stream).await, "MAIN");
        assert_eq!(read_command(&mut stream).await, "INIT\0");
        stream.write_all(&frame(vec![0, 0], 1)).await.unwrap();
        stream.write_all(&frame(vec![0, 0], 1)).await.unwrap();
        assert_eq!(read_command(&mut stream).await, "TIME \"100\"\0");
        assert_eq!(read_command(&mut stream).await, "RUN\0");
        stream.write_all(&frame(vec![6, 9], 3)).await.unwrap();
        // hold the socket until the client hangs up
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let file = write_config(port);
    let config = DaqConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    let mut spectrometer =
        build_spectrometer(&config.spectrometers[0], &config.operations).unwrap();
    assert_eq!(spectrometer.name(), "PC104");
    assert_eq!(spectrometer.state(), SessionState::Disconnected);

    spectrometer.connect().await.unwrap();
    assert_eq!(spectrometer.slots().len(), 2);
    assert!(matches!(
        spectrometer.connect().await,
        Err(DaqError::AlreadyConnected)
    ));

    spectrometer.run().await.unwrap();
    assert!(matches!(
        spectrometer.disconnect().await,
        Err(DaqError::InvalidState(_))
    ));
    assert_eq!(spectrometer.get_data(1).await.unwrap(), vec![2.0, 3.0]);
    assert_eq!(spectrometer.slots()[1], vec![2.0, 3.0]);

    let mut hk = Housekeeping::new();
    spectrometer.set_housekeeping(&mut hk).unwrap();
    assert!(hk.instrument("PC104").is_some());

    spectrometer.disconnect().await.unwrap();
    assert!(spectrometer.slots().is_empty());
    device.await.unwrap();
}

#[tokio::test]
async fn refused_connection_leaves_session_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let file = write_config(port);
    let config = DaqConfig::load_from(file.path()).unwrap();
    let mut spectrometer =
        build_spectrometer(&config.spectrometers[0], &config.operations).unwrap();

    assert!(matches!(spectrometer.connect().await, Err(DaqError::Io(_))));
    assert_eq!(spectrometer.state(), SessionState::Disconnected);
    assert!(matches!(spectrometer.run().await, Err(DaqError::NotConnected)));
}

#[test]
fn affts_without_command_port_is_rejected() {
    let config = SpectrometerConfig {
        name: "AFFTS".into(),
        kind: SpectrometerKind::Affts,
        host: "localhost".into(),
        tcp_port: 25144,
        udp_port: None,
        boards: vec![BoardConfig {
            channels: 8192,
            frequency_mhz: [0.0, 1500.0],
        }],
        data_storage_containers: 4,
        reverse: false,
        connect_timeout: Duration::from_secs(1),
        reply_timeout: Duration::from_secs(1),
    };
    let operations = Default::default();
    assert!(matches!(
        build_spectrometer(&config, &operations),
        Err(DaqError::Configuration(_))
    ));
}
