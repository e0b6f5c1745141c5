//! Chopper routing against a scripted text controller.

mod common;

use common::mock_connector;
use radiometer_daq::chopper::{
    build_chopper, Chopper, ChopperPosition, PositionReading, TextChopper,
};
use radiometer_daq::config::{ChopperConfig, TextChopperConfig};
use radiometer_daq::error::DaqError;
use radiometer_daq::hardware::Readback;
use radiometer_daq::housekeeping::Housekeeping;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
async fn steps_through_neighbours_with_offset_on_last_step() {
    let (connector, mut device) = mock_connector("chopper");
    let mut chopper = Chopper::new(TextChopper::new(connector)).with_settle(Duration::from_millis(250));

    let script = tokio::spawn(async move {
        device.expect_line("G").await;
        device.send("Chopper v2\r\n");
        device.expect_line("?").await;
        device.send("C\r\n");
        device.expect_line("H").await;
        device.send("H\r\n");
        device.expect_line("A1000").await;
        device.send("A\r\n");
        device.expect_line("?").await;
        device.send("A\r\n");
        device
    });

    assert_eq!(chopper.init().await.unwrap(), "Chopper v2");
    chopper.set_antenna(None).await.unwrap();
    assert_eq!(chopper.last_commanded(), Some(ChopperPosition::Antenna));

    let mut hk = Housekeeping::new();
    chopper.set_housekeeping(&mut hk).await.unwrap();
    assert_eq!(hk.get("Chopper", "Position"), Some(&json!("A")));

    let mut device = script.await.unwrap();
    assert!(device.is_quiet());
}

#[tokio::test(start_paused = true)]
async fn antenna_offsets_are_resent_on_every_antenna_move() {
    let (connector, mut device) = mock_connector("chopper");
    let mut chopper = Chopper::new(TextChopper::new(connector)).with_antenna_offset(750);

    let script = tokio::spawn(async move {
        device.expect_line("G").await;
        device.send("Chopper v2\n");
        device.expect_line("?").await;
        device.send("H\n");
        device.expect_line("A750").await;
        device.send("A\n");
        device.expect_line("?").await;
        device.send("A\n");
        device.expect_line("A42").await;
        device.send("A\n");
        device.expect_line("?").await;
        device.send("A\n");
        device.expect_line("H").await;
        device.send("H\n");
        device
    });

    chopper.init().await.unwrap();
    chopper.set_antenna(None).await.unwrap();
    chopper.set_antenna(Some(42)).await.unwrap();
    chopper.set_hot().await.unwrap();
    assert_eq!(chopper.last_commanded(), Some(ChopperPosition::Hot));
    script.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn error_state_before_any_move_blocks_motion() {
    let (connector, mut device) = mock_connector("chopper");
    let mut chopper = Chopper::new(TextChopper::new(connector));

    let script = tokio::spawn(async move {
        device.expect_line("G").await;
        device.send("Chopper v2\n");
        device.expect_line("?").await;
        device.send("E\n");
        device
    });

    chopper.init().await.unwrap();
    assert!(matches!(chopper.set_cold().await, Err(DaqError::PathUnsafe(_))));
    assert_eq!(chopper.last_commanded(), None);

    let mut device = script.await.unwrap();
    assert!(device.is_quiet());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn error_state_after_a_move_substitutes_last_command() {
    let (connector, mut device) = mock_connector("chopper");
    let mut chopper = Chopper::new(TextChopper::new(connector));

    let script = tokio::spawn(async move {
        device.expect_line("G").await;
        device.send("Chopper v2\n");
        device.expect_line("?").await;
        device.send("H\n");
        device.expect_line("C").await;
        device.send("C\n");
        device.expect_line("?").await;
        device.send("E\n");
        device
    });

    chopper.init().await.unwrap();
    chopper.set_cold().await.unwrap();
    let reading = chopper.position().await.unwrap();
    assert_eq!(
        reading,
        Readback::Substituted(PositionReading::At(ChopperPosition::Cold))
    );
    assert!(logs_contain("assuming last commanded position"));
    script.await.unwrap();
}

#[tokio::test]
async fn configured_chopper_over_serial_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rx, mut tx) = stream.into_split();
        let mut lines = BufReader::new(rx).lines();
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            let reply = match line.as_str() {
                "G" => "Chopper v2".to_string(),
                "?" => "R".to_string(),
                other => other.to_string(),
            };
            seen.push(line);
            tx.write_all(format!("{reply}\r\n").as_bytes()).await.unwrap();
        }
        seen
    });

    let config = ChopperConfig::Text(TextChopperConfig {
        device: format!("tcp://{addr}"),
        baud_rate: 115_200,
        antenna_offset: 1000,
        settle: Duration::ZERO,
        resend_after: Duration::from_secs(1),
    });
    let mut chopper = build_chopper(&config).unwrap();
    chopper.init().await.unwrap();
    chopper.set_hot().await.unwrap();
    chopper.close().await.unwrap();
    drop(chopper);

    // Reference to Hot is two steps either way; the forward arc wins
    assert_eq!(server.await.unwrap(), vec!["G", "?", "A", "H"]);
}
