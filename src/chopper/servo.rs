//! Register-mapped servo chopper (Nanotec controller).
//!
//! The controller exposes its object dictionary over a minimal HTTP/1.0
//! interface, one TCP connection per request:
//!
//! ```text
//! GET  /od/6041/00 HTTP/1.0            -> ... \r\n"1437"
//! POST /od/607A/00 HTTP/1.0 ... "0A2C"  -> HTTP/1.0 200 OK ...
//! ```
//!
//! Values are hex strings. A written integer keeps the digit count of the
//! register's current value.
//!
//! Angles of the four loads live in the controller (register 0x2701, in
//! millidegrees). The encoder runs at 10000 counts per revolution.

use super::{classify_angle, ChopperDrive, ChopperPosition, PositionReading, PositionTable, Routing};
use crate::error::{AppResult, DaqError};
use crate::hardware::transport::StreamConnector;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Encoder counts per revolution.
pub const COUNTS_PER_REVOLUTION: f64 = 10_000.0;

/// Default classification tolerance in degrees.
pub const DEFAULT_TOLERANCE_DEG: f64 = 0.5;

// Object dictionary entries used here
const CONTROLWORD: u16 = 0x6040;
const STATUSWORD: u16 = 0x6041;
const MODE: u16 = 0x6060;
const ACTUAL_POSITION: u16 = 0x6064;
const TARGET_POSITION: u16 = 0x607A;
const ANGLE_TABLE: u16 = 0x2701;
const STORE: u16 = 0x1010;
const DEVICE_NAME: u16 = 0x1008;
const SOFTWARE_VERSION: u16 = 0x100A;

const STATUS_FAULT: u32 = 1 << 3;
const STATUS_TARGET_REACHED: u32 = 1 << 10;
/// Target reached plus homing attained.
const STATUS_HOMED: u32 = (1 << 10) | (1 << 12);
/// ASCII "save", written to 0x1010/4 to persist the dictionary.
const SAVE_SIGNATURE: u32 = 0x6576_6173;

// =============================================================================
// Register access
// =============================================================================

/// Read/write access to the controller's object dictionary.
#[async_trait]
pub trait RegisterClient: Send {
    /// Raw value of `index`/`sub`, quotes removed.
    async fn read(&mut self, index: u16, sub: u8) -> AppResult<String>;

    /// Write a raw value and return the status line of the reply.
    async fn write(&mut self, index: u16, sub: u8, value: &str) -> AppResult<String>;

    /// Write an integer with the digit count of the current value.
    async fn write_int(&mut self, index: u16, sub: u8, value: u32) -> AppResult<String> {
        let width = self.read(index, sub).await?.len();
        self.write(index, sub, &format_register(value, width)).await
    }

    async fn read_hex(&mut self, index: u16, sub: u8) -> AppResult<u32> {
        let raw = self.read(index, sub).await?;
        parse_register(&raw)
    }
}

pub fn get_request(index: u16, sub: u8) -> String {
    format!("GET /od/{index:04X}/{sub:02X} HTTP/1.0\r\n\r\n")
}

pub fn post_request(index: u16, sub: u8, value: &str) -> String {
    format!(
        "POST /od/{index:04X}/{sub:02X} HTTP/1.0\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\n\r\n\"{value}\"",
        value.len() + 2
    )
}

/// Value of a GET reply: the last line, quotes removed.
pub fn parse_get_reply(reply: &str) -> String {
    reply.rsplit("\r\n").next().unwrap_or_default().replace('"', "")
}

/// First line of a POST reply.
pub fn parse_post_reply(reply: &str) -> String {
    reply.split("\r\n").next().unwrap_or_default().to_string()
}

/// Upper-case hex, zero padded to `width` digits.
pub fn format_register(value: u32, width: usize) -> String {
    format!("{value:0width$X}")
}

pub fn parse_register(raw: &str) -> AppResult<u32> {
    u32::from_str_radix(raw.trim(), 16)
        .map_err(|_| DaqError::MalformedFrame(format!("register value {raw:?} is not hex")))
}

/// [`RegisterClient`] speaking HTTP/1.0 over a fresh connection per request.
pub struct HttpRegisterClient {
    connector: Box<dyn StreamConnector>,
    timeout: Duration,
}

impl HttpRegisterClient {
    pub fn new(connector: Box<dyn StreamConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    async fn exchange(&mut self, request: String) -> AppResult<String> {
        let mut stream = self.connector.connect().await?;
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut reply = Vec::with_capacity(1024);
        tokio::time::timeout(self.timeout, stream.read_to_end(&mut reply))
            .await
            .map_err(|_| DaqError::ReadTimeout(self.timeout))??;
        if reply.is_empty() {
            return Err(DaqError::MalformedFrame(format!(
                "empty reply from {}",
                self.connector.peer()
            )));
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

#[async_trait]
impl RegisterClient for HttpRegisterClient {
    async fn read(&mut self, index: u16, sub: u8) -> AppResult<String> {
        let reply = self.exchange(get_request(index, sub)).await?;
        let value = parse_get_reply(&reply);
        tracing::trace!(index = %format!("{index:04X}"), sub, value = %value, "od read");
        Ok(value)
    }

    async fn write(&mut self, index: u16, sub: u8, value: &str) -> AppResult<String> {
        let reply = self.exchange(post_request(index, sub, value)).await?;
        tracing::trace!(index = %format!("{index:04X}"), sub, value, "od write");
        Ok(parse_post_reply(&reply))
    }
}

// =============================================================================
// Chopper
// =============================================================================

/// Servo chopper on a [`RegisterClient`].
pub struct NanotecChopper<C> {
    client: C,
    table: Option<PositionTable>,
    tolerance: f64,
    poll_interval: Duration,
    motion_timeout: Duration,
}

impl<C: RegisterClient> NanotecChopper<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            table: None,
            tolerance: DEFAULT_TOLERANCE_DEG,
            poll_interval: Duration::from_millis(100),
            motion_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_tolerance(mut self, degrees: f64) -> Self {
        self.tolerance = degrees;
        self
    }

    /// Upper bound for homing and for reaching a target.
    pub fn with_motion_timeout(mut self, timeout: Duration) -> Self {
        self.motion_timeout = timeout;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Angle table read during `open`.
    pub fn table(&self) -> Option<&PositionTable> {
        self.table.as_ref()
    }

    /// Current encoder angle in degrees.
    pub async fn angle(&mut self) -> AppResult<f64> {
        let raw = self.client.read_hex(ACTUAL_POSITION, 0).await?;
        Ok(f64::from(raw as i32) * 360.0 / COUNTS_PER_REVOLUTION)
    }

    /// Re-read the angle table from the controller.
    pub async fn read_table(&mut self) -> AppResult<PositionTable> {
        let mut angles = [0.0; 4];
        for (sub, angle) in (1u8..=4).zip(angles.iter_mut()) {
            *angle = f64::from(self.client.read_hex(ANGLE_TABLE, sub).await?) * 1e-3;
        }
        let table = PositionTable {
            hot: angles[0],
            cold: angles[1],
            reference: angles[2],
            antenna: angles[3],
        };
        self.table = Some(table);
        Ok(table)
    }

    /// Write a new angle table and persist it in the controller.
    pub async fn store_table(&mut self, table: PositionTable) -> AppResult<()> {
        let angles = [table.hot, table.cold, table.reference, table.antenna];
        for (sub, deg) in (1u8..=4).zip(angles) {
            if !(0.0..360.0).contains(&deg) {
                return Err(DaqError::OutOfRange(format!("chopper angle {deg}")));
            }
            self.client
                .write_int(ANGLE_TABLE, sub, (deg * 1000.0) as u32)
                .await?;
        }
        self.client.write_int(STORE, 4, SAVE_SIGNATURE).await?;
        self.table = Some(table);
        tracing::info!(?table, "Chopper angle table stored");
        Ok(())
    }

    async fn status(&mut self) -> AppResult<u32> {
        let status = self.client.read_hex(STATUSWORD, 0).await?;
        if status & STATUS_FAULT != 0 {
            return Err(DaqError::Instrument(format!(
                "servo reports a fault (status {status:04X})"
            )));
        }
        Ok(status)
    }

    async fn wait_for_status(&mut self, mask: u32, what: &str) -> AppResult<()> {
        let deadline = Instant::now() + self.motion_timeout;
        tokio::time::sleep(self.poll_interval).await;
        loop {
            if self.status().await? & mask == mask {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(what, "Servo did not finish in time");
                return Err(DaqError::ReadTimeout(self.motion_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Walk the CiA 402 state machine up to "operation enabled".
    async fn enable(&mut self, pause: Duration) -> AppResult<()> {
        for word in [0xD, 0xE, 0x7, 0xF] {
            self.client.write_int(CONTROLWORD, 0, word).await?;
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    async fn home(&mut self) -> AppResult<()> {
        self.client.write_int(MODE, 0, 6).await?;
        tokio::time::sleep(self.poll_interval).await;
        for (index, sub, value) in [
            (0x3240, 8, 1),
            (0x3242, 3, 1),
            (0x6098, 0, 0x13),
            (0x6099, 1, 0x50),
            (0x6099, 2, 0x50),
        ] {
            self.client.write_int(index, sub, value).await?;
        }
        self.enable(self.poll_interval).await?;
        self.client.write_int(CONTROLWORD, 0, 0x1F).await?;
        self.wait_for_status(STATUS_HOMED, "homing").await
    }

    async fn configure_position_mode(&mut self) -> AppResult<()> {
        self.client.write_int(MODE, 0, 1).await?;
        self.enable(Duration::ZERO).await?;
        for (index, sub, value) in [
            (0x60C5, 0, 0x1870), // max acceleration
            (0x60C6, 0, 0x1870), // max deceleration
            (0x608F, 1, 10000),  // encoder counts
            (0x608F, 2, 1),      // per motor revolution
            (0x6091, 1, 0x7),    // gearbox
            (0x6083, 0, 0x1870),
            (0x6084, 0, 0x1870),
            (0x6081, 0, 0x3000), // speed
            (0x3210, 1, 0xC00),  // position loop P
            (0x3210, 2, 0x0),    // position loop I
            (0x3210, 3, 0x2A10), // velocity loop P
            (0x3210, 4, 0x40),   // velocity loop I
        ] {
            self.client.write_int(index, sub, value).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: RegisterClient> ChopperDrive for NanotecChopper<C> {
    fn routing(&self) -> Routing {
        Routing::Direct
    }

    async fn open(&mut self) -> AppResult<String> {
        self.home().await?;
        self.configure_position_mode().await?;
        let table = self.read_table().await?;
        tracing::debug!(?table, "Chopper angle table");
        let name = self.client.read(DEVICE_NAME, 0).await?;
        let version = self.client.read(SOFTWARE_VERSION, 0).await?;
        Ok(format!("{name}, {version}"))
    }

    async fn read_position(&mut self) -> AppResult<PositionReading> {
        let table = self.table.ok_or(DaqError::NotConnected)?;
        let angle = self.angle().await?;
        Ok(classify_angle(angle, &table, self.tolerance))
    }

    /// Antenna offsets do not apply; the servo angles come from the table.
    async fn drive_to(
        &mut self,
        target: ChopperPosition,
        antenna_offset: Option<i64>,
    ) -> AppResult<()> {
        let table = self.table.ok_or(DaqError::NotConnected)?;
        if antenna_offset.is_some() {
            tracing::debug!("Antenna offset ignored by the servo chopper");
        }
        let degrees = table.angle(target);
        let counts = (degrees * COUNTS_PER_REVOLUTION / 360.0) as i32;

        self.client.write_int(CONTROLWORD, 0, 0xF).await?;
        self.client
            .write_int(TARGET_POSITION, 0, counts as u32)
            .await?;
        self.client.write_int(CONTROLWORD, 0, 0x1F).await?;
        self.wait_for_status(STATUS_TARGET_REACHED, "positioning")
            .await?;
        tracing::debug!(target = %target, degrees, counts, "Servo on target");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.table = None;
        Ok(())
    }
}
