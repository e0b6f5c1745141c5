//! Transports
//!
//! Sessions never open sockets themselves. They hold a connector and ask it
//! for a fresh transport on `connect()`, so tests can hand in an in-memory
//! stream while production code dials TCP, UDP or a serial line.
//!
//! - [`SerialPortIO`] / [`DynSerial`]: any byte stream (TCP socket, serial port, mock)
//! - [`DatagramLink`] / [`DynDatagram`]: fire-and-forget command datagrams
//! - [`StreamConnector`] / [`DatagramConnector`]: how to open them

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

/// Trait alias for async byte streams.
///
/// Blanket-implemented for every `AsyncRead + AsyncWrite + Unpin + Send`
/// type, so a `TcpStream`, a `tokio_serial::SerialStream` or an in-memory
/// mock all fit.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed byte stream owned by one session.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Outgoing datagrams to an already addressed peer.
#[async_trait]
pub trait DatagramLink: Send {
    async fn send_datagram(&mut self, payload: &[u8]) -> AppResult<()>;
}

#[async_trait]
impl DatagramLink for UdpSocket {
    async fn send_datagram(&mut self, payload: &[u8]) -> AppResult<()> {
        self.send(payload).await?;
        Ok(())
    }
}

/// Boxed datagram link owned by one session.
pub type DynDatagram = Box<dyn DatagramLink>;

/// Opens byte streams.
#[async_trait]
pub trait StreamConnector: Send {
    async fn connect(&mut self) -> AppResult<DynSerial>;

    /// Human readable peer, used in logs and errors.
    fn peer(&self) -> String;
}

/// Opens datagram links.
#[async_trait]
pub trait DatagramConnector: Send {
    async fn connect(&mut self) -> AppResult<DynDatagram>;

    fn peer(&self) -> String;
}

// =============================================================================
// TCP / UDP
// =============================================================================

/// Dials `addr` with a bounded connect time.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&mut self) -> AppResult<DynSerial> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| DaqError::ConnectTimeout {
                target: self.addr.clone(),
                timeout: self.timeout,
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %self.addr, "TCP connected");
        Ok(Box::new(stream))
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

/// Binds an ephemeral local port and connects it to `addr`.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    addr: String,
}

impl UdpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl DatagramConnector for UdpConnector {
    async fn connect(&mut self) -> AppResult<DynDatagram> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.addr).await?;
        tracing::debug!(peer = %self.addr, "UDP link ready");
        Ok(Box::new(socket))
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

// =============================================================================
// Serial
// =============================================================================

/// Opens an 8N1 serial port without flow control.
#[cfg(feature = "tokio_serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

#[cfg(feature = "tokio_serial")]
impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
        }
    }
}

#[cfg(feature = "tokio_serial")]
#[async_trait]
impl StreamConnector for SerialConnector {
    async fn connect(&mut self) -> AppResult<DynSerial> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                DaqError::Instrument(format!("Failed to open serial port {}: {e}", self.path))
            })?;
        tracing::debug!(path = %self.path, baud = self.baud_rate, "Serial port opened");
        Ok(Box::new(port))
    }

    fn peer(&self) -> String {
        self.path.clone()
    }
}

/// Connector for a configured device string.
///
/// `tcp://host:port` goes through a serial-to-ethernet server; anything else
/// is a local serial device and needs the `tokio_serial` feature.
pub fn device_connector(
    device: &str,
    baud_rate: u32,
    timeout: Duration,
) -> AppResult<Box<dyn StreamConnector>> {
    if let Some(addr) = device.strip_prefix("tcp://") {
        return Ok(Box::new(TcpConnector::new(addr, timeout)));
    }
    #[cfg(feature = "tokio_serial")]
    {
        Ok(Box::new(SerialConnector::new(device, baud_rate, timeout)))
    }
    #[cfg(not(feature = "tokio_serial"))]
    {
        let _ = baud_rate;
        Err(DaqError::Configuration(format!(
            "serial device {device} requires the tokio_serial feature"
        )))
    }
}

// =============================================================================
// Preconnected
// =============================================================================

/// Hands out a transport opened by the caller, once.
///
/// Reconnecting after the transport was taken fails with `NotConnected`.
pub struct Preconnected<T> {
    label: String,
    inner: Option<T>,
}

impl<T> Preconnected<T> {
    pub fn new(label: impl Into<String>, transport: T) -> Self {
        Self {
            label: label.into(),
            inner: Some(transport),
        }
    }

    fn take(&mut self) -> AppResult<T> {
        self.inner.take().ok_or(DaqError::NotConnected)
    }
}

#[async_trait]
impl<T: SerialPortIO + 'static> StreamConnector for Preconnected<T> {
    async fn connect(&mut self) -> AppResult<DynSerial> {
        Ok(Box::new(self.take()?))
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

/// Datagram link handed in by the caller.
pub struct PreconnectedDatagram(Preconnected<DynDatagram>);

impl PreconnectedDatagram {
    pub fn new(label: impl Into<String>, link: DynDatagram) -> Self {
        Self(Preconnected::new(label, link))
    }
}

#[async_trait]
impl DatagramConnector for PreconnectedDatagram {
    async fn connect(&mut self) -> AppResult<DynDatagram> {
        self.0.take()
    }

    fn peer(&self) -> String {
        self.0.label.clone()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Discard whatever is already waiting on `port`.
///
/// Reads in short slices until `window` elapses or the line goes quiet.
/// Returns the number of bytes thrown away.
pub async fn drain<R>(port: &mut R, window: Duration) -> usize
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut discard = [0u8; 256];
    let mut total = 0;
    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(5), port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }
    if total > 0 {
        tracing::trace!(discarded = total, "Drained stale input");
    }
    total
}
