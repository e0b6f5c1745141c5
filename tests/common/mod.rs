//! Shared mock transports for the integration tests.
//!
//! [`MockSerialPort`] is handed to the code under test through a
//! `Preconnected` connector; the test plays the instrument through the
//! matching [`MockDeviceHarness`].

#![allow(dead_code)]

use async_trait::async_trait;
use radiometer_daq::error::AppResult;
use radiometer_daq::hardware::{DatagramLink, Preconnected, PreconnectedDatagram};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// Generous, because paused-clock tests auto-advance through it.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(3600);

// =============================================================================
// Mock Stream
// =============================================================================

/// Client side of the mock stream.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Instrument side of the mock stream.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

pub fn new_mock_serial() -> (MockSerialPort, MockDeviceHarness) {
    let (client_tx, harness_rx) = mpsc::unbounded_channel();
    let (harness_tx, client_rx) = mpsc::unbounded_channel();
    (
        MockSerialPort {
            writes_tx: client_tx,
            reads_rx: client_rx,
            read_buffer: VecDeque::new(),
        },
        MockDeviceHarness {
            writes_rx: harness_rx,
            reads_tx: harness_tx,
            write_buffer: Vec::new(),
        },
    )
}

/// A mock stream wrapped in a one-shot connector.
pub fn mock_connector(label: &str) -> (Box<Preconnected<MockSerialPort>>, MockDeviceHarness) {
    let (port, harness) = new_mock_serial();
    (Box::new(Preconnected::new(label, port)), harness)
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Push bytes towards the client.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        self.reads_tx
            .send(data.as_ref().to_vec())
            .expect("client port dropped");
    }

    /// Wait until the client wrote at least `n` bytes and take them.
    pub async fn take(&mut self, n: usize) -> Vec<u8> {
        while self.write_buffer.len() < n {
            match timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!(
                    "client closed with {:?} buffered",
                    String::from_utf8_lossy(&self.write_buffer)
                ),
                Err(_) => panic!("timed out waiting for {n} bytes from the client"),
            }
        }
        self.write_buffer.drain(..n).collect()
    }

    /// Assert the client's next bytes equal `expected`.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let got = self.take(expected.len()).await;
        assert_eq!(
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(expected),
            "unexpected client write"
        );
    }

    /// Assert the client's next line is `expected` (without the newline).
    pub async fn expect_line(&mut self, expected: &str) {
        self.expect_write(format!("{expected}\n").as_bytes()).await;
    }

    /// Next newline terminated line written by the client.
    pub async fn next_line(&mut self) -> String {
        loop {
            if let Some(at) = self.write_buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.write_buffer.drain(..=at).collect();
                return String::from_utf8_lossy(&line[..at]).into_owned();
            }
            match timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("client closed while a line was expected"),
                Err(_) => panic!("timed out waiting for a line"),
            }
        }
    }

    /// Next bytes up to and including `end`.
    pub async fn next_until(&mut self, end: u8) -> Vec<u8> {
        loop {
            if let Some(at) = self.write_buffer.iter().position(|&b| b == end) {
                return self.write_buffer.drain(..=at).collect();
            }
            match timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("client closed while waiting for {end:#04x}"),
                Err(_) => panic!("timed out waiting for {end:#04x}"),
            }
        }
    }

    /// True when the client has nothing unread queued.
    pub fn is_quiet(&mut self) -> bool {
        while let Ok(chunk) = self.writes_rx.try_recv() {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.is_empty()
    }
}

// =============================================================================
// Mock Datagrams
// =============================================================================

/// Datagram link that forwards every payload to the test.
pub struct MockDatagramLink {
    tx: UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl DatagramLink for MockDatagramLink {
    async fn send_datagram(&mut self, payload: &[u8]) -> AppResult<()> {
        let _ = self.tx.send(payload.to_vec());
        Ok(())
    }
}

pub fn mock_datagrams(label: &str) -> (Box<PreconnectedDatagram>, UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = PreconnectedDatagram::new(label, Box::new(MockDatagramLink { tx }));
    (Box::new(link), rx)
}

/// Every datagram sent so far, as text.
pub fn drain_datagrams(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        out.push(String::from_utf8_lossy(&payload).into_owned());
    }
    out
}
