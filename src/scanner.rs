//! Background scanning.
//!
//! Some housekeeping instruments (a scanning multimeter, typically) are read
//! continuously. [`ScanWorker`] owns such a device on its own task, scans it
//! at a fixed interval and publishes the newest [`Sample`] through a `watch`
//! channel. Foreground code that needs the device for something else posts a
//! request through a single-slot channel and awaits the reply; the device
//! itself is never shared.
//!
//! ```text
//! foreground --request(cmd)--> [mpsc(1)] --> scan task --oneshot--> reply
//!            <--latest()----- [watch] <-- scan every interval
//! ```

use crate::codec::LineCodec;
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// A device that can be scanned and talked to.
#[async_trait]
pub trait ScanDevice: Send + 'static {
    /// Trigger one scan and return its readings.
    async fn scan(&mut self) -> AppResult<Vec<f64>>;

    /// Send a query and return the answer.
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Send a command without an answer.
    async fn command(&mut self, command: &str) -> AppResult<()>;
}

/// One scan result.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub values: Vec<f64>,
    pub at: DateTime<Utc>,
}

struct Request {
    command: String,
    reply: oneshot::Sender<AppResult<Option<String>>>,
}

/// Handle to a running scan task.
pub struct ScanWorker {
    requests: mpsc::Sender<Request>,
    latest: watch::Receiver<Option<Sample>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScanWorker {
    /// Move `device` onto a new task scanning every `interval`.
    pub fn spawn<D: ScanDevice>(mut device: D, interval: Duration) -> Self {
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(1);
        let (latest_tx, latest_rx) = watch::channel(None);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    Some(request) = request_rx.recv() => {
                        let result = if request.command.contains('?') {
                            device.query(&request.command).await.map(Some)
                        } else {
                            device.command(&request.command).await.map(|()| None)
                        };
                        if request.reply.send(result).is_err() {
                            tracing::debug!(command = %request.command, "Requester went away");
                        }
                    }
                    _ = ticker.tick() => {
                        match device.scan().await {
                            Ok(values) => {
                                latest_tx.send_replace(Some(Sample { values, at: Utc::now() }));
                            }
                            Err(err) => tracing::warn!(error = %err, "Scan failed"),
                        }
                    }
                }
            }
            tracing::debug!("Scan task stopped");
        });

        Self {
            requests: request_tx,
            latest: latest_rx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Run `command` on the device between two scans.
    ///
    /// Commands containing `?` return the device answer; others return `None`.
    pub async fn request(&self, command: impl Into<String>) -> AppResult<Option<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request {
                command: command.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| DaqError::InvalidState("scan task is not running".into()))?;
        reply_rx
            .await
            .map_err(|_| DaqError::InvalidState("scan task dropped the request".into()))?
    }

    /// Most recent successful scan.
    pub fn latest(&self) -> Option<Sample> {
        self.latest.borrow().clone()
    }

    /// Receiver notified on every new sample.
    pub fn subscribe(&self) -> watch::Receiver<Option<Sample>> {
        self.latest.clone()
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) -> AppResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| DaqError::Instrument(format!("scan task failed: {e}")))?;
        }
        Ok(())
    }
}

// =============================================================================
// SCPI multimeter
// =============================================================================

/// Line-oriented SCPI instrument scanned with `READ?`.
pub struct ScpiMeter {
    link: Link,
    codec: LineCodec,
    timeout: Duration,
}

impl ScpiMeter {
    /// Connect and return the meter with its `*IDN?` answer.
    pub async fn open(
        connector: &mut dyn StreamConnector,
        timeout: Duration,
    ) -> AppResult<(Self, String)> {
        let mut meter = Self {
            link: Link::new(connector.connect().await?),
            codec: LineCodec::default(),
            timeout,
        };
        let identity = meter.query("*IDN?").await?;
        if identity.trim().is_empty() {
            return Err(DaqError::Instrument(format!(
                "{} did not identify itself",
                connector.peer()
            )));
        }
        Ok((meter, identity))
    }
}

/// Comma separated readings.
pub fn parse_readings(reply: &str) -> AppResult<Vec<f64>> {
    if reply.trim().is_empty() {
        return Ok(Vec::new());
    }
    reply
        .split(',')
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| DaqError::MalformedFrame(format!("bad reading {v:?}")))
        })
        .collect()
}

#[async_trait]
impl ScanDevice for ScpiMeter {
    async fn scan(&mut self) -> AppResult<Vec<f64>> {
        let reply = self.query("READ?").await?;
        parse_readings(&reply)
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.link.discard_stale(Duration::from_millis(5)).await;
        self.link.send(&self.codec, command).await?;
        self.link
            .read(&self.codec, PollSchedule::within(self.timeout))
            .await
    }

    async fn command(&mut self, command: &str) -> AppResult<()> {
        self.link.send(&self.codec, command).await
    }
}
