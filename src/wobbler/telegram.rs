//! Telegram-protocol wobbler (IRAM stage controller).
//!
//! Every command is a checksummed telegram to one bus address; queries are
//! answered with `STX <addr><status>:<answer>:<checksum> ETX`. Commands used:
//!
//! - `GI+`: drive to the positive limit switch (homing)
//! - `GA<pos>`: go to absolute position
//! - `PC?`: current position, `PF?`: current frequency
//! - `B` brake, `H` halt, `CR` hardware reset
//!
//! The controller does not acknowledge moves. A move counts as started once
//! `PC?` reports the moving bit; an unusable reply also carries that bit, so
//! line noise never traps the loop.

use super::{MotionRequest, PositionReply, WobblerDrive};
use crate::codec::{TelegramCodec, TelegramReply};
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Seconds per step of the stage.
pub const STEP_PERIOD: f64 = 0.001_451_194_564_501_444_6;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Timing of the request/reply exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelegramTiming {
    /// Window for one reply.
    pub reply_window: Duration,
    /// Pause between move retries.
    pub retry_pause: Duration,
    /// Give up on a move that never reports motion after this many tries.
    pub max_move_attempts: u32,
    /// Fixed poll period while homing.
    pub homing_poll: Duration,
    /// Upper bound for one settle loop.
    pub motion_timeout: Duration,
    /// Pause after `CR` before the controller answers again.
    pub reset_pause: Duration,
}

impl Default for TelegramTiming {
    fn default() -> Self {
        Self {
            reply_window: Duration::from_millis(500),
            retry_pause: Duration::from_millis(100),
            max_move_attempts: 50,
            homing_poll: Duration::from_secs(2),
            motion_timeout: Duration::from_secs(120),
            reset_pause: Duration::from_secs(4),
        }
    }
}

pub struct TelegramWobbler {
    connector: Box<dyn StreamConnector>,
    codec: TelegramCodec,
    timing: TelegramTiming,
    link: Option<Link>,
    last_target: Option<i64>,
}

impl TelegramWobbler {
    pub fn new(connector: Box<dyn StreamConnector>, address: u8) -> Self {
        Self {
            connector,
            codec: TelegramCodec::new(address),
            timing: TelegramTiming::default(),
            link: None,
            last_target: None,
        }
    }

    pub fn with_timing(mut self, timing: TelegramTiming) -> Self {
        self.timing = timing;
        self
    }

    fn link(&mut self) -> AppResult<&mut Link> {
        self.link.as_mut().ok_or(DaqError::NotConnected)
    }

    /// Send a command that has no reply.
    pub async fn send(&mut self, command: &str) -> AppResult<()> {
        let codec = self.codec;
        self.link()?.send(&codec, command).await
    }

    /// Send a query and decode whatever comes back in the reply window.
    ///
    /// Silence is [`TelegramReply::Silent`], not an error.
    pub async fn transact(&mut self, command: &str) -> AppResult<TelegramReply> {
        let codec = self.codec;
        let window = self.timing.reply_window;
        let link = self.link()?;
        link.discard_stale(Duration::from_millis(5)).await;
        link.send(&codec, command).await?;
        match link
            .read(&codec, PollSchedule::new(Duration::from_millis(100), window))
            .await
        {
            Ok(reply) => {
                if let TelegramReply::Malformed(err) = &reply {
                    tracing::debug!(command, error = %err, "Unusable wobbler reply");
                }
                Ok(reply)
            }
            Err(DaqError::ReadTimeout(_)) => Ok(TelegramReply::Silent),
            Err(err) => Err(err),
        }
    }

    /// Frequency the stage currently moves with; 0 when unknown.
    pub async fn query_frequency(&mut self) -> AppResult<i64> {
        let reply = self.transact("PF?").await?;
        Ok(reply.answer().trim().parse().unwrap_or(0))
    }

    pub async fn brake(&mut self) -> AppResult<()> {
        self.send("B").await
    }

    pub async fn halt(&mut self) -> AppResult<()> {
        self.send("H").await
    }

    /// Hardware reset followed by a new homing run.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.send("CR").await?;
        tokio::time::sleep(self.timing.reset_pause).await;
        self.wait_until_motionless(None).await?;
        self.send("GI+").await?;
        self.wait_until_motionless(None).await
    }

    /// Poll `PC?` until the moving bit clears.
    ///
    /// Without a `fixed` period each poll sleeps `0.125 * |target - position| / f`
    /// seconds, `f` being the frequency reported by `PF?`. A stage that
    /// reports no frequency is taken as motionless.
    async fn wait_until_motionless(&mut self, fixed: Option<Duration>) -> AppResult<()> {
        let frequency = self.query_frequency().await?;
        if frequency <= 0 {
            return Ok(());
        }

        let deadline = Instant::now() + self.timing.motion_timeout;
        loop {
            let reply = self.transact("PC?").await?;
            if !reply.is_moving() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaqError::ReadTimeout(self.timing.motion_timeout));
            }
            let pause = match (fixed, self.last_target, reply.answer().trim().parse::<i64>()) {
                (Some(period), _, _) => period,
                (None, Some(target), Ok(at)) => Duration::from_secs_f64(
                    0.125 * (target - at).unsigned_abs() as f64 / frequency as f64,
                ),
                _ => self.timing.retry_pause,
            };
            tokio::time::sleep(pause.max(Duration::from_millis(10))).await;
        }
    }
}

#[async_trait]
impl WobblerDrive for TelegramWobbler {
    async fn open(&mut self) -> AppResult<String> {
        if self.link.is_some() {
            return Err(DaqError::AlreadyConnected);
        }
        self.link = Some(Link::new(self.connector.connect().await?));
        self.send("GI+").await?;
        let homing = self.timing.homing_poll;
        if let Err(err) = self.wait_until_motionless(Some(homing)).await {
            self.link = None;
            return Err(err);
        }
        Ok(format!(
            "telegram wobbler {} at address {}",
            self.connector.peer(),
            self.codec.address() as char
        ))
    }

    fn step_period(&self) -> f64 {
        STEP_PERIOD
    }

    async fn command_move(&mut self, request: MotionRequest) -> AppResult<()> {
        let target = request.target_position;
        self.last_target = Some(target);
        for attempt in 1..=self.timing.max_move_attempts {
            self.send(&format!("GA{target}")).await?;
            if self.transact("PC?").await?.is_moving() {
                tracing::debug!(target, attempt, "Wobbler moving");
                return Ok(());
            }
            tokio::time::sleep(self.timing.retry_pause).await;
        }
        Err(DaqError::Instrument(format!(
            "wobbler did not start moving to {target} after {} attempts",
            self.timing.max_move_attempts
        )))
    }

    async fn settle(&mut self, target: i64) -> AppResult<()> {
        self.last_target = Some(target);
        self.wait_until_motionless(None).await
    }

    async fn query_position(&mut self) -> AppResult<PositionReply> {
        let reply = self.transact("PC?").await?;
        if !reply.is_trusted() {
            return Ok(PositionReply::Unusable);
        }
        Ok(match reply.answer().trim().parse() {
            Ok(position) => PositionReply::Reported(position),
            Err(_) => PositionReply::Unusable,
        })
    }

    async fn close(&mut self) -> AppResult<()> {
        self.link = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::hardware::transport::Preconnected;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Read one request telegram and return its command text.
    async fn next_command(device: &mut DuplexStream) -> String {
        let mut frame = Vec::new();
        loop {
            let byte = device.read_u8().await.unwrap();
            frame.push(byte);
            if byte == crate::codec::telegram::ETX {
                break;
            }
        }
        String::from_utf8_lossy(&frame[2..frame.len() - 4]).into_owned()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_reads_as_sentinel() {
        let (client, _device) = tokio::io::duplex(256);
        let mut wobbler = TelegramWobbler::new(Box::new(Preconnected::new("duplex", client)), b'0');
        wobbler.link = Some(Link::new(wobbler.connector.connect().await.unwrap()));

        let reply = wobbler.transact("PC?").await.unwrap();
        assert_eq!(reply, TelegramReply::Silent);
        assert!(reply.is_moving());
        assert_eq!(
            wobbler.query_position().await.unwrap(),
            PositionReply::Unusable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn move_repeats_until_motion_is_reported() {
        let (client, mut device) = tokio::io::duplex(1024);
        let codec = TelegramCodec::new(b'0');
        let mut wobbler = TelegramWobbler::new(Box::new(Preconnected::new("duplex", client)), b'0');
        wobbler.link = Some(Link::new(wobbler.connector.connect().await.unwrap()));

        let device_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for status in [0u8, 1] {
                seen.push(next_command(&mut device).await);
                seen.push(next_command(&mut device).await);
                device
                    .write_all(&codec.encode_reply(status, "1200"))
                    .await
                    .unwrap();
            }
            seen
        });

        let request = super::super::MotionBounds::default()
            .request(1500, 1.0 / STEP_PERIOD)
            .unwrap();
        wobbler.command_move(request).await.unwrap();
        assert_eq!(
            device_task.await.unwrap(),
            vec!["GA1500", "PC?", "GA1500", "PC?"]
        );
    }

    #[test]
    fn request_framing_matches_controller() {
        let codec = TelegramCodec::new(b'0');
        assert_eq!(&codec.encode_command("PC?")[..], b"\x020PC?:1C\x03");
    }
}
