//! Serial text-command chopper.
//!
//! 115200 baud, one command per line, one reply line per command:
//!
//! | command      | reply                                   |
//! |--------------|-----------------------------------------|
//! | `G`          | greeting                                |
//! | `?`          | first character is `C`, `R`, `H`, `A`, or `E` |
//! | `C` `R` `H`  | step to that neighbouring position      |
//! | `A<offset>`  | step to the antenna with a mirror offset |
//!
//! The controller sometimes swallows a command. Every request is resent
//! after a second of silence.

use super::{ChopperDrive, ChopperPosition, PositionReading, Routing};
use crate::codec::LineCodec;
use crate::error::{AppResult, DaqError};
use crate::hardware::polling::{Link, PollSchedule};
use crate::hardware::transport::StreamConnector;
use async_trait::async_trait;
use std::time::Duration;

pub const BAUD_RATE: u32 = 115_200;

pub struct TextChopper {
    connector: Box<dyn StreamConnector>,
    codec: LineCodec,
    link: Option<Link>,
    resend_after: Duration,
    max_attempts: u32,
}

impl TextChopper {
    pub fn new(connector: Box<dyn StreamConnector>) -> Self {
        Self {
            connector,
            codec: LineCodec::default(),
            link: None,
            resend_after: Duration::from_secs(1),
            max_attempts: 5,
        }
    }

    /// Silence after which a command is sent again, and how often.
    pub fn with_retry(mut self, resend_after: Duration, max_attempts: u32) -> Self {
        self.resend_after = resend_after;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn ask(&mut self, command: &str) -> AppResult<String> {
        let link = self.link.as_mut().ok_or(DaqError::NotConnected)?;
        link.discard_stale(Duration::from_millis(10)).await;

        for attempt in 1..=self.max_attempts {
            link.send(&self.codec, command).await?;
            let schedule = PollSchedule::new(Duration::from_millis(10), self.resend_after);
            match link.read(&self.codec, schedule).await {
                Ok(reply) => return Ok(reply),
                Err(DaqError::ReadTimeout(_)) => {
                    tracing::debug!(command, attempt, "Chopper silent, resending");
                }
                Err(err) => return Err(err),
            }
        }
        Err(DaqError::ReadTimeout(self.resend_after * self.max_attempts))
    }
}

/// Interpret the reply to `?`.
pub fn parse_position(reply: &str) -> AppResult<PositionReading> {
    match reply.trim_start().chars().next() {
        Some('E') => Ok(PositionReading::Error),
        Some(c) => ChopperPosition::from_code(c)
            .map(PositionReading::At)
            .ok_or_else(|| DaqError::MalformedFrame(format!("unknown chopper position {reply:?}"))),
        None => Err(DaqError::MalformedFrame("empty chopper position reply".into())),
    }
}

/// Wire command for one step.
pub fn move_command(target: ChopperPosition, antenna_offset: Option<i64>) -> String {
    match antenna_offset {
        Some(offset) => format!("{}{offset}", target.code()),
        None => target.code().to_string(),
    }
}

#[async_trait]
impl ChopperDrive for TextChopper {
    fn routing(&self) -> Routing {
        Routing::Waypoints
    }

    async fn open(&mut self) -> AppResult<String> {
        if self.link.is_some() {
            return Err(DaqError::AlreadyConnected);
        }
        self.link = Some(Link::new(self.connector.connect().await?));
        match self.ask("G").await {
            Ok(greeting) => Ok(greeting),
            Err(err) => {
                self.link = None;
                Err(err)
            }
        }
    }

    async fn read_position(&mut self) -> AppResult<PositionReading> {
        let reply = self.ask("?").await?;
        parse_position(&reply)
    }

    async fn drive_to(
        &mut self,
        target: ChopperPosition,
        antenna_offset: Option<i64>,
    ) -> AppResult<()> {
        let command = move_command(target, antenna_offset);
        let reply = self.ask(&command).await?;
        tracing::debug!(command = %command, reply = %reply, "Chopper step");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.link = None;
        tracing::debug!(peer = %self.connector.peer(), "Chopper port closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::Preconnected;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn position_replies_parse_by_first_character() {
        assert_eq!(
            parse_position("H\r").unwrap(),
            PositionReading::At(ChopperPosition::Hot)
        );
        assert_eq!(parse_position("E12").unwrap(), PositionReading::Error);
        assert!(parse_position("").is_err());
        assert!(parse_position("X").is_err());
    }

    #[test]
    fn only_offset_moves_carry_a_number() {
        assert_eq!(move_command(ChopperPosition::Antenna, None), "A");
        assert_eq!(move_command(ChopperPosition::Antenna, Some(1000)), "A1000");
        assert_eq!(move_command(ChopperPosition::Cold, None), "C");
    }

    #[tokio::test(start_paused = true)]
    async fn swallowed_command_is_resent() {
        let (client, device) = tokio::io::duplex(256);
        let mut chopper = TextChopper::new(Box::new(Preconnected::new("duplex", client)));

        let device_task = tokio::spawn(async move {
            let (rx, mut tx) = tokio::io::split(device);
            let mut lines = BufReader::new(rx).lines();
            // first G is ignored
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "G");
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "G");
            tx.write_all(b"Chopper v2\r\n").await.unwrap();
            lines
        });

        assert_eq!(chopper.open().await.unwrap(), "Chopper v2");
        device_task.await.unwrap();
    }
}
