//! Bounded polling reads.
//!
//! Devices in this crate answer whenever they like, in as many pieces as the
//! line feels like. Every read is therefore a loop: decode what has
//! accumulated, wait up to one poll interval for more bytes, give up at an
//! overall deadline. All waiting goes through `tokio::time`, so tests running
//! on a paused clock step through these loops without real delays.

use crate::codec::{Decoded, FrameCodec};
use crate::error::{AppResult, DaqError};
use crate::hardware::transport::{drain, DynSerial};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Poll interval and overall deadline for one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollSchedule {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    /// Deadline only, default poll interval.
    pub const fn within(deadline: Duration) -> Self {
        Self::new(Self::DEFAULT_INTERVAL, deadline)
    }

    /// Twice the expected integration, the usual budget for a data reply.
    pub fn for_integration(integration: Duration) -> Self {
        Self::within(integration * 2)
    }
}

/// Read from `port` until `codec` yields a frame or the schedule runs out.
///
/// - `Ready` returns the frame, leaving trailing bytes in `buf` for the next call.
/// - `Invalid` fails immediately with the codec's error.
/// - At the deadline, an empty buffer is a [`DaqError::ReadTimeout`]; otherwise
///   the codec gets one [`FrameCodec::decode_eof`] attempt.
/// - A closed stream with nothing buffered is an `UnexpectedEof` I/O error.
///
/// Every failure empties `buf`, so a broken frame never leaks into the next read.
pub async fn read_frame<R, C>(
    port: &mut R,
    codec: &C,
    buf: &mut BytesMut,
    schedule: PollSchedule,
) -> AppResult<C::Frame>
where
    R: AsyncRead + Unpin + ?Sized,
    C: FrameCodec + ?Sized,
{
    let result = poll_frame(port, codec, buf, schedule).await;
    if let Err(err) = &result {
        if !buf.is_empty() {
            tracing::debug!(discarded = buf.len(), error = %err, "Dropping partial input");
            buf.clear();
        }
    }
    result
}

async fn poll_frame<R, C>(
    port: &mut R,
    codec: &C,
    buf: &mut BytesMut,
    schedule: PollSchedule,
) -> AppResult<C::Frame>
where
    R: AsyncRead + Unpin + ?Sized,
    C: FrameCodec + ?Sized,
{
    let deadline = Instant::now() + schedule.deadline;
    let mut chunk = [0u8; 4096];

    loop {
        match codec.try_decode(buf) {
            Decoded::Ready(frame) => return Ok(frame),
            Decoded::Invalid(err) => return Err(err.into()),
            Decoded::Incomplete => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return finish(codec, buf, schedule.deadline);
        }
        let slice = schedule.interval.min(deadline - now);

        match tokio::time::timeout(slice, port.read(&mut chunk)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    return Err(DaqError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "device closed the connection",
                    )));
                }
                return match codec.decode_eof(buf) {
                    Decoded::Ready(frame) => Ok(frame),
                    Decoded::Invalid(err) => Err(err.into()),
                    Decoded::Incomplete => Err(DaqError::MalformedFrame(format!(
                        "connection closed after {} bytes of an incomplete frame",
                        buf.len()
                    ))),
                };
            }
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

fn finish<C>(codec: &C, buf: &mut BytesMut, waited: Duration) -> AppResult<C::Frame>
where
    C: FrameCodec + ?Sized,
{
    if buf.is_empty() {
        return Err(DaqError::ReadTimeout(waited));
    }
    match codec.decode_eof(buf) {
        Decoded::Ready(frame) => Ok(frame),
        Decoded::Invalid(err) => Err(err.into()),
        Decoded::Incomplete => {
            tracing::debug!(buffered = buf.len(), "Deadline hit mid-frame");
            Err(DaqError::ReadTimeout(waited))
        }
    }
}

/// Encode `command` with `codec` and write it out.
pub async fn send_command<W, C>(port: &mut W, codec: &C, command: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    C: FrameCodec + ?Sized,
{
    let wire = codec.encode_command(command);
    tracing::debug!(command, bytes = wire.len(), "-> device");
    port.write_all(&wire).await?;
    port.flush().await?;
    Ok(())
}

/// An open byte stream plus its receive buffer.
pub struct Link {
    port: DynSerial,
    buf: BytesMut,
}

impl Link {
    pub fn new(port: DynSerial) -> Self {
        Self {
            port,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub async fn send<C: FrameCodec + ?Sized>(
        &mut self,
        codec: &C,
        command: &str,
    ) -> AppResult<()> {
        send_command(&mut self.port, codec, command).await
    }

    pub async fn read<C: FrameCodec + ?Sized>(
        &mut self,
        codec: &C,
        schedule: PollSchedule,
    ) -> AppResult<C::Frame> {
        read_frame(&mut self.port, codec, &mut self.buf, schedule).await
    }

    /// Send and wait for one reply frame.
    pub async fn ask<C: FrameCodec + ?Sized>(
        &mut self,
        codec: &C,
        command: &str,
        timeout: Duration,
    ) -> AppResult<C::Frame> {
        self.send(codec, command).await?;
        self.read(codec, PollSchedule::within(timeout)).await
    }

    /// Forget buffered and pending input.
    pub async fn discard_stale(&mut self, window: Duration) {
        self.buf.clear();
        drain(&mut self.port, window).await;
    }
}
