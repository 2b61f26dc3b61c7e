//! Draining a command channel without blocking on it.
//!
//! Each poll takes every event that is already buffered and then sleeps for
//! the poll interval, so a silent command still gets its timeout checked on
//! schedule.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use russh::{ChannelMsg, client};
use tokio::time::Instant;

use crate::output::LineBuffer;

/// SSH extended data type carrying stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

/// One event read from a command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// Stdout bytes.
    Stdout(Vec<u8>),
    /// Stderr bytes.
    Stderr(Vec<u8>),
    /// Remote exit status.
    ExitStatus(u32),
    /// The remote will send no more data.
    Eof,
    /// The channel is gone.
    Closed,
}

/// A channel whose buffered events can be taken without waiting.
pub trait OutputSource: Send {
    /// Next buffered event, or `None` if nothing is ready right now.
    fn try_next(&mut self) -> Option<ExecEvent>;

    /// Close the channel, ignoring failures.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

impl OutputSource for russh::Channel<client::Msg> {
    fn try_next(&mut self) -> Option<ExecEvent> {
        loop {
            // Receiving from the channel queue is cancel safe.
            let msg = match self.wait().now_or_never() {
                None => return None,
                Some(None) => return Some(ExecEvent::Closed),
                Some(Some(msg)) => msg,
            };
            let event = match msg {
                ChannelMsg::Data { data } => ExecEvent::Stdout(data.to_vec()),
                ChannelMsg::ExtendedData { data, ext } if ext == EXTENDED_DATA_STDERR => {
                    ExecEvent::Stderr(data.to_vec())
                }
                ChannelMsg::ExitStatus { exit_status } => ExecEvent::ExitStatus(exit_status),
                ChannelMsg::Eof => ExecEvent::Eof,
                ChannelMsg::Close => ExecEvent::Closed,
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.close().await {
            tracing::debug!(error = %e, "Closing command channel failed");
        }
    }
}

/// Everything read from a command channel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// Raw stdout.
    pub stdout: Vec<u8>,
    /// Raw stderr.
    pub stderr: Vec<u8>,
    /// Exit status, if the remote sent one.
    pub exit_status: Option<u32>,
}

/// How draining ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drained {
    /// The command finished.
    Finished(RawOutput),
    /// The timeout elapsed first; holds what was captured and the channel
    /// has been closed.
    TimedOut(RawOutput),
}

/// Read `source` until the command finishes or `timeout` elapses. A zero
/// timeout means no timeout.
///
/// Streamed bytes are also fed to the line buffers.
pub async fn drain<S: OutputSource>(
    source: &mut S,
    timeout: Option<Duration>,
    poll_interval: Duration,
    stdout_lines: &mut LineBuffer,
    stderr_lines: &mut LineBuffer,
) -> Drained {
    let limit = timeout.filter(|t| !t.is_zero());
    let started = Instant::now();
    let mut out = RawOutput::default();
    let mut eof = false;

    loop {
        while let Some(event) = source.try_next() {
            match event {
                ExecEvent::Stdout(data) => {
                    stdout_lines.push(&data);
                    out.stdout.extend_from_slice(&data);
                }
                ExecEvent::Stderr(data) => {
                    stderr_lines.push(&data);
                    out.stderr.extend_from_slice(&data);
                }
                ExecEvent::ExitStatus(code) => out.exit_status = Some(code),
                ExecEvent::Eof => eof = true,
                ExecEvent::Closed => {
                    stdout_lines.finish();
                    stderr_lines.finish();
                    return Drained::Finished(out);
                }
            }
        }

        if eof && out.exit_status.is_some() {
            stdout_lines.finish();
            stderr_lines.finish();
            return Drained::Finished(out);
        }

        if limit.is_some_and(|limit| started.elapsed() > limit) {
            source.shutdown().await;
            stdout_lines.finish();
            stderr_lines.finish();
            return Drained::TimedOut(out);
        }

        tokio::time::sleep(poll_interval).await;
    }
}
