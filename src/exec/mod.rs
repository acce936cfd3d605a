//! Remote command execution over an established shell session.
//!
//! The executor drives a single command through a dual-stream channel,
//! polling the standard output and standard error streams without blocking
//! on either one until the remote side reports completion. Once completion
//! is known it switches to blocking reads and drains both streams until they
//! close, so output written between "exit status available" and "stream
//! closed" is kept.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Number of bytes requested from a stream per read.
pub const CHUNK_SIZE: usize = 4096;

/// Pause between polling rounds that produced no data.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on a single remote command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3600);

/// Upper bound on opening an execution channel.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Identifies one of the two output streams of an execution channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Dual-stream handle for one running remote command.
pub trait ExecChannel {
    /// Returns `true` once the remote command has signalled completion.
    fn exit_status_ready(&mut self) -> bool;

    /// Exit status reported by the remote command, when known.
    fn exit_status(&mut self) -> Option<i32>;

    /// Returns `true` when a read on `stream` would not block, either because
    /// data is buffered or because the stream has reached end-of-file.
    fn ready(&mut self, stream: StreamKind) -> bool;

    /// Reads up to `buf.len()` bytes from `stream`, blocking until data or
    /// end-of-file is available. A return value of zero means the stream is
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the transport fails.
    fn read(&mut self, stream: StreamKind, buf: &mut [u8]) -> io::Result<usize>;
}

/// A shell session capable of opening execution channels.
pub trait ExecSession {
    /// Channel type produced by this session.
    type Channel: ExecChannel;

    /// Returns `true` while the underlying transport is connected.
    fn is_active(&self) -> bool;

    /// Opens a channel and starts `command` on it.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::ChannelOpen`] when the command cannot be started.
    fn open_channel(
        &mut self,
        command: &str,
        open_timeout: Duration,
    ) -> Result<Self::Channel, ExecError>;
}

/// Captured output of a finished remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecutionResult {
    /// Exit status reported by the remote side, if it reported one.
    pub exit_code: Option<i32>,
    /// Standard output, decoded as UTF-8 with invalid sequences replaced.
    pub stdout: String,
    /// Standard error, decoded as UTF-8 with invalid sequences replaced.
    pub stderr: String,
}

/// Errors raised by the command executor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when the session has no active transport.
    #[error("shell session is not connected")]
    SessionUnavailable,
    /// Raised when a channel cannot be opened or the command cannot start.
    #[error("failed to start `{command}`: {message}")]
    ChannelOpen {
        /// Command that was being started.
        command: String,
        /// Transport error description.
        message: String,
    },
    /// Raised when reading from a stream fails.
    #[error("failed to read {stream} of `{command}`: {message}")]
    Read {
        /// Command whose output was being read.
        command: String,
        /// Stream that failed.
        stream: StreamKind,
        /// I/O error description.
        message: String,
    },
    /// Raised when the command does not finish before the command timeout.
    /// The session should be treated as unusable afterwards.
    #[error("`{command}` did not finish within {timeout:?}")]
    ExecutionTimeout {
        /// Command that timed out.
        command: String,
        /// Limit that was exceeded.
        timeout: Duration,
    },
    /// Raised when the caller withdrew the command before it finished.
    #[error("`{command}` was cancelled")]
    Cancelled {
        /// Command that was abandoned.
        command: String,
    },
}

/// Shared flag a caller raises to abandon work running on another thread.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Raising it again has no further effect.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once the flag has been raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs commands to completion on an [`ExecSession`].
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    command_timeout: Duration,
    open_timeout: Duration,
    idle_backoff: Duration,
    chunk_size: usize,
    cancel: Option<CancelFlag>,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Creates an executor using the default limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
            open_timeout: CHANNEL_OPEN_TIMEOUT,
            idle_backoff: IDLE_BACKOFF,
            chunk_size: CHUNK_SIZE,
            cancel: None,
        }
    }

    /// Overrides the per-command timeout.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Overrides the channel-open timeout.
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Overrides the idle backoff.
    ///
    /// This is primarily used by tests to keep polling loops fast.
    #[must_use]
    pub const fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Stops waiting for the command once `flag` is raised.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Returns the configured per-command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Runs `command` on `session` and returns both captured streams.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::SessionUnavailable`] when the session is not
    /// connected, [`ExecError::ExecutionTimeout`] when the command does not
    /// signal completion in time, and [`ExecError::ChannelOpen`] or
    /// [`ExecError::Read`] for transport failures. Returns
    /// [`ExecError::Cancelled`] when the cancel flag is raised before the
    /// command finishes.
    pub fn execute<S: ExecSession>(
        &self,
        session: &mut S,
        command: &str,
    ) -> Result<ExecutionResult, ExecError> {
        if !session.is_active() {
            return Err(ExecError::SessionUnavailable);
        }

        let mut channel = session.open_channel(command, self.open_timeout)?;
        let deadline = Instant::now() + self.command_timeout;
        let mut stdout = StreamCapture::new(StreamKind::Stdout);
        let mut stderr = StreamCapture::new(StreamKind::Stderr);
        let mut chunk = vec![0_u8; self.chunk_size.max(1)];

        while !channel.exit_status_ready() {
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                warn!(command, "remote command abandoned by caller");
                return Err(ExecError::Cancelled {
                    command: command.to_owned(),
                });
            }
            if Instant::now() >= deadline {
                warn!(command, "remote command exceeded its timeout");
                return Err(ExecError::ExecutionTimeout {
                    command: command.to_owned(),
                    timeout: self.command_timeout,
                });
            }

            let out_progress = stdout.poll(&mut channel, &mut chunk, command)?;
            let err_progress = stderr.poll(&mut channel, &mut chunk, command)?;
            if !out_progress && !err_progress {
                thread::sleep(self.idle_backoff);
            }
        }

        debug!(command, "remote command finished; draining streams");
        while stdout.open || stderr.open {
            stdout.drain(&mut channel, &mut chunk, command)?;
            stderr.drain(&mut channel, &mut chunk, command)?;
        }

        Ok(ExecutionResult {
            exit_code: channel.exit_status(),
            stdout: stdout.into_text(),
            stderr: stderr.into_text(),
        })
    }
}

/// Accumulated bytes and open/closed state for one stream.
struct StreamCapture {
    kind: StreamKind,
    open: bool,
    bytes: Vec<u8>,
}

impl StreamCapture {
    const fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            open: true,
            bytes: Vec::new(),
        }
    }

    /// Non-blocking step: reads only when the channel reports the stream
    /// ready. Returns `true` when bytes were appended.
    fn poll<C: ExecChannel>(
        &mut self,
        channel: &mut C,
        chunk: &mut [u8],
        command: &str,
    ) -> Result<bool, ExecError> {
        if !self.open || !channel.ready(self.kind) {
            return Ok(false);
        }
        self.read_once(channel, chunk, command)
    }

    /// Blocking step used once the command has finished.
    fn drain<C: ExecChannel>(
        &mut self,
        channel: &mut C,
        chunk: &mut [u8],
        command: &str,
    ) -> Result<(), ExecError> {
        if self.open {
            self.read_once(channel, chunk, command)?;
        }
        Ok(())
    }

    fn read_once<C: ExecChannel>(
        &mut self,
        channel: &mut C,
        chunk: &mut [u8],
        command: &str,
    ) -> Result<bool, ExecError> {
        let count = channel
            .read(self.kind, chunk)
            .map_err(|err| ExecError::Read {
                command: command.to_owned(),
                stream: self.kind,
                message: err.to_string(),
            })?;
        if count == 0 {
            self.open = false;
            return Ok(false);
        }
        if let Some(data) = chunk.get(..count) {
            self.bytes.extend_from_slice(data);
        }
        Ok(true)
    }

    fn into_text(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
