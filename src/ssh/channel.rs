//! Dual-stream execution channel backed by a local client process.
//!
//! Each output pipe is pumped by a dedicated thread into a channel so the
//! executor can ask "is data available now?" without blocking.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use tracing::warn;

use crate::exec::{CHUNK_SIZE, ExecChannel, StreamKind};

/// Channel over a spawned process with piped stdout and stderr.
#[derive(Debug)]
pub struct ProcessChannel {
    child: Child,
    status: Option<ExitStatus>,
    finished: bool,
    stdout: StreamPump,
    stderr: StreamPump,
}

impl ProcessChannel {
    /// Wraps `child`, taking ownership of its stdout and stderr pipes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when either pipe was not configured as piped.
    pub fn new(mut child: Child) -> io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr is not piped"))?;
        Ok(Self {
            child,
            status: None,
            finished: false,
            stdout: StreamPump::spawn(stdout),
            stderr: StreamPump::spawn(stderr),
        })
    }

    const fn pump(&mut self, stream: StreamKind) -> &mut StreamPump {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }
}

impl ExecChannel for ProcessChannel {
    fn exit_status_ready(&mut self) -> bool {
        if self.finished {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                self.finished = true;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "failed to query client process status");
                self.finished = true;
            }
        }
        self.finished
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    fn ready(&mut self, stream: StreamKind) -> bool {
        self.pump(stream).ready()
    }

    fn read(&mut self, stream: StreamKind, buf: &mut [u8]) -> io::Result<usize> {
        self.pump(stream).read(buf)
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if !self.finished {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

#[derive(Debug)]
struct StreamPump {
    rx: Receiver<io::Result<Vec<u8>>>,
    pending: VecDeque<u8>,
    failure: Option<io::Error>,
    closed: bool,
}

impl StreamPump {
    fn spawn<R: Read + Send + 'static>(mut source: R) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = vec![0_u8; CHUNK_SIZE];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(count) => {
                        let chunk = buf.get(..count).map(<[u8]>::to_vec).unwrap_or_default();
                        if tx.send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        tx.send(Err(err)).ok();
                        break;
                    }
                }
            }
        });
        Self {
            rx,
            pending: VecDeque::new(),
            failure: None,
            closed: false,
        }
    }

    fn accept(&mut self, message: io::Result<Vec<u8>>) {
        match message {
            Ok(bytes) => self.pending.extend(bytes),
            Err(err) => self.failure = Some(err),
        }
    }

    fn ready(&mut self) -> bool {
        if !self.pending.is_empty() || self.failure.is_some() || self.closed {
            return true;
        }
        match self.rx.try_recv() {
            Ok(message) => {
                self.accept(message);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                true
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() && self.failure.is_none() && !self.closed {
            match self.rx.recv() {
                Ok(message) => self.accept(message),
                Err(_) => self.closed = true,
            }
        }
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        let count = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}
