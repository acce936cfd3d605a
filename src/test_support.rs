//! Test support utilities shared across unit and integration tests.
//!
//! Every double records what it was asked to do so tests can assert on the
//! order of provider, shell, broker, and storage calls through one
//! [`CallLog`].

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard as StdGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::backend::{
    BackendFuture, ComputeBackend, Credential, CredentialRequest, InstanceState, InstanceStatus,
    LaunchRequest, LaunchedInstance,
};
use crate::cleanup::{ErrorObserver, ObserveFuture};
use crate::exec::{ExecChannel, ExecError, ExecSession, StreamKind};
use crate::notify::{Notifier, NotifyError};
use crate::pubsub::{PubSub, PubSubError, Subscription};
use crate::script::{DEFAULT_REMOTE_ROOT, ScriptInputs};
use crate::session::{BuildSettings, TimeoutPolicy};
use crate::ssh::{CommandOutput, CommandRunner, ShellConnector, ShellError, ShellSession};
use crate::storage::{BlobStore, StorageError};

/// Address the fake provider assigns to every instance.
pub const FAKE_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

/// Identifier the fake provider assigns to every instance.
pub const FAKE_INSTANCE_ID: &str = "srv-1";

/// Identifier the fake provider assigns to every credential.
pub const FAKE_CREDENTIAL_ID: &str = "key-1";

fn locked<T>(mutex: &Mutex<T>) -> StdGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes written to standard input, if any.
    pub input: Option<Vec<u8>>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn respond(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, ShellError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            input: input.map(<[u8]>::to_vec),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| ShellError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        self.respond(program, args, None)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        input: &[u8],
    ) -> Result<CommandOutput, ShellError> {
        self.respond(program, args, Some(input))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct ScriptedChunk {
    kind: StreamKind,
    visible_after: u64,
    bytes: Vec<u8>,
}

/// Channel replaying pre-arranged output.
///
/// The exit status becomes ready after a fixed number of polls. Each chunk
/// becomes readable once that many polls have happened, or once the
/// command has finished for chunks registered with
/// [`ScriptedChannel::with_late`].
#[derive(Clone, Debug)]
pub struct ScriptedChannel {
    finish_after: u64,
    polls: u64,
    exit_code: Option<i32>,
    chunks: VecDeque<ScriptedChunk>,
    failing: Option<StreamKind>,
}

impl ScriptedChannel {
    /// Channel whose command finishes on poll `polls + 1`.
    #[must_use]
    pub const fn finishing_after(polls: u64) -> Self {
        Self {
            finish_after: polls,
            polls: 0,
            exit_code: Some(0),
            chunks: VecDeque::new(),
            failing: None,
        }
    }

    /// Channel whose command never finishes.
    #[must_use]
    pub const fn never_finishing() -> Self {
        Self::finishing_after(u64::MAX)
    }

    /// Adds a chunk readable once `visible_after` polls have happened.
    #[must_use]
    pub fn with_chunk(mut self, kind: StreamKind, visible_after: u64, text: &str) -> Self {
        self.chunks.push_back(ScriptedChunk {
            kind,
            visible_after,
            bytes: text.as_bytes().to_vec(),
        });
        self
    }

    /// Adds text readable only after the exit status is ready.
    #[must_use]
    pub fn with_late(self, kind: StreamKind, text: &str) -> Self {
        self.with_late_bytes(kind, text.as_bytes().to_vec())
    }

    /// Adds raw bytes readable only after the exit status is ready.
    #[must_use]
    pub fn with_late_bytes(mut self, kind: StreamKind, bytes: Vec<u8>) -> Self {
        self.chunks.push_back(ScriptedChunk {
            kind,
            visible_after: u64::MAX,
            bytes,
        });
        self
    }

    /// Sets the reported exit code.
    #[must_use]
    pub const fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Makes every read of `kind` fail.
    #[must_use]
    pub const fn with_failing_reads(mut self, kind: StreamKind) -> Self {
        self.failing = Some(kind);
        self
    }

    const fn finished(&self) -> bool {
        self.polls > self.finish_after
    }

    fn front_of(&self, kind: StreamKind) -> Option<&ScriptedChunk> {
        self.chunks.iter().find(|chunk| chunk.kind == kind)
    }

    fn visible(&self, chunk: &ScriptedChunk) -> bool {
        self.finished() || self.polls >= chunk.visible_after
    }
}

impl ExecChannel for ScriptedChannel {
    fn exit_status_ready(&mut self) -> bool {
        self.polls = self.polls.saturating_add(1);
        self.finished()
    }

    fn exit_status(&mut self) -> Option<i32> {
        self.exit_code
    }

    fn ready(&mut self, stream: StreamKind) -> bool {
        if self.failing == Some(stream) {
            return true;
        }
        self.front_of(stream)
            .map_or_else(|| self.finished(), |chunk| self.visible(chunk))
    }

    fn read(&mut self, stream: StreamKind, buf: &mut [u8]) -> io::Result<usize> {
        if self.failing == Some(stream) {
            return Err(io::Error::other("simulated read failure"));
        }
        let Some(position) = self.chunks.iter().position(|chunk| chunk.kind == stream) else {
            return Ok(0);
        };
        let visible = self
            .chunks
            .get(position)
            .is_some_and(|chunk| self.visible(chunk));
        if !visible {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let Some(chunk) = self.chunks.get_mut(position) else {
            return Ok(0);
        };
        let count = chunk.bytes.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(chunk.bytes.drain(..count)) {
            *slot = byte;
        }
        if chunk.bytes.is_empty() {
            self.chunks.remove(position);
        }
        Ok(count)
    }
}

/// Session handing out copies of one [`ScriptedChannel`].
#[derive(Clone, Debug)]
pub struct ScriptedSession {
    channel: ScriptedChannel,
    active: bool,
    commands: Vec<String>,
}

impl ScriptedSession {
    /// Creates a connected session.
    #[must_use]
    pub const fn new(channel: ScriptedChannel) -> Self {
        Self {
            channel,
            active: true,
            commands: Vec::new(),
        }
    }

    /// Marks the session as disconnected.
    #[must_use]
    pub const fn disconnected(mut self) -> Self {
        self.active = false;
        self
    }

    /// Commands started on this session.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.clone()
    }
}

impl ExecSession for ScriptedSession {
    type Channel = ScriptedChannel;

    fn is_active(&self) -> bool {
        self.active
    }

    fn open_channel(
        &mut self,
        command: &str,
        _open_timeout: Duration,
    ) -> Result<Self::Channel, ExecError> {
        self.commands.push(command.to_owned());
        Ok(self.channel.clone())
    }
}

/// Observer that keeps the rendered text of every observed error.
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingObserver {
    /// Creates an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observed errors in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        locked(&self.messages).clone()
    }
}

impl ErrorObserver for RecordingObserver {
    fn observe<'a>(
        &'a self,
        _context: &'a str,
        error: &'a (dyn std::error::Error + Send + Sync),
    ) -> ObserveFuture<'a> {
        Box::pin(async move {
            locked(&self.messages).push(error.to_string());
        })
    }
}

/// Ordered journal shared by the doubles below.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        locked(&self.entries).push(entry.into());
    }

    /// Entries in arrival order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        locked(&self.entries).clone()
    }

    /// Number of entries equal to `entry`.
    #[must_use]
    pub fn count(&self, entry: &str) -> usize {
        locked(&self.entries)
            .iter()
            .filter(|recorded| *recorded == entry)
            .count()
    }

    /// Entries other than status polls, which vary with timing.
    #[must_use]
    pub fn without_polls(&self) -> Vec<String> {
        locked(&self.entries)
            .iter()
            .filter(|entry| *entry != "describe_instance")
            .cloned()
            .collect()
    }
}

/// Provider operation a [`FakeBackend`] can be told to fail.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum BackendStep {
    /// `create_credential`.
    CreateCredential,
    /// `launch_instance`.
    Launch,
    /// `describe_instance`.
    Describe,
    /// `terminate_instance`.
    Terminate,
    /// `revoke_credential`.
    Revoke,
}

impl BackendStep {
    const fn as_str(self) -> &'static str {
        match self {
            Self::CreateCredential => "create_credential",
            Self::Launch => "launch_instance",
            Self::Describe => "describe_instance",
            Self::Terminate => "terminate_instance",
            Self::Revoke => "revoke_credential",
        }
    }
}

/// Failure returned by [`FakeBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("simulated provider failure in {step}")]
pub struct FakeBackendFailure {
    /// Operation that failed.
    pub step: &'static str,
}

#[derive(Debug)]
struct FakeBackendState {
    statuses: VecDeque<InstanceStatus>,
    after_terminate: InstanceStatus,
    terminated: bool,
    assigns_address: bool,
    failures: Vec<BackendStep>,
}

/// In-memory compute provider.
///
/// Instances launch `pending`; each status poll returns the next queued
/// status, repeating the last one. After termination polls return the
/// configured post-terminate status.
#[derive(Clone, Debug)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeBackendState>>,
    log: CallLog,
}

impl FakeBackend {
    /// Backend whose instance reports `running` on the first poll.
    #[must_use]
    pub fn new(log: &CallLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeBackendState {
                statuses: VecDeque::from([InstanceStatus::Running]),
                after_terminate: InstanceStatus::Terminated,
                terminated: false,
                assigns_address: true,
                failures: Vec::new(),
            })),
            log: log.clone(),
        }
    }

    /// Replaces the sequence of polled statuses.
    #[must_use]
    pub fn with_statuses(self, statuses: impl IntoIterator<Item = InstanceStatus>) -> Self {
        locked(&self.state).statuses = statuses.into_iter().collect();
        self
    }

    /// Status reported once the instance has been asked to terminate.
    #[must_use]
    pub fn with_terminate_status(self, status: InstanceStatus) -> Self {
        locked(&self.state).after_terminate = status;
        self
    }

    /// Instances never receive a private address.
    #[must_use]
    pub fn without_address(self) -> Self {
        locked(&self.state).assigns_address = false;
        self
    }

    /// Makes `step` fail every time it is called.
    #[must_use]
    pub fn failing_at(self, step: BackendStep) -> Self {
        let mut state = locked(&self.state);
        if !state.failures.contains(&step) {
            state.failures.push(step);
        }
        drop(state);
        self
    }

    fn enter(&self, step: BackendStep) -> Result<(), FakeBackendFailure> {
        self.log.record(step.as_str());
        if locked(&self.state).failures.contains(&step) {
            return Err(FakeBackendFailure {
                step: step.as_str(),
            });
        }
        Ok(())
    }

    fn current_state(&self) -> InstanceState {
        let mut state = locked(&self.state);
        let status = if state.terminated {
            state.after_terminate
        } else if state.statuses.len() > 1 {
            state.statuses.pop_front().unwrap_or_default()
        } else {
            state.statuses.front().copied().unwrap_or_default()
        };
        let private_address = (state.assigns_address
            && matches!(status, InstanceStatus::Running))
        .then_some(FAKE_ADDRESS);
        InstanceState {
            status,
            private_address,
        }
    }
}

impl ComputeBackend for FakeBackend {
    type Error = FakeBackendFailure;

    fn create_credential<'a>(
        &'a self,
        request: &'a CredentialRequest,
    ) -> BackendFuture<'a, Credential, Self::Error> {
        Box::pin(async move {
            self.enter(BackendStep::CreateCredential)?;
            Ok(Credential::new(
                FAKE_CREDENTIAL_ID,
                request.name.clone(),
                Utf8PathBuf::from("/tmp/kiln-test/id_ed25519"),
            ))
        })
    }

    fn launch_instance<'a>(
        &'a self,
        _request: &'a LaunchRequest,
        _credential: &'a Credential,
    ) -> BackendFuture<'a, LaunchedInstance, Self::Error> {
        Box::pin(async move {
            self.enter(BackendStep::Launch)?;
            Ok(LaunchedInstance {
                id: String::from(FAKE_INSTANCE_ID),
                private_address: None,
                status: InstanceStatus::Pending,
            })
        })
    }

    fn describe_instance<'a>(
        &'a self,
        _instance_id: &'a str,
    ) -> BackendFuture<'a, InstanceState, Self::Error> {
        Box::pin(async move {
            self.enter(BackendStep::Describe)?;
            Ok(self.current_state())
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        _instance_id: &'a str,
    ) -> BackendFuture<'a, InstanceStatus, Self::Error> {
        Box::pin(async move {
            self.enter(BackendStep::Terminate)?;
            let mut state = locked(&self.state);
            state.terminated = true;
            Ok(state.after_terminate)
        })
    }

    fn revoke_credential<'a>(
        &'a self,
        _credential: &'a Credential,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.enter(BackendStep::Revoke) })
    }
}

#[derive(Debug)]
struct ConnectorState {
    refusals_left: u32,
    channel: ScriptedChannel,
    uploads: Vec<(String, Vec<u8>)>,
}

/// Shell connector that refuses a configurable number of connections.
#[derive(Clone, Debug)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    log: CallLog,
}

impl FakeConnector {
    /// Connector accepting every connection; commands exit cleanly at once.
    #[must_use]
    pub fn new(log: &CallLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                refusals_left: 0,
                channel: ScriptedChannel::finishing_after(0)
                    .with_late(StreamKind::Stdout, "build ok\n")
                    .with_late(StreamKind::Stderr, "warning: cache cold\n"),
                uploads: Vec::new(),
            })),
            log: log.clone(),
        }
    }

    /// Refuses the first `count` connection attempts.
    #[must_use]
    pub fn refusing(self, count: u32) -> Self {
        locked(&self.state).refusals_left = count;
        self
    }

    /// Channel every executed command replays.
    #[must_use]
    pub fn with_channel(self, channel: ScriptedChannel) -> Self {
        locked(&self.state).channel = channel;
        self
    }

    /// Files uploaded so far, as `(path, contents)`.
    #[must_use]
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        locked(&self.state).uploads.clone()
    }
}

impl ShellConnector for FakeConnector {
    type Session = FakeShellSession;

    fn connect(
        &self,
        address: IpAddr,
        _credential: &Credential,
        _timeout: Duration,
    ) -> Result<Self::Session, ShellError> {
        self.log.record("connect");
        let mut state = locked(&self.state);
        if state.refusals_left > 0 {
            state.refusals_left -= 1;
            return Err(ShellError::Connect {
                destination: format!("root@{address}"),
                message: String::from("Connection refused"),
            });
        }
        Ok(FakeShellSession {
            inner: ScriptedSession::new(state.channel.clone()),
            state: Arc::clone(&self.state),
            log: self.log.clone(),
        })
    }
}

/// Session produced by [`FakeConnector`].
#[derive(Debug)]
pub struct FakeShellSession {
    inner: ScriptedSession,
    state: Arc<Mutex<ConnectorState>>,
    log: CallLog,
}

impl ExecSession for FakeShellSession {
    type Channel = ScriptedChannel;

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn open_channel(
        &mut self,
        command: &str,
        open_timeout: Duration,
    ) -> Result<Self::Channel, ExecError> {
        self.log.record(format!("exec {command}"));
        self.inner.open_channel(command, open_timeout)
    }
}

impl ShellSession for FakeShellSession {
    fn upload(&mut self, contents: &[u8], remote_path: &str) -> Result<(), ShellError> {
        self.log.record(format!("upload {remote_path}"));
        locked(&self.state)
            .uploads
            .push((remote_path.to_owned(), contents.to_vec()));
        Ok(())
    }

    fn set_executable(&mut self, remote_path: &str) -> Result<(), ShellError> {
        self.log.record(format!("chmod {remote_path}"));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    signals: bool,
    fail_subscribe: bool,
    fail_publish: bool,
    published: Vec<(String, String)>,
}

/// Broker whose subscriptions fire at once when signalling is enabled.
#[derive(Clone, Debug)]
pub struct FakePubSub {
    state: Arc<Mutex<BrokerState>>,
    log: CallLog,
}

impl FakePubSub {
    /// Broker that delivers the readiness signal.
    #[must_use]
    pub fn new(log: &CallLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                signals: true,
                ..BrokerState::default()
            })),
            log: log.clone(),
        }
    }

    /// Subscriptions never receive a message.
    #[must_use]
    pub fn silent(self) -> Self {
        locked(&self.state).signals = false;
        self
    }

    /// Subscribing fails.
    #[must_use]
    pub fn failing_subscribe(self) -> Self {
        locked(&self.state).fail_subscribe = true;
        self
    }

    /// Publishing fails.
    #[must_use]
    pub fn failing_publish(self) -> Self {
        locked(&self.state).fail_publish = true;
        self
    }

    /// Messages published so far, as `(topic, payload)`.
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        locked(&self.state).published.clone()
    }
}

/// Subscription produced by [`FakePubSub`].
#[derive(Debug)]
pub struct FakeSubscription {
    pending: Option<String>,
}

impl Subscription for FakeSubscription {
    fn next_message(&mut self, wait: Duration) -> BackendFuture<'_, Option<String>, PubSubError> {
        Box::pin(async move {
            if let Some(payload) = self.pending.take() {
                return Ok(Some(payload));
            }
            tokio::time::sleep(wait).await;
            Ok(None)
        })
    }
}

impl PubSub for FakePubSub {
    type Subscription = FakeSubscription;

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
    ) -> BackendFuture<'a, Self::Subscription, PubSubError> {
        Box::pin(async move {
            self.log.record(format!("subscribe {topic}"));
            let state = locked(&self.state);
            if state.fail_subscribe {
                return Err(PubSubError::Subscribe {
                    topic: topic.to_owned(),
                    message: String::from("broker unavailable"),
                });
            }
            Ok(FakeSubscription {
                pending: state.signals.then(|| String::from("1")),
            })
        })
    }

    fn publish<'a>(&'a self, topic: &'a str, payload: &'a str) -> BackendFuture<'a, (), PubSubError> {
        Box::pin(async move {
            self.log.record(format!("publish {topic}"));
            let mut state = locked(&self.state);
            if state.fail_publish {
                return Err(PubSubError::Publish {
                    topic: topic.to_owned(),
                    message: String::from("broker unavailable"),
                });
            }
            state
                .published
                .push((topic.to_owned(), payload.to_owned()));
            Ok(())
        })
    }
}

/// One object written to a [`MemoryBlobStore`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredBlob {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Object contents.
    pub bytes: Vec<u8>,
    /// Whether the caller asked for a durable write.
    pub synchronous: bool,
}

/// Blob store keeping objects in memory.
#[derive(Clone, Debug)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<Vec<StoredBlob>>>,
    failing: bool,
    log: CallLog,
}

impl MemoryBlobStore {
    /// Store accepting every write.
    #[must_use]
    pub fn new(log: &CallLog) -> Self {
        Self {
            blobs: Arc::default(),
            failing: false,
            log: log.clone(),
        }
    }

    /// Store rejecting every write.
    #[must_use]
    pub fn failing(log: &CallLog) -> Self {
        Self {
            failing: true,
            ..Self::new(log)
        }
    }

    /// Objects written so far.
    #[must_use]
    pub fn blobs(&self) -> Vec<StoredBlob> {
        locked(&self.blobs).clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload<'a>(
        &'a self,
        bytes: &'a [u8],
        bucket: &'a str,
        key: &'a str,
        synchronous: bool,
    ) -> BackendFuture<'a, (), StorageError> {
        Box::pin(async move {
            self.log.record(format!("store {key}"));
            if self.failing {
                return Err(StorageError::Write {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                    message: String::from("bucket unavailable"),
                });
            }
            locked(&self.blobs).push(StoredBlob {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                bytes: bytes.to_vec(),
                synchronous,
            });
            Ok(())
        })
    }
}

/// Notifier recording every message, optionally failing delivery.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
    failing: bool,
}

impl RecordingNotifier {
    /// Notifier that delivers successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier whose deliveries fail after being recorded.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Messages sent so far.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        locked(&self.messages).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send<'a>(&'a self, text: &'a str) -> BackendFuture<'a, (), NotifyError> {
        Box::pin(async move {
            locked(&self.messages).push(text.to_owned());
            if self.failing {
                return Err(NotifyError::Transport(String::from("simulated outage")));
            }
            Ok(())
        })
    }
}

/// Temporary script folder with a config and repository file.
///
/// Layout: `scripts/build/main.sh`, `scripts/build/lib/env.sh`,
/// `config.sh`, and `repo.sh`.
#[derive(Debug)]
pub struct ScriptTree {
    _dir: TempDir,
    inputs: ScriptInputs,
}

impl ScriptTree {
    /// Writes the tree into a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the directory cannot be populated.
    pub fn new() -> io::Result<Self> {
        let dir = TempDir::new()?;
        let root_path = Utf8Path::from_path(dir.path())
            .ok_or_else(|| io::Error::other("temporary directory is not UTF-8"))?
            .to_path_buf();
        let root = Dir::open_ambient_dir(&root_path, ambient_authority())?;
        root.create_dir_all("scripts/build/lib")?;
        root.write("scripts/build/main.sh", "#!/bin/bash\nsource config.sh\necho 'building'\n")?;
        root.write("scripts/build/lib/env.sh", "export RUST_LOG=info\n")?;
        root.write("config.sh", "export APP=frontend\n")?;
        root.write("repo.sh", "git clone \"$REPO\" app\n")?;
        Ok(Self {
            inputs: ScriptInputs {
                script_folder: root_path.join("scripts/build"),
                config_file: root_path.join("config.sh"),
                repo_file: root_path.join("repo.sh"),
                remote_root: String::from(DEFAULT_REMOTE_ROOT),
            },
            _dir: dir,
        })
    }

    /// Inputs pointing at the tree.
    #[must_use]
    pub const fn inputs(&self) -> &ScriptInputs {
        &self.inputs
    }
}

/// Policy with waits short enough for tests.
#[must_use]
pub const fn fast_policy() -> TimeoutPolicy {
    TimeoutPolicy {
        connect_timeout: Duration::from_secs(1),
        connect_attempts: 3,
        connect_backoff: Duration::from_millis(1),
        command_timeout: Duration::from_secs(5),
        channel_open_timeout: Duration::from_secs(1),
        output_poll_interval: Duration::from_millis(1),
        start_timeout: Duration::from_millis(200),
        terminate_timeout: Duration::from_millis(200),
        status_poll_interval: Duration::from_millis(5),
        script_timeout: Duration::from_secs(5),
        readiness_timeout: Duration::from_millis(200),
    }
}

/// Settings for a run against the doubles in this module.
#[must_use]
pub fn test_settings(script: &ScriptInputs) -> BuildSettings {
    BuildSettings {
        app_name: String::from("frontend-ssr-web"),
        script: script.clone(),
        launch: LaunchRequest {
            image_id: String::from("img-1"),
            subnet_id: String::from("pn-1"),
            security_group_id: String::from("sg-1"),
            instance_type: String::from("COPARM1-16C-64G"),
            instance_profile: String::from("proj-1"),
            volume: crate::backend::VolumeSpec { size_gb: 32 },
            tags: vec![crate::backend::ResourceTag::new(
                "Name",
                "frontend-ssr-web build",
            )],
        },
        remote_script_path: String::from("/root/initial_script.sh"),
        ready_topic: String::from("updates:frontend-ssr-web:build_ready"),
        update_topic: String::from("updates:frontend-ssr-web:do_update"),
        log_bucket: String::from("builds"),
        stdout_key: String::from("builds/frontend-ssr-web/build-stdout.txt"),
        stderr_key: String::from("builds/frontend-ssr-web/build-stderr.txt"),
        policy: fast_policy(),
    }
}
