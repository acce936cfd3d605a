//! Secure shell access to the build host through the system `ssh` client.
//!
//! Connection probes, uploads, and permission changes are one-shot client
//! invocations run through a [`CommandRunner`]. Script execution spawns a
//! long-lived client whose piped streams back a [`ProcessChannel`].

use std::ffi::OsString;
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::time::Duration;

use shell_escape::unix::escape;
use tracing::debug;

use crate::backend::Credential;
use crate::exec::{ExecError, ExecSession};

mod channel;
mod config;
mod types;

pub use channel::ProcessChannel;
pub use config::{DEFAULT_SSH_USER, SshConfig};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, ShellError};

/// Opens shell sessions to a freshly booted host.
///
/// Connecting is blocking; callers dispatch it to a worker thread.
pub trait ShellConnector: Clone + Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: ShellSession + Send;

    /// Connects to `address` authenticating with `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError`] when the host does not accept the connection
    /// within `timeout`. Failures are expected while the host boots.
    fn connect(
        &self,
        address: IpAddr,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Self::Session, ShellError>;
}

/// An authenticated session able to place files and run commands.
pub trait ShellSession: ExecSession {
    /// Writes `contents` to `remote_path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError`] when the transfer fails.
    fn upload(&mut self, contents: &[u8], remote_path: &str) -> Result<(), ShellError>;

    /// Marks `remote_path` executable.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError`] when the permission change fails.
    fn set_executable(&mut self, remote_path: &str) -> Result<(), ShellError>;
}

/// Connector driving the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SystemSshConnector<R: CommandRunner + Clone = ProcessCommandRunner> {
    config: SshConfig,
    runner: R,
}

impl SystemSshConnector<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, ShellError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + Clone> SystemSshConnector<R> {
    /// Creates a connector using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidConfig`] when validation fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, ShellError> {
        config.validate()?;
        Ok(Self { config, runner })
    }
}

impl<R> ShellConnector for SystemSshConnector<R>
where
    R: CommandRunner + Clone + 'static,
{
    type Session = SystemSshSession<R>;

    fn connect(
        &self,
        address: IpAddr,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Self::Session, ShellError> {
        let session = SystemSshSession {
            config: self.config.clone(),
            runner: self.runner.clone(),
            credential: credential.clone(),
            destination: format!("{}@{address}", self.config.user),
            connect_timeout: timeout,
            active: false,
        };
        let mut args = session.client_args(timeout);
        args.push(OsString::from("true"));
        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        if !output.is_success() {
            return Err(ShellError::Connect {
                destination: session.destination,
                message: output.stderr.trim().to_owned(),
            });
        }
        debug!(destination = %session.destination, "shell session established");
        Ok(SystemSshSession {
            active: true,
            ..session
        })
    }
}

/// Session whose operations are individual `ssh` client invocations.
#[derive(Clone, Debug)]
pub struct SystemSshSession<R: CommandRunner> {
    config: SshConfig,
    runner: R,
    credential: Credential,
    destination: String,
    connect_timeout: Duration,
    active: bool,
}

impl<R: CommandRunner> SystemSshSession<R> {
    /// `user@host` this session talks to.
    #[must_use]
    pub const fn destination(&self) -> &str {
        self.destination.as_str()
    }

    /// Connect timeout applied to every follow-up `ssh` invocation.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn client_args(&self, connect_timeout: Duration) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
            OsString::from("-i"),
            OsString::from(self.credential.key_file.as_str()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                connect_timeout.as_secs().max(1)
            )),
        ];

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from(&self.destination));
        args
    }

    fn remote(
        &self,
        operation: String,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<(), ShellError> {
        let mut args = self.client_args(self.connect_timeout);
        args.push(OsString::from(command));
        let output = match input {
            Some(bytes) => self
                .runner
                .run_with_input(&self.config.ssh_bin, &args, bytes)?,
            None => self.runner.run(&self.config.ssh_bin, &args)?,
        };
        if output.is_success() {
            return Ok(());
        }
        Err(ShellError::CommandFailure {
            operation,
            destination: self.destination.clone(),
            status_text: output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr,
        })
    }
}

impl<R: CommandRunner> ExecSession for SystemSshSession<R> {
    type Channel = ProcessChannel;

    fn is_active(&self) -> bool {
        self.active
    }

    fn open_channel(
        &mut self,
        command: &str,
        open_timeout: Duration,
    ) -> Result<Self::Channel, ExecError> {
        let mut args = self.client_args(open_timeout);
        args.push(OsString::from(command));
        let channel_error = |message: String| ExecError::ChannelOpen {
            command: command.to_owned(),
            message,
        };
        let child = Command::new(&self.config.ssh_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| channel_error(err.to_string()))?;
        ProcessChannel::new(child).map_err(|err| channel_error(err.to_string()))
    }
}

impl<R: CommandRunner> ShellSession for SystemSshSession<R> {
    fn upload(&mut self, contents: &[u8], remote_path: &str) -> Result<(), ShellError> {
        let command = format!("cat > {}", escape(remote_path.into()));
        self.remote(format!("upload {remote_path}"), &command, Some(contents))
    }

    fn set_executable(&mut self, remote_path: &str) -> Result<(), ShellError> {
        let command = format!("chmod +x {}", escape(remote_path.into()));
        self.remote(format!("chmod {remote_path}"), &command, None)
    }
}
