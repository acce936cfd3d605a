//! Blocking shell work run on a worker thread: connect with retries, place
//! the script, and execute it.

use std::net::IpAddr;
use std::thread;

use tracing::{debug, info, warn};

use super::error::BuildError;
use super::policy::TimeoutPolicy;
use crate::backend::Credential;
use crate::exec::{CancelFlag, CommandExecutor, ExecError, ExecutionResult};
use crate::ssh::{ShellConnector, ShellError, ShellSession};

/// Everything the worker needs, owned so it can cross threads.
#[derive(Clone, Debug)]
pub(crate) struct RemoteJob {
    pub(crate) address: IpAddr,
    pub(crate) credential: Credential,
    pub(crate) script: String,
    pub(crate) remote_path: String,
    pub(crate) policy: TimeoutPolicy,
    /// Raised by the pipeline when it stops waiting for this job.
    pub(crate) cancel: CancelFlag,
}

impl RemoteJob {
    /// Command that runs the uploaded script.
    pub(crate) fn command(&self) -> String {
        format!("sudo bash {}", self.remote_path)
    }

    fn cancelled(&self) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            debug!(address = %self.address, "remote job abandoned");
            return Err(ExecError::Cancelled {
                command: self.command(),
            }
            .into());
        }
        Ok(())
    }
}

/// Connects, uploads, and runs the script.
///
/// Every failure while connecting or placing the script is retried; the host
/// refuses connections for a while after it reports `running`. The job stops
/// between attempts and between output polls once its cancel flag is raised.
pub(crate) fn run_remote_job<C: ShellConnector>(
    connector: &C,
    job: &RemoteJob,
) -> Result<ExecutionResult, BuildError> {
    let mut session = connect_and_place(connector, job)?;
    job.cancelled()?;
    let executor = CommandExecutor::new()
        .with_command_timeout(job.policy.command_timeout.min(job.policy.script_timeout))
        .with_open_timeout(job.policy.channel_open_timeout)
        .with_idle_backoff(job.policy.output_poll_interval)
        .with_cancel_flag(job.cancel.clone());
    let command = job.command();
    info!(command = %command, "running provisioning script");
    let result = executor.execute(&mut session, &command)?;
    match result.exit_code {
        Some(0) => info!("provisioning script exited cleanly"),
        Some(code) => warn!(code, "provisioning script exited with non-zero status"),
        None => warn!("provisioning script reported no exit status"),
    }
    Ok(result)
}

fn connect_and_place<C: ShellConnector>(
    connector: &C,
    job: &RemoteJob,
) -> Result<C::Session, BuildError> {
    let attempts = job.policy.connect_attempts.max(1);
    let mut last_error: Option<ShellError> = None;
    for attempt in 1..=attempts {
        job.cancelled()?;
        match place_script(connector, job) {
            Ok(session) => {
                info!(attempt, address = %job.address, "script uploaded");
                return Ok(session);
            }
            Err(err) => {
                if attempt == 1 {
                    debug!(attempt, error = %err, "build host not reachable yet");
                } else {
                    warn!(attempt, attempts, error = %err, "build host not reachable yet");
                }
                last_error = Some(err);
            }
        }
        if attempt < attempts {
            thread::sleep(job.policy.connect_backoff);
        }
    }
    Err(BuildError::Unreachable {
        attempts,
        message: last_error.map_or_else(String::new, |err| err.to_string()),
    })
}

fn place_script<C: ShellConnector>(connector: &C, job: &RemoteJob) -> Result<C::Session, ShellError> {
    let mut session = connector.connect(job.address, &job.credential, job.policy.connect_timeout)?;
    session.upload(job.script.as_bytes(), &job.remote_path)?;
    session.set_executable(&job.remote_path)?;
    Ok(session)
}
