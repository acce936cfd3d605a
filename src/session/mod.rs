//! Build session state machine.
//!
//! One run walks the states below in order. Every state that acquires a
//! resource registers the matching release on a [`CleanupStack`] as soon as
//! the acquisition succeeds, so a later failure unwinds exactly what exists.
//!
//! 1. render the script (dry runs stop here)
//! 2. create the ephemeral credential
//! 3. launch the instance
//! 4. wait for `running`
//! 5. start the readiness wait, then connect, upload, and execute on a
//!    worker thread
//! 6. wait for the readiness signal
//! 7. store the captured logs
//! 8. unwind every registered action
//! 9. tell downstream consumers a new build exists

use std::net::IpAddr;
use std::time::Instant;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{
    ComputeBackend, Credential, CredentialRequest, InstanceState, InstanceStatus, LaunchRequest,
    LaunchedInstance,
};
use crate::cleanup::CleanupStack;
use crate::exec::{CancelFlag, ExecutionResult};
use crate::notify::{Notifier, OpsReporter, notify_best_effort};
use crate::pubsub::PubSub;
use crate::script::{ScriptInputs, render_script};
use crate::ssh::ShellConnector;
use crate::storage::BlobStore;

mod error;
mod policy;
mod readiness;
mod remote;

pub use error::{BuildError, ErrorKind, WaitPoint};
pub use policy::TimeoutPolicy;
pub use readiness::{ReadinessCanceller, ReadinessWait};

use remote::{RemoteJob, run_remote_job};

/// Payload published on the update topic.
pub const UPDATE_PAYLOAD: &str = "1";

/// Resolved inputs for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSettings {
    /// Application name used in credential names and notifications.
    pub app_name: String,
    /// Local script inputs.
    pub script: ScriptInputs,
    /// Instance to launch.
    pub launch: LaunchRequest,
    /// Remote path of the uploaded script.
    pub remote_script_path: String,
    /// Topic carrying the readiness signal.
    pub ready_topic: String,
    /// Topic notified after teardown.
    pub update_topic: String,
    /// Bucket receiving harvested logs.
    pub log_bucket: String,
    /// Key of the captured standard output.
    pub stdout_key: String,
    /// Key of the captured standard error.
    pub stderr_key: String,
    /// Limits for every wait.
    pub policy: TimeoutPolicy,
}

/// Whether a run executes or only renders the script.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunMode {
    /// Provision, execute, and tear down.
    Execute,
    /// Render the script and stop.
    DryRun,
}

impl RunMode {
    /// Maps the `--dry-run` flag.
    #[must_use]
    pub const fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { Self::DryRun } else { Self::Execute }
    }
}

/// What a run learned about the resources it provisioned.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildSession {
    /// Provider identifier of the instance, once launched.
    pub instance_id: Option<String>,
    /// Private address of the instance, once known.
    pub private_address: Option<IpAddr>,
    /// Last observed instance status.
    pub status: InstanceStatus,
    /// Provider identifier of the credential, once created.
    pub credential_id: Option<String>,
}

/// Where the captured output was stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HarvestedLogs {
    /// Bucket holding both logs.
    pub bucket: String,
    /// Key of the standard output log.
    pub stdout_key: String,
    /// Key of the standard error log.
    pub stderr_key: String,
    /// Captured execution result.
    pub result: ExecutionResult,
}

/// Successful end states of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildOutcome {
    /// Every state completed and teardown succeeded.
    Completed {
        /// Resources the run provisioned.
        session: BuildSession,
        /// Stored logs.
        logs: HarvestedLogs,
    },
    /// Only the script was rendered.
    DryRunCompleted {
        /// Rendered script.
        script: String,
    },
}

/// Renders the provisioning script and stops. No collaborator is needed, so
/// callers without provider settings can use this directly.
///
/// # Errors
///
/// Returns [`BuildError::Script`] when a script input cannot be read.
pub fn dry_run(settings: &BuildSettings) -> Result<BuildOutcome, BuildError> {
    let script = generate_script(settings)?;
    info!(state = "dry_run_completed", bytes = script.len(), "dry run finished");
    Ok(BuildOutcome::DryRunCompleted { script })
}

fn generate_script(settings: &BuildSettings) -> Result<String, BuildError> {
    info!(state = "generate_script", "rendering provisioning script");
    render_script(&settings.script).map_err(BuildError::from)
}

/// Drives one build run against its collaborators.
#[derive(Debug)]
pub struct BuildPipeline<B, C, P, S, N> {
    settings: BuildSettings,
    backend: B,
    connector: C,
    pubsub: P,
    store: S,
    notifier: N,
}

impl<B, C, P, S, N> BuildPipeline<B, C, P, S, N>
where
    B: ComputeBackend,
    C: ShellConnector,
    P: PubSub,
    S: BlobStore,
    N: Notifier,
{
    /// Creates a pipeline. No collaborator is contacted until
    /// [`BuildPipeline::run`] executes.
    #[must_use]
    pub const fn new(
        settings: BuildSettings,
        backend: B,
        connector: C,
        pubsub: P,
        store: S,
        notifier: N,
    ) -> Self {
        Self {
            settings,
            backend,
            connector,
            pubsub,
            store,
            notifier,
        }
    }

    /// Settings this pipeline runs with.
    #[must_use]
    pub const fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Runs the build.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a gated state, or a
    /// [`BuildError::Cleanup`] when a compensating action failed (carrying
    /// the triggering failure, if there was one).
    pub async fn run(&self, mode: RunMode) -> Result<BuildOutcome, BuildError> {
        if mode == RunMode::DryRun {
            return dry_run(&self.settings);
        }
        let script = generate_script(&self.settings)?;

        let reporter = OpsReporter::new(&self.notifier);
        let mut session = BuildSession::default();
        let mut stack = CleanupStack::new();
        let scoped = self
            .provision_and_build(&script, &mut session, &mut stack)
            .await;

        info!(state = "unwind", actions = stack.len(), "releasing build resources");
        self.notify("Cleaning up build resources").await;
        let logs = stack.unwind(scoped, &reporter).await?;

        info!(
            state = "notify_downstream",
            topic = %self.settings.update_topic,
            "announcing new build"
        );
        self.pubsub
            .publish(&self.settings.update_topic, UPDATE_PAYLOAD)
            .await?;
        self.notify("Build complete").await;
        Ok(BuildOutcome::Completed { session, logs })
    }

    async fn provision_and_build<'a>(
        &'a self,
        script: &str,
        session: &mut BuildSession,
        stack: &mut CleanupStack<'a, BuildError>,
    ) -> Result<HarvestedLogs, BuildError> {
        info!(state = "provision_credential", "creating build credential");
        let request = CredentialRequest {
            name: format!(
                "key-{}-build-{}",
                self.settings.app_name,
                Uuid::new_v4().simple()
            ),
            scope: self.settings.launch.instance_profile.clone(),
            tags: self.settings.launch.tags.clone(),
        };
        let credential = self
            .backend
            .create_credential(&request)
            .await
            .map_err(|err| BuildError::provisioning("create credential", &err))?;
        session.credential_id = Some(credential.id.clone());
        self.notify(&format!("Generated key pair {}", credential.name))
            .await;
        let revoked = credential.clone();
        stack.push(format!("revoke credential {}", credential.name), move || async move {
            self.revoke(&revoked).await
        });

        info!(state = "provision_instance", "launching build instance");
        let instance = self
            .backend
            .launch_instance(&self.settings.launch, &credential)
            .await
            .map_err(|err| BuildError::provisioning("launch instance", &err))?;
        session.instance_id = Some(instance.id.clone());
        session.status = instance.status;
        session.private_address = instance.private_address;
        info!(instance_id = %instance.id, "instance launched");
        self.notify(&format!("Launched instance {}", instance.id))
            .await;
        let terminated = instance.id.clone();
        stack.push(format!("terminate instance {}", instance.id), move || async move {
            self.terminate_and_confirm(&terminated).await
        });

        let address = self.wait_running(&instance, session).await?;

        info!(state = "execute", address = %address, "starting remote execution");
        let subscription = self.pubsub.subscribe(&self.settings.ready_topic).await?;
        let readiness = ReadinessWait::spawn(subscription, self.settings.ready_topic.clone());
        let canceller = readiness.canceller();
        stack.push("cancel readiness wait", move || async move {
            canceller.cancel();
            Ok(())
        });
        let result = self
            .execute_remote(RemoteJob {
                address,
                credential,
                script: script.to_owned(),
                remote_path: self.settings.remote_script_path.clone(),
                policy: self.settings.policy,
                cancel: CancelFlag::new(),
            })
            .await?;

        info!(state = "await_readiness", topic = %self.settings.ready_topic, "waiting for readiness signal");
        self.notify("Waiting for build to report ready").await;
        if let Err(err) = readiness.wait(self.settings.policy.readiness_timeout).await {
            if matches!(err, BuildError::Timeout { .. }) {
                self.notify("Timed out waiting for build to report ready")
                    .await;
            }
            return Err(err);
        }
        self.notify("Build reported ready").await;

        info!(state = "harvest_logs", bucket = %self.settings.log_bucket, "storing build logs");
        self.harvest(result).await
    }

    async fn wait_running(
        &self,
        instance: &LaunchedInstance,
        session: &mut BuildSession,
    ) -> Result<IpAddr, BuildError> {
        info!(state = "wait_running", instance_id = %instance.id, "waiting for instance to start");
        let policy = &self.settings.policy;
        let deadline = Instant::now() + policy.start_timeout;
        let mut state = InstanceState {
            status: instance.status,
            private_address: instance.private_address,
        };
        loop {
            if state.status != session.status {
                info!(instance_id = %instance.id, status = %state.status, "instance status changed");
                self.notify(&format!("Instance {} is now {}", instance.id, state.status))
                    .await;
                session.status = state.status;
            }
            if let Some(address) = state.private_address {
                session.private_address = Some(address);
            }

            if state.status == InstanceStatus::Running {
                return session
                    .private_address
                    .ok_or_else(|| BuildError::MissingAddress {
                        instance_id: instance.id.clone(),
                    });
            }
            if state.status.is_terminal() {
                return Err(BuildError::InstanceLost {
                    instance_id: instance.id.clone(),
                    status: state.status,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(instance_id = %instance.id, "instance did not start in time");
                self.notify(&format!(
                    "Timed out waiting for instance {} to start",
                    instance.id
                ))
                .await;
                return Err(BuildError::Timeout {
                    point: WaitPoint::InstanceStart,
                    timeout: policy.start_timeout,
                });
            }
            sleep(policy.status_poll_interval.min(deadline - now)).await;
            state = self
                .backend
                .describe_instance(&instance.id)
                .await
                .map_err(|err| BuildError::provisioning("describe instance", &err))?;
        }
    }

    async fn execute_remote(&self, job: RemoteJob) -> Result<ExecutionResult, BuildError> {
        let limit = job.policy.script_timeout;
        let cancel = job.cancel.clone();
        let connector = self.connector.clone();
        let worker = tokio::task::spawn_blocking(move || run_remote_job(&connector, &job));
        match timeout(limit, worker).await {
            Err(_) => {
                cancel.cancel();
                warn!(timeout_ms = limit.as_millis(), "provisioning script timed out");
                self.notify("Timed out waiting for the provisioning script")
                    .await;
                Err(BuildError::Timeout {
                    point: WaitPoint::ScriptExecution,
                    timeout: limit,
                })
            }
            Ok(Err(join)) => Err(BuildError::Worker(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    async fn harvest(&self, result: ExecutionResult) -> Result<HarvestedLogs, BuildError> {
        let bucket = &self.settings.log_bucket;
        self.notify(&format!(
            "Storing build logs in {bucket}/{}",
            self.settings.stdout_key
        ))
        .await;
        self.store
            .upload(result.stdout.as_bytes(), bucket, &self.settings.stdout_key, true)
            .await?;
        self.store
            .upload(result.stderr.as_bytes(), bucket, &self.settings.stderr_key, true)
            .await?;
        Ok(HarvestedLogs {
            bucket: bucket.clone(),
            stdout_key: self.settings.stdout_key.clone(),
            stderr_key: self.settings.stderr_key.clone(),
            result,
        })
    }

    async fn revoke(&self, credential: &Credential) -> Result<(), BuildError> {
        self.backend
            .revoke_credential(credential)
            .await
            .map_err(|err| BuildError::provisioning("revoke credential", &err))?;
        info!(credential = %credential.name, "credential revoked");
        self.notify(&format!("Deleted key pair {}", credential.name))
            .await;
        Ok(())
    }

    async fn terminate_and_confirm(&self, instance_id: &str) -> Result<(), BuildError> {
        let policy = &self.settings.policy;
        self.notify(&format!("Terminating instance {instance_id}"))
            .await;
        let mut status = self
            .backend
            .terminate_instance(instance_id)
            .await
            .map_err(|err| BuildError::provisioning("terminate instance", &err))?;
        let deadline = Instant::now() + policy.terminate_timeout;
        while !status.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    instance_id,
                    timeout_secs = policy.terminate_timeout.as_secs(),
                    "termination not confirmed in time"
                );
                self.notify(&format!(
                    "Timed out waiting for instance {instance_id} to terminate"
                ))
                .await;
                return Ok(());
            }
            sleep(policy.status_poll_interval.min(deadline - now)).await;
            status = self
                .backend
                .describe_instance(instance_id)
                .await
                .map_err(|err| BuildError::provisioning("describe instance", &err))?
                .status;
        }
        info!(instance_id, status = %status, "instance terminated");
        self.notify(&format!("Terminated instance {instance_id}"))
            .await;
        Ok(())
    }

    async fn notify(&self, text: &str) {
        notify_best_effort(&self.notifier, text).await;
    }
}

#[cfg(test)]
mod tests;
