//! Core library for the kiln build orchestrator.
//!
//! One run provisions an ephemeral build host with a throwaway credential,
//! uploads and executes a generated provisioning script over SSH, waits for
//! the host to announce readiness on a pub/sub topic, stores the captured
//! logs, and tears everything down in reverse order of acquisition.

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod exec;
pub mod notify;
pub mod pubsub;
pub mod scaleway;
pub mod script;
pub mod session;
pub mod ssh;
pub mod storage;
pub mod test_support;

pub use backend::{
    BackendError, ComputeBackend, Credential, CredentialRequest, InstanceState, InstanceStatus,
    LaunchRequest, LaunchRequestBuilder, LaunchedInstance, ResourceTag, VolumeSpec,
};
pub use cleanup::{CleanupStack, ErrorObserver, LogObserver, UnwindError};
pub use config::{BuildConfig, ConfigError, NotifyConfig, ScalewayConfig};
pub use exec::{CancelFlag, CommandExecutor, ExecError, ExecutionResult};
pub use notify::{Notifier, NotifyError, OpsNotifier};
pub use pubsub::{PubSub, PubSubError, RedisPubSub, Subscription};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};
pub use script::{ScriptError, ScriptInputs, render_script};
pub use session::{
    BuildError, BuildOutcome, BuildPipeline, BuildSession, BuildSettings, ErrorKind,
    HarvestedLogs, RunMode, TimeoutPolicy, WaitPoint, dry_run,
};
pub use ssh::{
    CommandOutput, CommandRunner, ProcessCommandRunner, ShellConnector, ShellError, SshConfig,
    SystemSshConnector,
};
pub use storage::{BlobStore, DirectoryBlobStore, StorageError};
