//! Error type for build runs.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::InstanceStatus;
use crate::cleanup::UnwindError;
use crate::config::ConfigError;
use crate::exec::ExecError;
use crate::pubsub::PubSubError;
use crate::script::ScriptError;
use crate::storage::StorageError;

/// Wait that can expire fatally during a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitPoint {
    /// Host reaching `running`.
    InstanceStart,
    /// Provisioning script completing.
    ScriptExecution,
    /// Readiness signal arriving.
    Readiness,
}

impl fmt::Display for WaitPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InstanceStart => "instance start",
            Self::ScriptExecution => "script execution",
            Self::Readiness => "readiness signal",
        })
    }
}

/// Broad classification of a [`BuildError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Transient reachability problem that outlasted its retries.
    ConnectivityFailure,
    /// A bounded wait expired.
    Timeout,
    /// The shell session was unusable or the command could not run.
    RemoteExecutionFailure,
    /// The compute provider rejected a request.
    ProvisioningFailure,
    /// A compensating action failed during unwind.
    CleanupFailure,
    /// Settings were missing or invalid.
    Configuration,
    /// The provisioning script could not be rendered.
    Script,
    /// Logs could not be persisted.
    Storage,
}

/// Errors that end a build run.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Settings were missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The provisioning script could not be rendered.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// The compute provider rejected `operation`.
    #[error("{operation} failed: {message}")]
    Provisioning {
        /// Provider operation that failed.
        operation: &'static str,
        /// Provider error description.
        message: String,
    },
    /// The host reached a terminal status before becoming usable.
    #[error("instance {instance_id} became {status} while starting")]
    InstanceLost {
        /// Provider instance identifier.
        instance_id: String,
        /// Status reported by the provider.
        status: InstanceStatus,
    },
    /// The host is running but has no private address.
    #[error("instance {instance_id} has no private address")]
    MissingAddress {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// A bounded wait expired.
    #[error("timed out after {timeout:?} waiting for {point}")]
    Timeout {
        /// Wait that expired.
        point: WaitPoint,
        /// Limit that was exceeded.
        timeout: Duration,
    },
    /// Every shell connection attempt failed.
    #[error("could not reach the build host after {attempts} attempts: {message}")]
    Unreachable {
        /// Attempts made.
        attempts: u32,
        /// Last failure description.
        message: String,
    },
    /// The readiness channel failed.
    #[error(transparent)]
    Signal(#[from] PubSubError),
    /// The execution engine failed.
    #[error(transparent)]
    Remote(#[from] ExecError),
    /// The worker running the shell session died.
    #[error("shell worker failed: {0}")]
    Worker(String),
    /// Logs could not be persisted.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A compensating action failed during unwind.
    #[error("cleanup action '{label}' failed: {failure}{}", trigger_note(.trigger.as_deref()))]
    Cleanup {
        /// Label of the last failing action.
        label: String,
        /// Error raised by that action.
        #[source]
        failure: Box<BuildError>,
        /// Failure that started the unwind, if any.
        trigger: Option<Box<BuildError>>,
    },
}

fn trigger_note(trigger: Option<&BuildError>) -> String {
    trigger.map_or_else(String::new, |err| format!(" (unwinding after: {err})"))
}

impl BuildError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Script(_) => ErrorKind::Script,
            Self::Provisioning { .. } | Self::InstanceLost { .. } | Self::MissingAddress { .. } => {
                ErrorKind::ProvisioningFailure
            }
            Self::Timeout { .. } | Self::Remote(ExecError::ExecutionTimeout { .. }) => {
                ErrorKind::Timeout
            }
            Self::Unreachable { .. } | Self::Signal(_) => ErrorKind::ConnectivityFailure,
            Self::Remote(_) | Self::Worker(_) => ErrorKind::RemoteExecutionFailure,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cleanup { .. } => ErrorKind::CleanupFailure,
        }
    }

    /// Failure that started the unwind when this is a cleanup failure.
    #[must_use]
    pub fn trigger(&self) -> Option<&Self> {
        match self {
            Self::Cleanup { trigger, .. } => trigger.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn provisioning(operation: &'static str, err: &impl std::error::Error) -> Self {
        Self::Provisioning {
            operation,
            message: err.to_string(),
        }
    }
}

impl From<UnwindError<Self>> for BuildError {
    fn from(value: UnwindError<Self>) -> Self {
        match value {
            UnwindError::Body(err) => err,
            UnwindError::Cleanup {
                label,
                failure,
                trigger,
            } => Self::Cleanup {
                label,
                failure: Box::new(failure),
                trigger: trigger.map(Box::new),
            },
        }
    }
}
