//! Error types for the Scaleway backend.

use crate::backend::BackendError;
use crate::config::ConfigError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid launch request: {0}")]
    Validation(String),
    /// Raised when the build key pair cannot be generated locally.
    #[error("failed to generate key pair {name}: {message}")]
    KeyGeneration {
        /// Name the key was to be registered under.
        name: String,
        /// Diagnostic from `ssh-keygen` or the filesystem.
        message: String,
    },
    /// Raised when an HTTP call is answered with a failure status.
    #[error("{operation} rejected with status {status}: {message}")]
    Api {
        /// API operation that failed.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// Raised when the instance is created but cannot be started; the
    /// instance has already been deleted again.
    #[error("instance {instance_id} could not be started: {message}")]
    StartFailed {
        /// Provider instance identifier.
        instance_id: String,
        /// Failure that stopped the start sequence.
        message: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK or transport.
        message: String,
    },
}

impl ScalewayBackendError {
    pub(crate) fn provider(err: &impl std::error::Error) -> Self {
        Self::Provider {
            message: err.to_string(),
        }
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::provider(&value)
    }
}

impl From<BackendError> for ScalewayBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
