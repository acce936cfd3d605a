//! Scaleway implementation of the compute backend.
//!
//! Key registration, server creation, and status polling use the HTTP API
//! directly; power actions and deletion go through `scaleway-rs`.

mod error;
mod lifecycle;
mod types;

use scaleway_rs::ScalewayApi;

use crate::backend::{
    BackendFuture, ComputeBackend, Credential, CredentialRequest, InstanceState, InstanceStatus,
    LaunchRequest, LaunchedInstance,
};
use crate::config::ScalewayConfig;
use crate::ssh::{CommandRunner, ProcessCommandRunner};
use types::Zone;

pub use error::ScalewayBackendError;

const AUTH_HEADER: &str = "X-Auth-Token";

/// Backend that provisions build hosts through the Scaleway APIs.
#[derive(Clone)]
pub struct ScalewayBackend<R: CommandRunner = ProcessCommandRunner> {
    api: ScalewayApi,
    config: ScalewayConfig,
    runner: R,
}

impl ScalewayBackend<ProcessCommandRunner> {
    /// Constructs a backend that runs `ssh-keygen` as a child process.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        Self::with_runner(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> ScalewayBackend<R> {
    /// Constructs a backend with a custom command runner.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn with_runner(config: ScalewayConfig, runner: R) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            runner,
        })
    }

    fn zone(&self) -> Zone {
        Zone::from(self.config.default_zone.as_str())
    }

    fn api_base(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    fn instance_base(&self) -> String {
        format!("{}/instance/v1", self.api_base())
    }
}

impl<R: CommandRunner> ComputeBackend for ScalewayBackend<R> {
    type Error = ScalewayBackendError;

    fn create_credential<'a>(
        &'a self,
        request: &'a CredentialRequest,
    ) -> BackendFuture<'a, Credential, Self::Error> {
        Box::pin(async move { self.register_key(request).await })
    }

    fn launch_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
        _credential: &'a Credential,
    ) -> BackendFuture<'a, LaunchedInstance, Self::Error> {
        // Keys registered in the project are installed by the image at boot.
        Box::pin(async move { self.create_and_start(request).await })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, InstanceState, Self::Error> {
        Box::pin(async move { self.fetch_state(instance_id).await })
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, InstanceStatus, Self::Error> {
        Box::pin(async move { self.terminate(instance_id).await })
    }

    fn revoke_credential<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete_key(credential).await })
    }
}
