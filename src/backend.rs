//! Backend abstraction for provisioning the transient build host.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use thiserror::Error;

/// Lifecycle status reported by the compute provider.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InstanceStatus {
    /// Created but not yet usable (booting, stopping, powering on).
    Pending,
    /// Running and reachable on its private address.
    Running,
    /// Terminated by the provider or by an explicit request.
    Terminated,
    /// The provider no longer knows the instance.
    #[default]
    NonExistent,
}

impl InstanceStatus {
    /// Returns `true` for statuses an instance never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::NonExistent)
    }

    /// Lower-case name used in logs and notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::NonExistent => "non-existent",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key/value tag attached to provisioned resources.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl ResourceTag {
    /// Creates a tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Root volume attached to the build host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    /// Size in gigabytes.
    pub size_gb: u32,
}

/// Parameters for registering an ephemeral credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CredentialRequest {
    /// Name the credential is registered under.
    pub name: String,
    /// Identity scope (project or profile) owning the credential.
    pub scope: String,
    /// Tags attached to the registration.
    pub tags: Vec<ResourceTag>,
}

/// Parameters required to launch the build host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Machine image identifier.
    pub image_id: String,
    /// Network placement identifier.
    pub subnet_id: String,
    /// Security boundary identifier.
    pub security_group_id: String,
    /// Instance shape requested from the provider.
    pub instance_type: String,
    /// Identity the instance runs under.
    pub instance_profile: String,
    /// Root volume.
    pub volume: VolumeSpec,
    /// Tags used to identify the instance.
    pub tags: Vec<ResourceTag>,
}

impl LaunchRequest {
    /// Starts a builder for a [`LaunchRequest`].
    #[must_use]
    pub fn builder() -> LaunchRequestBuilder {
        LaunchRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any identifier is empty or
    /// the volume has no size.
    pub fn validate(&self) -> Result<(), BackendError> {
        let fields = [
            ("image_id", &self.image_id),
            ("subnet_id", &self.subnet_id),
            ("security_group_id", &self.security_group_id),
            ("instance_type", &self.instance_type),
            ("instance_profile", &self.instance_profile),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(BackendError::Validation(name.to_owned()));
            }
        }
        if self.volume.size_gb == 0 {
            return Err(BackendError::Validation(String::from("volume.size_gb")));
        }
        Ok(())
    }
}

/// Builder for [`LaunchRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequestBuilder {
    image_id: String,
    subnet_id: String,
    security_group_id: String,
    instance_type: String,
    instance_profile: String,
    volume_size_gb: u32,
    tags: Vec<ResourceTag>,
}

impl LaunchRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the machine image.
    #[must_use]
    pub fn image_id(mut self, value: impl Into<String>) -> Self {
        self.image_id = value.into();
        self
    }

    /// Sets the network placement.
    #[must_use]
    pub fn subnet_id(mut self, value: impl Into<String>) -> Self {
        self.subnet_id = value.into();
        self
    }

    /// Sets the security boundary.
    #[must_use]
    pub fn security_group_id(mut self, value: impl Into<String>) -> Self {
        self.security_group_id = value.into();
        self
    }

    /// Sets the instance shape.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the identity profile.
    #[must_use]
    pub fn instance_profile(mut self, value: impl Into<String>) -> Self {
        self.instance_profile = value.into();
        self
    }

    /// Sets the root volume size in gigabytes.
    #[must_use]
    pub const fn volume_size_gb(mut self, value: u32) -> Self {
        self.volume_size_gb = value;
        self
    }

    /// Appends a tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(ResourceTag::new(key, value));
        self
    }

    /// Builds and validates the [`LaunchRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<LaunchRequest, BackendError> {
        let request = LaunchRequest {
            image_id: self.image_id.trim().to_owned(),
            subnet_id: self.subnet_id.trim().to_owned(),
            security_group_id: self.security_group_id.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            instance_profile: self.instance_profile.trim().to_owned(),
            volume: VolumeSpec {
                size_gb: self.volume_size_gb,
            },
            tags: self.tags,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Ephemeral access credential registered with the provider.
///
/// The private key lives in a temporary directory owned by the credential;
/// the directory is removed when the last clone is dropped.
#[derive(Clone, Debug)]
pub struct Credential {
    /// Provider identifier of the registration.
    pub id: String,
    /// Name the credential was registered under.
    pub name: String,
    /// Private key used by the shell client.
    pub key_file: Utf8PathBuf,
    key_dir: Option<Arc<TempDir>>,
}

impl Credential {
    /// Creates a credential whose key file is managed by the caller.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, key_file: Utf8PathBuf) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            key_file,
            key_dir: None,
        }
    }

    /// Ties the credential to the temporary directory holding its key.
    #[must_use]
    pub fn with_key_dir(mut self, dir: TempDir) -> Self {
        self.key_dir = Some(Arc::new(dir));
        self
    }
}

/// Instance returned by a successful launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchedInstance {
    /// Provider specific identifier.
    pub id: String,
    /// Private network address, when already assigned.
    pub private_address: Option<IpAddr>,
    /// Status at launch time.
    pub status: InstanceStatus,
}

/// Point-in-time view of an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InstanceState {
    /// Current status.
    pub status: InstanceStatus,
    /// Private network address, when assigned.
    pub private_address: Option<IpAddr>,
}

impl InstanceState {
    /// State of an instance the provider does not know.
    #[must_use]
    pub const fn gone() -> Self {
        Self {
            status: InstanceStatus::NonExistent,
            private_address: None,
        }
    }
}

/// Errors raised by backend-independent request validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Interface implemented by compute providers.
pub trait ComputeBackend: Send + Sync {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Generates and registers an ephemeral credential.
    fn create_credential<'a>(
        &'a self,
        request: &'a CredentialRequest,
    ) -> BackendFuture<'a, Credential, Self::Error>;

    /// Launches an instance reachable with `credential`.
    fn launch_instance<'a>(
        &'a self,
        request: &'a LaunchRequest,
        credential: &'a Credential,
    ) -> BackendFuture<'a, LaunchedInstance, Self::Error>;

    /// Reports the current state of an instance.
    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, InstanceState, Self::Error>;

    /// Requests termination and returns the status reported afterwards.
    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BackendFuture<'a, InstanceStatus, Self::Error>;

    /// Removes the credential registration.
    fn revoke_credential<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BackendFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn complete() -> LaunchRequestBuilder {
        LaunchRequest::builder()
            .image_id(" img-1 ")
            .subnet_id("pn-1")
            .security_group_id("sg-1")
            .instance_type("COPARM1-16C-64G")
            .instance_profile("project-1")
            .volume_size_gb(32)
            .tag("Name", "frontend-ssr-web build")
    }

    #[rstest]
    fn build_trims_identifiers() {
        let request = complete().build().expect("request should build");
        assert_eq!(request.image_id, "img-1");
        assert_eq!(request.tags, vec![ResourceTag::new("Name", "frontend-ssr-web build")]);
    }

    #[rstest]
    #[case::image(complete().image_id("  "), "image_id")]
    #[case::subnet(complete().subnet_id(""), "subnet_id")]
    #[case::profile(complete().instance_profile(""), "instance_profile")]
    #[case::volume(complete().volume_size_gb(0), "volume.size_gb")]
    fn build_rejects_missing_fields(#[case] builder: LaunchRequestBuilder, #[case] field: &str) {
        let err = builder.build().expect_err("request should be rejected");
        assert_eq!(err, BackendError::Validation(field.to_owned()));
    }

    #[rstest]
    #[case(InstanceStatus::Pending, false)]
    #[case(InstanceStatus::Running, false)]
    #[case(InstanceStatus::Terminated, true)]
    #[case(InstanceStatus::NonExistent, true)]
    fn terminal_statuses(#[case] status: InstanceStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }
}
