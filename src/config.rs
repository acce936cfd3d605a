//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::LaunchRequest;
use crate::script::{DEFAULT_REMOTE_ROOT, ScriptInputs};
use crate::session::{BuildSettings, TimeoutPolicy};

/// Application whose build host is provisioned unless overridden.
pub const DEFAULT_APP_NAME: &str = "frontend-ssr-web";

/// Build pipeline settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN_BUILD",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct BuildConfig {
    /// Private network the build host is attached to.
    pub subnet_id: String,
    /// Machine image booted on the build host.
    pub image_id: String,
    /// Security group applied to the build host.
    pub security_group_id: String,
    /// Identity profile (project) owning the host and its credential.
    pub instance_profile: String,
    /// Application name used for tags, topics, and log keys.
    #[ortho_config(default = DEFAULT_APP_NAME.to_owned())]
    pub app_name: String,
    /// Instance shape.
    #[ortho_config(default = "COPARM1-16C-64G".to_owned())]
    pub instance_type: String,
    /// Root volume size in gigabytes.
    #[ortho_config(default = 32)]
    pub volume_size_gb: u32,
    /// Local folder transcribed to `bootstrap/` on the host.
    #[ortho_config(default = "scripts/build".to_owned())]
    pub script_folder: String,
    /// Local file copied to `bootstrap/config.sh`.
    #[ortho_config(default = "/home/ec2-user/config.sh".to_owned())]
    pub config_file: String,
    /// Local file copied to `bootstrap/repo.sh`.
    #[ortho_config(default = "/home/ec2-user/repo.sh".to_owned())]
    pub repo_file: String,
    /// Remote directory the generated script starts in.
    #[ortho_config(default = DEFAULT_REMOTE_ROOT.to_owned())]
    pub remote_root: String,
    /// Remote path the generated script is uploaded to.
    #[ortho_config(default = "/root/initial_script.sh".to_owned())]
    pub remote_script_path: String,
    /// Message broker URL.
    #[ortho_config(default = "redis://127.0.0.1:6379/".to_owned())]
    pub pubsub_url: String,
    /// Topic the host publishes on once ready. Defaults to
    /// `updates:<app>:build_ready`.
    pub ready_topic: Option<String>,
    /// Topic notified after teardown. Defaults to `updates:<app>:do_update`.
    pub update_topic: Option<String>,
    /// Local directory backing log storage.
    #[ortho_config(default = "logs".to_owned())]
    pub log_root: String,
    /// Bucket receiving harvested logs.
    #[ortho_config(default = "builds".to_owned())]
    pub log_bucket: String,
    /// Seconds allowed for one shell connection attempt.
    #[ortho_config(default = 5)]
    pub connect_timeout_secs: u64,
    /// Attempts made before giving up on the shell connection.
    #[ortho_config(default = 150)]
    pub connect_attempts: u32,
    /// Seconds between shell connection attempts.
    #[ortho_config(default = 2)]
    pub connect_backoff_secs: u64,
    /// Seconds allowed for a single remote command.
    #[ortho_config(default = 3600)]
    pub command_timeout_secs: u64,
    /// Seconds allowed to open an execution channel.
    #[ortho_config(default = 15)]
    pub channel_open_timeout_secs: u64,
    /// Seconds allowed for the host to reach `running`.
    #[ortho_config(default = 600)]
    pub start_timeout_secs: u64,
    /// Seconds allowed for termination to be confirmed.
    #[ortho_config(default = 600)]
    pub terminate_timeout_secs: u64,
    /// Seconds between instance status polls.
    #[ortho_config(default = 5)]
    pub status_poll_secs: u64,
    /// Seconds allowed for the provisioning script.
    #[ortho_config(default = 1800)]
    pub script_timeout_secs: u64,
    /// Seconds allowed for the readiness signal after the script returns.
    #[ortho_config(default = 300)]
    pub readiness_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in kiln.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl BuildConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.subnet_id,
                FieldMetadata::new(
                    "private network ID",
                    "KILN_BUILD_SUBNET_ID",
                    "subnet_id",
                    "build",
                ),
            ),
            (
                &self.image_id,
                FieldMetadata::new("machine image ID", "KILN_BUILD_IMAGE_ID", "image_id", "build"),
            ),
            (
                &self.security_group_id,
                FieldMetadata::new(
                    "security group ID",
                    "KILN_BUILD_SECURITY_GROUP_ID",
                    "security_group_id",
                    "build",
                ),
            ),
            (
                &self.instance_profile,
                FieldMetadata::new(
                    "instance profile",
                    "KILN_BUILD_INSTANCE_PROFILE",
                    "instance_profile",
                    "build",
                ),
            ),
            (
                &self.app_name,
                FieldMetadata::new("application name", "KILN_BUILD_APP_NAME", "app_name", "build"),
            ),
            (
                &self.remote_script_path,
                FieldMetadata::new(
                    "remote script path",
                    "KILN_BUILD_REMOTE_SCRIPT_PATH",
                    "remote_script_path",
                    "build",
                ),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "connect_attempts must be at least 1",
            )));
        }
        Ok(())
    }

    /// Topic the host publishes on once its workload is ready.
    #[must_use]
    pub fn ready_topic(&self) -> String {
        self.ready_topic
            .clone()
            .unwrap_or_else(|| format!("updates:{}:build_ready", self.app_name))
    }

    /// Topic notified once the build infrastructure is gone.
    #[must_use]
    pub fn update_topic(&self) -> String {
        self.update_topic
            .clone()
            .unwrap_or_else(|| format!("updates:{}:do_update", self.app_name))
    }

    /// Builds the timeout policy from the configured seconds.
    #[must_use]
    pub const fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            connect_attempts: self.connect_attempts,
            connect_backoff: Duration::from_secs(self.connect_backoff_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            channel_open_timeout: Duration::from_secs(self.channel_open_timeout_secs),
            output_poll_interval: TimeoutPolicy::OUTPUT_POLL_INTERVAL,
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            terminate_timeout: Duration::from_secs(self.terminate_timeout_secs),
            status_poll_interval: Duration::from_secs(self.status_poll_secs),
            script_timeout: Duration::from_secs(self.script_timeout_secs),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
        }
    }

    /// Resolves the validated settings used by the build pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn settings(&self) -> Result<BuildSettings, ConfigError> {
        self.validate()?;
        let launch = LaunchRequest::builder()
            .image_id(&self.image_id)
            .subnet_id(&self.subnet_id)
            .security_group_id(&self.security_group_id)
            .instance_type(&self.instance_type)
            .instance_profile(&self.instance_profile)
            .volume_size_gb(self.volume_size_gb)
            .tag("Name", format!("{} build", self.app_name))
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        Ok(BuildSettings {
            app_name: self.app_name.clone(),
            script: ScriptInputs {
                script_folder: Utf8PathBuf::from(&self.script_folder),
                config_file: Utf8PathBuf::from(&self.config_file),
                repo_file: Utf8PathBuf::from(&self.repo_file),
                remote_root: self.remote_root.clone(),
            },
            launch,
            remote_script_path: self.remote_script_path.clone(),
            ready_topic: self.ready_topic(),
            update_topic: self.update_topic(),
            log_bucket: self.log_bucket.clone(),
            stdout_key: format!("builds/{}/build-stdout.txt", self.app_name),
            stderr_key: format!("builds/{}/build-stderr.txt", self.app_name),
            policy: self.timeout_policy(),
        })
    }
}

/// Scaleway specific configuration derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Availability zone hosting the build instance. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Base URL of the Scaleway API.
    #[ortho_config(default = "https://api.scaleway.com".to_owned())]
    pub api_url: String,
    /// Path to the `ssh-keygen` executable used to mint build keys.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.ssh_keygen_bin,
            &FieldMetadata::new(
                "ssh-keygen path",
                "SCW_SSH_KEYGEN_BIN",
                "ssh_keygen_bin",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

/// Operator notification settings.
#[derive(Clone, Debug, Default, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "KILN_NOTIFY")]
pub struct NotifyConfig {
    /// Slack incoming webhook. Notifications go to the log when unset.
    pub slack_webhook_url: Option<String>,
    /// Channel override for the webhook.
    pub slack_channel: Option<String>,
}

impl NotifyConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
