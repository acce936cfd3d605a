//! Secure shell client settings loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::types::ShellError;
use crate::config::ConfigError;

/// Default remote user on the build image.
pub const DEFAULT_SSH_USER: &str = "root";

/// SSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN_SSH",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_SSH_USER.to_owned())]
    pub user: String,
    /// TCP port of the remote daemon.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Whether to enforce host key checking; defaults to disabling it for
    /// ephemeral hosts.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: DEFAULT_SSH_USER.to_owned(),
            port: 22,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
        }
    }
}

impl SshConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidConfig`] when any required field is empty.
    pub fn validate(&self) -> Result<(), ShellError> {
        for (field, value) in [("ssh_bin", &self.ssh_bin), ("user", &self.user)] {
            if value.trim().is_empty() {
                return Err(ShellError::InvalidConfig {
                    field: field.to_owned(),
                });
            }
        }
        if self.port == 0 {
            return Err(ShellError::InvalidConfig {
                field: String::from("port"),
            });
        }
        Ok(())
    }
}
