//! Tool settings loaded via `ortho-config`.
//!
//! These are the knobs of the launcher itself (which executables to call,
//! how to talk to SSH hosts and managers), as opposed to the per-project
//! `.sortie.yml` job document handled by [`crate::config`].

use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Executable names and transport options, merged from defaults,
/// `sortie.toml`, and `SORTIE_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SORTIE",
    discovery(
        app_name = "sortie",
        env_var = "SORTIE_SETTINGS_PATH",
        config_file_name = "sortie.toml",
        dotfile_name = ".sortie.toml",
        project_file_name = "sortie.toml"
    )
)]
pub struct Settings {
    /// Shell used to execute composed scripts locally.
    #[ortho_config(default = "bash".to_owned())]
    pub bash_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `sshpass` executable, used for password logins.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Path to the `tar` executable used to pack mounts.
    #[ortho_config(default = "tar".to_owned())]
    pub tar_bin: String,
    /// Path to the AWS CLI.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Path to the Google Cloud CLI.
    #[ortho_config(default = "gcloud".to_owned())]
    pub gcloud_bin: String,
    /// Whether to enforce host key checking on SSH targets.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Request timeout for manager uploads, in seconds.
    #[ortho_config(default = 30)]
    pub manager_http_timeout_secs: u64,
}

/// Errors raised when loading or validating settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("settings parsing failed: {0}")]
    Parse(String),
    /// Raised when a required executable name is blank.
    #[error("missing {field}: set SORTIE_{env_suffix} or add {field} to sortie.toml", env_suffix = field.to_uppercase())]
    InvalidField {
        /// Settings field that failed validation.
        field: String,
    },
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bash_bin: String::from("bash"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sshpass_bin: String::from("sshpass"),
            tar_bin: String::from("tar"),
            aws_bin: String::from("aws"),
            gcloud_bin: String::from("gcloud"),
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            manager_http_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Loads settings from defaults, configuration files, and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails, or
    /// [`SettingsError::InvalidField`] when validation fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        let settings = Self::load_from_iter([OsString::from("sortie")])
            .map_err(|err| SettingsError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Ensures every executable name is present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidField`] naming the first blank field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for (value, field) in [
            (&self.bash_bin, "bash_bin"),
            (&self.ssh_bin, "ssh_bin"),
            (&self.scp_bin, "scp_bin"),
            (&self.sshpass_bin, "sshpass_bin"),
            (&self.tar_bin, "tar_bin"),
            (&self.aws_bin, "aws_bin"),
            (&self.gcloud_bin, "gcloud_bin"),
        ] {
            if value.trim().is_empty() {
                return Err(SettingsError::InvalidField {
                    field: field.to_owned(),
                });
            }
        }
        Ok(())
    }
}
