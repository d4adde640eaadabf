//! Launch configuration: the backend type plus script and backend options.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Directory on the target receiving launch logs when none is configured.
pub const DEFAULT_LAUNCH_DIR: &str = "/tmp/sortie-launch";

/// Longest instance name cloud providers accept as a tag value.
pub const MAX_INSTANCE_NAME: usize = 128;

/// Errors raised while reading the `launch` mapping.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LaunchError {
    /// Raised when `launch.type` is absent.
    #[error("launch configuration has no `type`; expected one of local-docker, ssh, vm-a, vm-b, manager")]
    MissingType,
    /// Raised when the mapping cannot be read into typed options.
    #[error("invalid launch configuration: {message}")]
    Invalid {
        /// Deserialiser message.
        message: String,
    },
}

/// Dispatch targets for a composed script.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum BackendKind {
    /// Runs the script on this machine.
    #[serde(rename = "local-docker", alias = "local_docker")]
    LocalDocker,
    /// Copies the script to an SSH host and runs it there.
    #[serde(rename = "ssh")]
    Ssh,
    /// Boots an EC2 instance with the script as user data.
    #[serde(rename = "vm-a", alias = "ec2")]
    Ec2,
    /// Boots a Compute Engine instance with the script as startup metadata.
    #[serde(rename = "vm-b", alias = "gce")]
    Gce,
    /// Hands the script to a remote manager daemon.
    #[serde(rename = "manager")]
    Manager,
}

impl BackendKind {
    /// Canonical `launch.type` value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalDocker => "local-docker",
            Self::Ssh => "ssh",
            Self::Ec2 => "vm-a",
            Self::Gce => "vm-b",
            Self::Manager => "manager",
        }
    }

    /// Whether the backend knows how to terminate its host after the job.
    #[must_use]
    pub const fn supports_termination(self) -> bool {
        matches!(self, Self::Ec2 | Self::Gce)
    }
}

fn default_launch_dir() -> String {
    DEFAULT_LAUNCH_DIR.to_owned()
}

/// Options shaping the composed script, shared by every backend.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ScriptOptions {
    /// Directory holding launch logs on the target.
    #[serde(default = "default_launch_dir")]
    pub launch_dir: String,
    /// Seconds to wait before terminating, or after host unpacking.
    #[serde(default)]
    pub delay: Option<u64>,
    /// Terminates the host once the job exits.
    #[serde(default)]
    pub terminate_after: bool,
    /// Name the instance tags itself with.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Redirection replacing the default log `tee`s.
    #[serde(default)]
    pub pipe_out: Option<String>,
    /// Commands run before anything else, outside the logged block.
    #[serde(default)]
    pub root_config: Option<String>,
    /// Commands run first inside the logged block.
    #[serde(default)]
    pub setup: Option<String>,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            launch_dir: default_launch_dir(),
            delay: None,
            terminate_after: false,
            instance_name: None,
            pipe_out: None,
            root_config: None,
            setup: None,
        }
    }
}

#[derive(Deserialize)]
struct KindOnly {
    #[serde(rename = "type")]
    kind: Option<BackendKind>,
}

/// Resolved `launch` section.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchConfig {
    /// Selected backend.
    pub kind: BackendKind,
    /// Script shaping options.
    pub script: ScriptOptions,
    /// Full mapping, from which each backend reads its own options.
    pub raw: Mapping,
}

impl LaunchConfig {
    /// Reads a resolved `launch` mapping.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::MissingType`] when `type` is absent and
    /// [`LaunchError::Invalid`] when a known field has the wrong shape.
    pub fn from_mapping(raw: Mapping) -> Result<Self, LaunchError> {
        let value = Value::Mapping(raw.clone());
        let KindOnly { kind } = serde_yaml::from_value(value.clone()).map_err(|err| invalid(&err))?;
        let backend = kind.ok_or(LaunchError::MissingType)?;
        let script = serde_yaml::from_value(value).map_err(|err| invalid(&err))?;
        Ok(Self {
            kind: backend,
            script,
            raw,
        })
    }

    /// Deserialises backend-specific options from the raw mapping.
    ///
    /// # Errors
    ///
    /// Returns the deserialiser error when required fields are missing.
    pub fn backend_options<T: DeserializeOwned>(&self) -> Result<T, serde_yaml::Error> {
        serde_yaml::from_value(Value::Mapping(self.raw.clone()))
    }
}

fn invalid(err: &serde_yaml::Error) -> LaunchError {
    LaunchError::Invalid {
        message: err.to_string(),
    }
}
