//! Mount descriptors: sources of code or data placed on the execution target.
//!
//! A mount contributes optional shell fragments to the launch script (host
//! setup and upload) and may perform a local upload side effect before the
//! script is dispatched. Mounts are built from tagged nodes of `.sortie.yml`
//! through the registry in [`crate::config`].

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::exec::{CommandRunner, ExecError};
use crate::settings::Settings;

mod archive;
mod code;
mod output;
mod simple;

pub use code::{GsCode, S3Code, SshCode};
pub use output::S3Output;
pub use simple::Simple;

/// Per-instance identity of a mount, used to track uploads.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MountId(Uuid);

impl MountId {
    /// Generates a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while building or uploading a mount.
#[derive(Debug, Error)]
pub enum MountError {
    /// Raised when a declaration does not match the expected fields.
    #[error("invalid {kind} mount: {message}")]
    Spec {
        /// Mount kind, e.g. `S3Code`.
        kind: &'static str,
        /// Deserialisation message.
        message: String,
    },
    /// Raised when packing or copying through an external tool fails.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Raised when a local archive cannot be created.
    #[error("failed to prepare archive at {path}: {message}")]
    Io {
        /// Path involved in the failing operation.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the launch options lack the host an upload needs.
    #[error("{kind} mount cannot reach its target: {message}")]
    Target {
        /// Mount kind, e.g. `SshCode`.
        kind: &'static str,
        /// Explanation of the missing information.
        message: String,
    },
}

/// Everything a mount needs to perform its upload side effect.
#[derive(Clone, Copy)]
pub struct UploadContext<'a> {
    /// Runner used for `tar`, `aws`, `gcloud`, and `scp` calls.
    pub runner: &'a dyn CommandRunner,
    /// Executable names.
    pub settings: &'a Settings,
    /// Resolved `launch` mapping, carrying host connection details.
    pub launch: &'a Mapping,
}

impl fmt::Debug for UploadContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadContext")
            .field("settings", self.settings)
            .field("launch", self.launch)
            .finish_non_exhaustive()
    }
}

/// Capability interface implemented by every mount kind.
pub trait Mount: Send + Sync + fmt::Debug {
    /// Identity used to skip repeated uploads.
    fn id(&self) -> MountId;

    /// Location of the mount contents on the target host.
    fn host_path(&self) -> &str;

    /// Location of the mount contents inside a container.
    fn container_path(&self) -> &str;

    /// Whether the mount is appended to the interpreter search path.
    fn on_search_path(&self) -> bool;

    /// Fragment run on the target to unpack the mount.
    fn host_setup(&self) -> Option<String> {
        None
    }

    /// Fragment run on the target alongside the job, e.g. output syncing.
    fn upload_fragment(&self) -> Option<String> {
        None
    }

    /// Local side effect performed once before launching.
    ///
    /// # Errors
    ///
    /// Returns [`MountError`] when packing or copying fails.
    fn upload(&self, _ctx: &UploadContext<'_>) -> Result<(), MountError> {
        Ok(())
    }

    /// `docker run` volume flag binding the host path into the container.
    fn docker_volume(&self) -> String {
        format!("-v '{}':'{}'", self.host_path(), self.container_path())
    }
}

/// Shared handle to a mount.
pub type SharedMount = Arc<dyn Mount>;

/// Deserialises a mount declaration, naming the kind in failures.
pub(crate) fn parse_spec<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, MountError> {
    serde_yaml::from_value(value).map_err(|err| MountError::Spec {
        kind,
        message: err.to_string(),
    })
}

/// Joins the host or container paths of search-path mounts with `:`.
#[must_use]
pub fn search_path(mounts: &[SharedMount], container: bool) -> String {
    mounts
        .iter()
        .filter(|mount| mount.on_search_path())
        .map(|mount| {
            if container {
                mount.container_path()
            } else {
                mount.host_path()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn default_compress() -> bool {
    true
}

fn default_local_path() -> String {
    String::from(".")
}

#[cfg(test)]
mod tests;
