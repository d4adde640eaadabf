//! Dispatch of composed launch scripts to execution targets.
//!
//! Each adapter consumes the script plus its own slice of the `launch`
//! mapping. Provider and transport failures surface verbatim as
//! [`BackendError`]; nothing is retried.

use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::de::DeserializeOwned;
use tempfile::TempPath;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::exec::{CommandOutput, CommandRunner, ExecError};
use crate::launch::{BackendKind, LaunchConfig};
use crate::settings::Settings;

pub mod ec2;
pub mod gce;
pub mod local;
pub mod manager;
pub mod ssh;

use ec2::Ec2Backend;
use gce::GceBackend;
use local::LocalBackend;
use manager::{HttpManagerClient, ManagerBackend, ManagerClient, ManagerReply};
use ssh::SshBackend;

/// Errors surfaced by backends, carried verbatim from the failing layer.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Raised when a local process cannot be spawned or fed.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Raised when an HTTP call fails before a response arrives.
    #[error("http request failed: {message}")]
    Http {
        /// Transport error string.
        message: String,
    },
    /// Raised when a provider rejects a call.
    #[error("{program} failed with status {status}: {stderr}")]
    Provider {
        /// Program or endpoint that was called.
        program: String,
        /// Exit code or HTTP status.
        status: String,
        /// Error body or stderr, verbatim.
        stderr: String,
    },
    /// Raised when a local file cannot be written or read.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that failed.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the `launch` mapping lacks a backend option.
    #[error("invalid {kind} launch options: {message}")]
    Options {
        /// Backend type.
        kind: &'static str,
        /// Deserialiser message.
        message: String,
    },
    /// Raised when a request or response cannot be (de)serialised.
    #[error("failed to encode request: {message}")]
    Encode {
        /// Serialiser message.
        message: String,
    },
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Stderr or an explicit error reported by a remote execution.
///
/// This is a value, not a failure: the remote job may have partly
/// succeeded, so callers decide whether to treat it as fatal.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("remote execution reported errors: {}", .error.as_deref().unwrap_or(.stderr.as_str()))]
pub struct RemoteExecutionError {
    /// Remote standard error.
    pub stderr: String,
    /// Explicit error channel, when the transport has one.
    pub error: Option<String>,
}

/// Outcome of a launch.
#[derive(Clone, Debug, PartialEq)]
pub enum LaunchHandle {
    /// Exit status of a local script.
    Exit(Option<i32>),
    /// Output of a blocking remote execution.
    Captured(CommandOutput),
    /// A detached process that keeps running.
    Detached,
    /// Spot instance request identifier.
    SpotRequest(String),
    /// Instance identifier.
    Instance(String),
    /// Commands or scripts that a dry run would have executed.
    DryRun(Vec<String>),
    /// Request body built by a dry run.
    Request(serde_json::Value),
    /// Reply of the remote manager.
    Manager(ManagerReply),
}

impl LaunchHandle {
    /// Extracts remote errors from captured output or a manager reply.
    #[must_use]
    pub fn remote_error(&self) -> Option<RemoteExecutionError> {
        match self {
            Self::Captured(output) if !output.stderr.trim().is_empty() => {
                Some(RemoteExecutionError {
                    stderr: output.stderr.clone(),
                    error: None,
                })
            }
            Self::Manager(reply) if reply.error.is_some() || !reply.stderr.trim().is_empty() => {
                Some(RemoteExecutionError {
                    stderr: reply.stderr.clone(),
                    error: reply.error.clone(),
                })
            }
            _ => None,
        }
    }
}

/// Everything an adapter needs for one launch.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    /// Composed script.
    pub script: String,
    /// Resolved launch options.
    pub config: LaunchConfig,
    /// Unique id of this run, used to tag remote processes.
    pub run_id: Uuid,
}

/// Collaborators shared by the adapters.
#[derive(Clone, Copy)]
pub struct BackendContext<'a> {
    /// Process seam for `bash`, `ssh`, `scp`, `aws`, and `gcloud`.
    pub runner: &'a dyn CommandRunner,
    /// Tool settings.
    pub settings: &'a Settings,
    /// Manager client; an HTTP client is built from the options when absent.
    pub manager: Option<&'a dyn ManagerClient>,
}

/// Interface implemented by every dispatch target.
pub trait Backend {
    /// Launches the composed script.
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, LaunchHandle>;
}

/// Routes `request` to the adapter named by its `type`.
///
/// # Errors
///
/// Returns whatever [`BackendError`] the selected adapter raises.
pub async fn dispatch(
    ctx: BackendContext<'_>,
    request: &LaunchRequest,
) -> Result<LaunchHandle, BackendError> {
    let kind = request.config.kind;
    info!(backend = kind.as_str(), run_id = %request.run_id, "dispatching launch script");
    let handle = match kind {
        BackendKind::LocalDocker => LocalBackend::new(ctx).launch(request).await,
        BackendKind::Ssh => SshBackend::new(ctx).launch(request).await,
        BackendKind::Ec2 => Ec2Backend::new(ctx).launch(request).await,
        BackendKind::Gce => GceBackend::new(ctx).launch(request).await,
        BackendKind::Manager => {
            if let Some(client) = ctx.manager {
                ManagerBackend::new(client).launch(request).await
            } else {
                let client = HttpManagerClient::from_launch(&request.config, ctx.settings)?;
                ManagerBackend::new(&client).launch(request).await
            }
        }
    }?;

    if let Some(remote) = handle.remote_error() {
        warn!(stderr = %remote.stderr, error = ?remote.error, "remote execution reported errors");
    }
    info!(backend = kind.as_str(), handle = ?handle, "launched");
    Ok(handle)
}

/// Reads backend options from the `launch` mapping.
pub(crate) fn options<T: DeserializeOwned>(config: &LaunchConfig) -> Result<T, BackendError> {
    config
        .backend_options()
        .map_err(|err| BackendError::Options {
            kind: config.kind.as_str(),
            message: err.to_string(),
        })
}

/// Local copy of a launch script, deleted on drop.
#[derive(Debug)]
pub(crate) struct ScriptFile {
    path: Utf8PathBuf,
    _file: TempPath,
}

impl ScriptFile {
    /// Writes `script` to a fresh temporary file.
    pub(crate) fn write(prefix: &str, script: &str) -> Result<Self, BackendError> {
        let io_error = |err: std::io::Error| BackendError::Io {
            path: std::env::temp_dir().display().to_string(),
            message: err.to_string(),
        };
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".sh")
            .tempfile()
            .map_err(io_error)?;
        file.write_all(script.as_bytes())
            .and_then(|()| file.flush())
            .map_err(io_error)?;
        let temp = file.into_temp_path();
        let path = Utf8PathBuf::from_path_buf(temp.to_path_buf()).map_err(|path| {
            BackendError::Io {
                path: path.display().to_string(),
                message: String::from("temporary path is not valid UTF-8"),
            }
        })?;
        Ok(Self { path, _file: temp })
    }

    /// Location of the file.
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Reads a local file as UTF-8 text.
///
/// # Errors
///
/// Returns [`BackendError::Io`] when the file cannot be opened or read.
pub fn read_local_file(path: &Utf8Path) -> Result<String, BackendError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| BackendError::Io {
        path: path.to_string(),
        message: String::from("path is missing a file name"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| BackendError::Io {
        path: parent.to_string(),
        message: err.to_string(),
    })?;
    dir.read_to_string(file_name).map_err(|err| BackendError::Io {
        path: path.to_string(),
        message: err.to_string(),
    })
}
