//! Session state threaded through configure, run, and listen calls.
//!
//! A [`Session`] owns the parsed document, the resolved configuration, the
//! run counter, the cached clock, and the [`Orchestrator`] with its
//! idempotency flags. It is created by [`Session::configure`] and passed
//! explicitly to every later call.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::manager::{HttpManagerClient, ManagerBackend, ManagerClient};
use crate::backend::ssh::SshBackend;
use crate::backend::{BackendContext, BackendError, LaunchHandle, LaunchRequest, dispatch};
use crate::config::{ConfigError, Document, Overrides, ResolvedConfig};
use crate::exec::{CommandRunner, ExecError, os_args};
use crate::launch::{BackendKind, LaunchConfig, LaunchError};
use crate::mount::{MountError, SharedMount, UploadContext, search_path};
use crate::orchestrator::Orchestrator;
use crate::runner::{Job, PARAMS_ENV, RunnerError};
use crate::script::{self, ScriptError};
use crate::settings::Settings;
use crate::template::{ClockSource, ContextValue, ResolutionContext, TemplateError, yaml_key};

/// Interval between heartbeats while listening without a timeout.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(63);

/// Errors raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Raised when the document cannot be located, parsed, or resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when a runner option references a missing context key.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Raised when the `launch` options are unusable.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Raised before composition for unsupported option combinations.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// Raised when runner fragments cannot be rendered.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// Raised when a mount upload fails.
    #[error(transparent)]
    Mount(#[from] MountError),
    /// Raised verbatim from the selected backend.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Raised when a local-mode job cannot be started.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Raised when the working directory cannot be determined.
    #[error("failed to determine the working directory: {message}")]
    WorkDir {
        /// Operating system error string.
        message: String,
    },
}

/// Inputs of [`Session::configure`].
#[derive(Clone, Debug, Default)]
pub struct ConfigureRequest {
    /// Mode to activate; `None` selects the `run` block.
    pub mode: Option<String>,
    /// Explicit document path; discovered from `work_dir` when absent.
    pub config_path: Option<Utf8PathBuf>,
    /// Directory jobs are launched from; the process directory by default.
    pub work_dir: Option<Utf8PathBuf>,
    /// Call-time partial updates.
    pub overrides: Overrides,
    /// Values flattened into the context and the resolved configuration.
    pub extensions: BTreeMap<String, Value>,
    /// Registers mounts without uploading them, for sessions that only
    /// compose scripts.
    pub compose_only: bool,
}

/// Inputs of [`Session::reconfigure`].
#[derive(Clone, Debug, Default)]
pub struct ReconfigureRequest {
    /// Mode to activate; `None` selects the `run` block.
    pub mode: Option<String>,
    /// Call-time partial updates.
    pub overrides: Overrides,
    /// Values flattened into the context and the resolved configuration.
    pub extensions: BTreeMap<String, Value>,
}

/// A composed script ready for dispatch.
#[derive(Clone, Debug)]
pub struct PreparedLaunch {
    /// Parsed launch options.
    pub config: LaunchConfig,
    /// Composed script text.
    pub script: String,
    /// Id tagging this run.
    pub run_id: Uuid,
}

/// Explicit replacement for process-wide run state.
pub struct Session {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
    manager: Option<Arc<dyn ManagerClient>>,
    document: Document,
    resolved: ResolvedConfig,
    extensions: BTreeMap<String, Value>,
    orchestrator: Orchestrator,
    run_count: u64,
    clock: DateTime<Local>,
    work_dir: Utf8PathBuf,
    compose_only: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("document", &self.document.path())
            .field("mode", &self.resolved.mode)
            .field("run_count", &self.run_count)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Loads the document, activates a mode, and uploads its mounts unless
    /// [`ConfigureRequest::compose_only`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when discovery, parsing, resolution, or a
    /// mount upload fails.
    pub fn configure(
        runner: Arc<dyn CommandRunner>,
        settings: Settings,
        request: ConfigureRequest,
    ) -> Result<Self, SessionError> {
        let work_dir = match request.work_dir {
            Some(dir) => dir,
            None => current_dir()?,
        };
        let path = match request.config_path {
            Some(path) => path,
            None => Document::discover(&work_dir)?,
        };
        let clock = Local::now();
        let config_root = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .map_or_else(|| String::from("."), ToString::to_string);
        let load_ctx = ContextInputs {
            mode: request.mode.as_deref(),
            config_root: &config_root,
            work_dir: &work_dir,
            clock,
            count: 0,
            run_id: Uuid::new_v4(),
            mounts: &[],
            extras: &BTreeMap::new(),
            document: None,
        }
        .build()
        .extended(&request.extensions);
        let document = Document::load(&path, &load_ctx)?;
        info!(path = %document.path(), "loaded configuration document");

        let resolved = document.resolve(
            request.mode.as_deref(),
            &request.overrides,
            &request.extensions,
        )?;
        let mut session = Self {
            runner,
            settings,
            manager: None,
            document,
            resolved,
            extensions: request.extensions,
            orchestrator: Orchestrator::new(),
            run_count: 0,
            clock,
            work_dir,
            compose_only: request.compose_only,
        };
        session.activate()?;
        Ok(session)
    }

    /// Re-resolves against the already-parsed document.
    ///
    /// The run counter, the cached clock, and the idempotency flags survive.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when resolution or a mount upload fails.
    pub fn reconfigure(&mut self, request: ReconfigureRequest) -> Result<(), SessionError> {
        self.resolved = self.document.resolve(
            request.mode.as_deref(),
            &request.overrides,
            &request.extensions,
        )?;
        self.extensions = request.extensions;
        self.activate()
    }

    /// Uses `client` instead of an HTTP client for the manager backend.
    #[must_use]
    pub fn with_manager(mut self, client: Arc<dyn ManagerClient>) -> Self {
        self.manager = Some(client);
        self
    }

    /// Effective configuration of the active mode.
    #[must_use]
    pub const fn resolved(&self) -> &ResolvedConfig {
        &self.resolved
    }

    /// Number of runs started in this session.
    #[must_use]
    pub const fn run_count(&self) -> u64 {
        self.run_count
    }

    /// Mount and unpack bookkeeping.
    #[must_use]
    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Takes a fresh snapshot for the cached `now` context value.
    pub fn reset_clock(&mut self) {
        self.clock = Local::now();
        debug!(clock = %self.clock, "reset cached clock");
    }

    /// Composes the launch script for `job` without dispatching it.
    ///
    /// Counts as a run: the counter advances and host setup is included
    /// unless the host was already unpacked.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for template, launch, runner, or capability
    /// failures.
    pub fn compose(
        &mut self,
        job: &Job,
        extras: &BTreeMap<String, Value>,
    ) -> Result<PreparedLaunch, SessionError> {
        let count = self.next_count();
        let run_id = Uuid::new_v4();
        let config = self.stage(job, extras, count, run_id)?;
        let script = self
            .orchestrator
            .compose_launch_script(config.kind, &config.script)?;
        Ok(PreparedLaunch {
            config,
            script,
            run_id,
        })
    }

    /// Composes the script for `job` and dispatches it to the backend.
    ///
    /// In the `local` mode the job runs on this machine with its parameters
    /// in the environment and nothing is composed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`]; backend failures surface verbatim. Remote
    /// stderr is reported through the returned handle, not as an error.
    pub async fn run(
        &mut self,
        job: &Job,
        extras: &BTreeMap<String, Value>,
    ) -> Result<LaunchHandle, SessionError> {
        let count = self.next_count();
        let run_id = Uuid::new_v4();
        if self.resolved.local {
            return self.run_locally(job);
        }

        let config = self.stage(job, extras, count, run_id)?;
        self.unpack_host(&config).await?;
        let script = self
            .orchestrator
            .compose_launch_script(config.kind, &config.script)?;
        self.log_script(&script);

        let request = LaunchRequest {
            script,
            config,
            run_id,
        };
        Ok(dispatch(self.backend_context(), &request).await?)
    }

    fn activate(&mut self) -> Result<(), SessionError> {
        self.orchestrator.set_mounts(self.resolved.mounts.clone());
        if self.resolved.local {
            info!("local mode: mounts are used in place");
            return Ok(());
        }
        if self.compose_only {
            debug!("composing only: mount uploads skipped");
            return Ok(());
        }
        let target = upload_target(&self.resolved);
        let ctx = UploadContext {
            runner: &*self.runner,
            settings: &self.settings,
            launch: &target,
        };
        let uploaded = self.orchestrator.upload_mounts(&ctx)?;
        info!(
            mode = self.resolved.mode.as_deref().unwrap_or("run"),
            uploaded,
            "configured session"
        );
        Ok(())
    }

    fn next_count(&mut self) -> u64 {
        let count = self.run_count;
        self.run_count += 1;
        count
    }

    /// Interpolates the runner options and hands its fragments to the
    /// orchestrator, leaving composition to the caller.
    fn stage(
        &mut self,
        job: &Job,
        extras: &BTreeMap<String, Value>,
        count: u64,
        run_id: Uuid,
    ) -> Result<LaunchConfig, SessionError> {
        let config = self.resolved.launch_config()?;
        script::check(config.kind, &config.script)?;

        let config_root = self.document.root_dir().to_string();
        let ctx = ContextInputs {
            mode: self.resolved.mode.as_deref(),
            config_root: &config_root,
            work_dir: &self.work_dir,
            clock: self.clock,
            count,
            run_id,
            mounts: self.orchestrator.mounts(),
            extras,
            document: Some(&self.resolved),
        }
        .build()
        .extended(&self.extensions);

        let spec = self.resolved.runner.as_ref().ok_or(ScriptError::MissingRunner)?;
        let mut options = Mapping::new();
        for (key, value) in &spec.options {
            let field = yaml_key(key)
                .map_or_else(|| String::from("runner"), |name| format!("runner.{name}"));
            options.insert(key.clone(), ctx.render_value(&field, value)?);
        }
        let work_dir = Value::from("work_dir");
        if !options.contains_key(&work_dir) {
            options.insert(work_dir, Value::from(self.work_dir.as_str()));
        }
        let fragments = spec.fragments(&options, job, self.orchestrator.mounts())?;
        self.orchestrator.set_runner(fragments);
        Ok(config)
    }

    async fn unpack_host(&mut self, config: &LaunchConfig) -> Result<(), SessionError> {
        if self.orchestrator.is_host_unpacked() {
            return Ok(());
        }
        match config.kind {
            BackendKind::Ssh => {
                if self.orchestrator.host_setup_fragments().is_empty() {
                    self.orchestrator.mark_host_unpacked();
                    return Ok(());
                }
                let unpack = self.orchestrator.compose_host_unpack_script(&config.script);
                self.log_script(&unpack);
                let request = LaunchRequest {
                    script: unpack,
                    config: config.clone(),
                    run_id: Uuid::new_v4(),
                };
                let handle = SshBackend::new(self.backend_context())
                    .run_blocking(&request)
                    .await?;
                if let Some(remote) = handle.remote_error() {
                    warn!(stderr = %remote.stderr, "host unpack reported errors");
                }
            }
            BackendKind::Manager => {
                let fragments = self.orchestrator.host_setup_fragments();
                if let Some(ref client) = self.manager {
                    ManagerBackend::new(&**client).host_setup(&fragments).await?;
                } else {
                    let client = HttpManagerClient::from_launch(config, &self.settings)?;
                    ManagerBackend::new(&client).host_setup(&fragments).await?;
                }
                self.orchestrator.mark_host_unpacked();
            }
            BackendKind::LocalDocker | BackendKind::Ec2 | BackendKind::Gce => {}
        }
        Ok(())
    }

    fn run_locally(&self, job: &Job) -> Result<LaunchHandle, SessionError> {
        let payload = job.encode()?;
        let line = format!("{PARAMS_ENV}={payload} {}\n", job.command_line());
        info!(command = %job.command_line(), "local mode: running job on this machine");
        let output = self.runner.run_with_input(
            &self.settings.bash_bin,
            &os_args(["-s"]),
            &line,
        )?;
        Ok(LaunchHandle::Captured(output))
    }

    fn backend_context(&self) -> BackendContext<'_> {
        BackendContext {
            runner: &*self.runner,
            settings: &self.settings,
            manager: self.manager.as_deref(),
        }
    }

    fn log_script(&self, script: &str) {
        if self.resolved.verbose {
            info!(script = %script, "composed launch script");
        } else {
            debug!(script = %script, "composed launch script");
        }
    }
}

/// Keeps the process alive so detached jobs can stream output.
///
/// Sleeps for `timeout` when given; otherwise never returns, logging a
/// heartbeat every [`HEARTBEAT_INTERVAL`].
pub async fn listen(timeout: Option<Duration>) {
    if let Some(limit) = timeout {
        info!(seconds = limit.as_secs(), "listening");
        sleep(limit).await;
        return;
    }
    loop {
        sleep(HEARTBEAT_INTERVAL).await;
        info!("still listening");
    }
}

/// Launch options overlaid with host options, as seen by mount uploads.
fn upload_target(resolved: &ResolvedConfig) -> Mapping {
    let mut target = resolved.launch.clone();
    for (key, value) in &resolved.host {
        target.insert(key.clone(), value.clone());
    }
    target
}

fn current_dir() -> Result<Utf8PathBuf, SessionError> {
    let dir = env::current_dir().map_err(|err| SessionError::WorkDir {
        message: err.to_string(),
    })?;
    Utf8PathBuf::from_path_buf(dir).map_err(|dir| SessionError::WorkDir {
        message: format!("{} is not valid UTF-8", dir.display()),
    })
}

struct ContextInputs<'a> {
    mode: Option<&'a str>,
    config_root: &'a str,
    work_dir: &'a Utf8PathBuf,
    clock: DateTime<Local>,
    count: u64,
    run_id: Uuid,
    mounts: &'a [SharedMount],
    extras: &'a BTreeMap<String, Value>,
    document: Option<&'a ResolvedConfig>,
}

impl ContextInputs<'_> {
    fn build(self) -> ResolutionContext {
        let environment = ContextValue::map(env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, ContextValue::Text(value.into_string().ok()?)))
        }));
        let mounts = ContextValue::List(
            self.mounts
                .iter()
                .map(|mount| {
                    ContextValue::map([
                        ("host_path", ContextValue::text(mount.host_path())),
                        ("container_path", ContextValue::text(mount.container_path())),
                        ("pypath", ContextValue::Bool(mount.on_search_path())),
                    ])
                })
                .collect(),
        );

        let mut run = BTreeMap::from([
            (
                String::from("count"),
                ContextValue::Integer(i64::try_from(self.count).unwrap_or(i64::MAX)),
            ),
            (String::from("cwd"), ContextValue::text(self.work_dir.as_str())),
            (
                String::from("now"),
                ContextValue::Clock(ClockSource::Cached(self.clock)),
            ),
            (String::from("uuid"), ContextValue::text(self.run_id.to_string())),
            (
                String::from("pypaths"),
                ContextValue::map([
                    ("host", ContextValue::text(search_path(self.mounts, false))),
                    ("container", ContextValue::text(search_path(self.mounts, true))),
                ]),
            ),
        ]);
        run.extend(
            self.extras
                .iter()
                .map(|(key, value)| (key.clone(), ContextValue::from_yaml(value))),
        );

        let mut ctx = ResolutionContext::new();
        if let Some(resolved) = self.document {
            for (key, value) in &resolved.extra {
                ctx = ctx.with(key.clone(), ContextValue::from_yaml(value));
            }
            ctx = ctx
                .with(
                    "launch",
                    ContextValue::from_yaml(&Value::Mapping(resolved.launch.clone())),
                )
                .with(
                    "host",
                    ContextValue::from_yaml(&Value::Mapping(resolved.host.clone())),
                );
        }

        ctx.with("env", environment)
            .with("now", ContextValue::Clock(ClockSource::Cached(self.clock)))
            .with("NOW", ContextValue::Clock(ClockSource::Fresh))
            .with("uuid", ContextValue::text(Uuid::new_v4().to_string()))
            .with("run", ContextValue::Map(run))
            .with("mounts", mounts)
            .with("mode", ContextValue::text(self.mode.unwrap_or("run")))
            .with("config_root", ContextValue::text(self.config_root))
    }
}
