//! Core library for the Sortie launch orchestrator.
//!
//! A job document (`.sortie.yml`) declares mounts, a runner, and a launch
//! target per mode. The crate resolves that document into a single launch
//! script with a fixed fragment order and dispatches it to a local shell, an
//! SSH host, an EC2 or Compute Engine instance, or a remote manager daemon.

pub mod backend;
pub mod config;
pub mod exec;
pub mod launch;
pub mod logging;
pub mod mount;
pub mod orchestrator;
pub mod runner;
pub mod script;
pub mod session;
pub mod settings;
pub mod ssh;
pub mod template;
pub mod test_support;

pub use backend::{Backend, BackendError, LaunchHandle, LaunchRequest, RemoteExecutionError};
pub use config::{ConfigError, Document, Overrides, ResolvedConfig};
pub use exec::{CommandOutput, CommandRunner, ExecError, ProcessCommandRunner};
pub use launch::{BackendKind, LaunchConfig};
pub use mount::{Mount, SharedMount};
pub use orchestrator::Orchestrator;
pub use runner::{Job, RunnerKind, RunnerSpec};
pub use session::{ConfigureRequest, ReconfigureRequest, Session, SessionError, listen};
pub use settings::{Settings, SettingsError};
pub use template::{ResolutionContext, TemplateError};
