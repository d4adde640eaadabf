//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use camino::Utf8Path;
use tokio::sync::{Mutex, MutexGuard};

use crate::backend::manager::{ManagerClient, ManagerReply};
use crate::backend::{BackendFuture, read_local_file};
use crate::exec::{CommandOutput, CommandRunner, ExecError, OutputMode};
use crate::mount::{Mount, MountError, MountId, UploadContext};

fn locked<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<Result<CommandOutput, ExecError>>>>,
    invocations: Arc<StdMutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Text written to stdin, if any.
    pub stdin: Option<String>,
    /// Output mode for detached spawns; `None` for waited commands.
    pub mode: Option<OutputMode>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes an error returned instead of an output, e.g. a spawn failure.
    pub fn push_error(&self, error: ExecError) {
        locked(&self.responses).push_back(Err(error));
    }

    fn record(
        &self,
        program: &str,
        args: &[OsString],
        stdin: Option<&str>,
        mode: Option<OutputMode>,
    ) -> Result<CommandOutput, ExecError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            stdin: stdin.map(str::to_owned),
            mode,
        });
        locked(&self.responses)
            .pop_front()
            .unwrap_or_else(|| {
                Err(ExecError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        self.record(program, args, None, None)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
    ) -> Result<CommandOutput, ExecError> {
        self.record(program, args, Some(stdin), None)
    }

    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
        output: OutputMode,
    ) -> Result<(), ExecError> {
        self.record(program, args, Some(stdin), Some(output))
            .map(|_| ())
    }
}

/// Mount with fixed fragments that counts its upload side effects.
#[derive(Debug)]
pub struct RecordingMount {
    id: MountId,
    host_path: String,
    container_path: String,
    pypath: bool,
    host_setup: Option<String>,
    upload_fragment: Option<String>,
    uploads: AtomicUsize,
}

impl RecordingMount {
    /// Creates a mount whose host setup fragment is `host_setup`.
    #[must_use]
    pub fn new(host_setup: &str) -> Self {
        Self {
            id: MountId::new(),
            host_path: String::from("/srv/code"),
            container_path: String::from("/code"),
            pypath: false,
            host_setup: Some(host_setup.to_owned()).filter(|text| !text.is_empty()),
            upload_fragment: None,
            uploads: AtomicUsize::new(0),
        }
    }

    /// Sets the upload fragment.
    #[must_use]
    pub fn with_upload_fragment(mut self, fragment: &str) -> Self {
        self.upload_fragment = Some(fragment.to_owned());
        self
    }

    /// Sets the host and container paths and the search-path flag.
    #[must_use]
    pub fn with_paths(mut self, host: &str, container: &str, pypath: bool) -> Self {
        host.clone_into(&mut self.host_path);
        container.clone_into(&mut self.container_path);
        self.pypath = pypath;
        self
    }

    /// Number of times [`Mount::upload`] ran.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl Mount for RecordingMount {
    fn id(&self) -> MountId {
        self.id
    }

    fn host_path(&self) -> &str {
        &self.host_path
    }

    fn container_path(&self) -> &str {
        &self.container_path
    }

    fn on_search_path(&self) -> bool {
        self.pypath
    }

    fn host_setup(&self) -> Option<String> {
        self.host_setup.clone()
    }

    fn upload_fragment(&self) -> Option<String> {
        self.upload_fragment.clone()
    }

    fn upload(&self, _ctx: &UploadContext<'_>) -> Result<(), MountError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Everything a [`FakeManagerClient`] was asked to do.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManagerCalls {
    /// `(remote path, file contents)` for each upload.
    pub uploads: Vec<(String, String)>,
    /// `(command, timeout)` for each execute call.
    pub executed: Vec<(String, Option<u64>)>,
    /// Script batches sent through `map`.
    pub mapped: Vec<Vec<String>>,
}

/// In-memory manager client returning a canned reply.
#[derive(Clone, Debug, Default)]
pub struct FakeManagerClient {
    reply: ManagerReply,
    calls: Arc<StdMutex<ManagerCalls>>,
}

impl FakeManagerClient {
    /// Creates a client answering every execution with `reply`.
    #[must_use]
    pub fn new(reply: ManagerReply) -> Self {
        Self {
            reply,
            calls: Arc::default(),
        }
    }

    /// Returns a snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> ManagerCalls {
        locked(&self.calls).clone()
    }
}

impl ManagerClient for FakeManagerClient {
    fn upload_file<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let contents = read_local_file(local)?;
            locked(&self.calls)
                .uploads
                .push((remote.to_owned(), contents));
            Ok(())
        })
    }

    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout_secs: Option<u64>,
    ) -> BackendFuture<'a, ManagerReply> {
        Box::pin(async move {
            locked(&self.calls)
                .executed
                .push((command.to_owned(), timeout_secs));
            Ok(self.reply.clone())
        })
    }

    fn map<'a>(&'a self, scripts: &'a [String]) -> BackendFuture<'a, Vec<ManagerReply>> {
        Box::pin(async move {
            locked(&self.calls).mapped.push(scripts.to_vec());
            Ok(scripts.iter().map(|_| self.reply.clone()).collect())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
