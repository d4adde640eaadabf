//! Process execution seam shared by mounts and backends.
//!
//! Everything that shells out (`tar`, `scp`, `ssh`, `aws`, `bash`) goes through
//! a [`CommandRunner`] so tests can script outcomes without spawning
//! processes.

use std::ffi::OsString;
use std::io::Write;
use std::process::{Command, Stdio};

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status used in error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Where a detached child writes its output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    /// Output is piped and discarded by the parent (console mode).
    Captured,
    /// Output is passed through to the caller's standard streams.
    Inherited,
}

/// Errors surfaced while spawning or feeding a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when writing to the child's stdin fails.
    #[error("failed to write stdin of {program}: {message}")]
    Stdin {
        /// Command whose stdin could not be written.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

impl ExecError {
    /// Builds a [`ExecError::CommandFailure`] from captured output.
    #[must_use]
    pub fn failure(program: &str, output: &CommandOutput) -> Self {
        Self::CommandFailure {
            program: program.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError>;

    /// Runs `program`, writes `stdin` to it, and waits for completion.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] if the command cannot be started or fed.
    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
    ) -> Result<CommandOutput, ExecError>;

    /// Starts `program`, writes `stdin` to it, and returns without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] if the command cannot be started or fed.
    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
        output: OutputMode,
    ) -> Result<(), ExecError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    fn spawn_piped(
        program: &str,
        args: &[OsString],
        output: OutputMode,
    ) -> Result<std::process::Child, ExecError> {
        let (stdout, stderr) = match output {
            OutputMode::Captured => (Stdio::piped(), Stdio::piped()),
            OutputMode::Inherited => (Stdio::inherit(), Stdio::inherit()),
        };
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| ExecError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })
    }

    fn feed(
        program: &str,
        child: &mut std::process::Child,
        stdin: &str,
    ) -> Result<(), ExecError> {
        let Some(mut pipe) = child.stdin.take() else {
            return Ok(());
        };
        pipe.write_all(stdin.as_bytes())
            .and_then(|()| pipe.flush())
            .map_err(|err| ExecError::Stdin {
                program: program.to_owned(),
                message: err.to_string(),
            })
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| ExecError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
    ) -> Result<CommandOutput, ExecError> {
        let mut child = Self::spawn_piped(program, args, OutputMode::Captured)?;
        Self::feed(program, &mut child, stdin)?;
        let output = child.wait_with_output().map_err(|err| ExecError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
        output: OutputMode,
    ) -> Result<(), ExecError> {
        let mut child = Self::spawn_piped(program, args, output)?;
        Self::feed(program, &mut child, stdin)
    }
}

/// Converts string slices into the argument vector expected by runners.
#[must_use]
pub fn os_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    args.into_iter().map(Into::into).collect()
}

/// Runs a command and converts a non-zero exit into [`ExecError::CommandFailure`].
///
/// # Errors
///
/// Returns [`ExecError`] when spawning fails or the command exits non-zero.
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[OsString],
) -> Result<CommandOutput, ExecError> {
    let output = runner.run(program, args)?;
    if output.is_success() {
        return Ok(output);
    }
    Err(ExecError::failure(program, &output))
}
