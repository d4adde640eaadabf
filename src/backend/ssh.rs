//! Copies the launch script to an SSH host and runs it there.
//!
//! The remote copy is named `sortie-launch-<run-id>.sh`. The job block
//! exports [`RUN_ID_ENV`] before its first command, so every process it
//! starts (background upload loops included) carries the run id in its
//! environment. The cleanup fragment kills the processes whose
//! `/proc/<pid>/environ` holds that tag, sparing the script shell and its
//! parent. The log `tee` processes start before the export and are left to
//! drain.

use std::ffi::OsString;

use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Backend, BackendContext, BackendError, BackendFuture, LaunchHandle, LaunchRequest, ScriptFile,
    options,
};
use crate::exec::{OutputMode, run_checked};
use crate::ssh::{SshTarget, render_command};

const REMOTE_DIR: &str = "/tmp";

/// Environment variable tagging every process started by a launch script.
pub const RUN_ID_ENV: &str = "SORTIE_RUN_ID";

/// How the local `ssh` process is handled after the script starts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SshMode {
    /// Wait for completion and capture output.
    Block,
    /// Return immediately; output is captured and dropped.
    Console,
    /// Return immediately; output streams to this process.
    Stream,
}

#[derive(Debug, Deserialize)]
struct SshOptions {
    #[serde(flatten)]
    target: SshTarget,
    #[serde(default)]
    sudo: bool,
    #[serde(default = "default_cleanup")]
    cleanup: bool,
    #[serde(default)]
    block: bool,
    #[serde(default)]
    console_mode: bool,
    #[serde(default)]
    dry: bool,
}

const fn default_cleanup() -> bool {
    true
}

impl SshOptions {
    const fn mode(&self) -> SshMode {
        if self.block {
            SshMode::Block
        } else if self.console_mode {
            SshMode::Console
        } else {
            SshMode::Stream
        }
    }
}

/// Remote file name for a run.
#[must_use]
pub fn remote_script_path(run_id: Uuid) -> String {
    format!("{REMOTE_DIR}/sortie-launch-{run_id}.sh")
}

/// Exports the run tag as the first statement of the job block.
///
/// Scripts without a braced block get the export after their shebang line.
#[must_use]
pub fn tag_script(script: &str, run_id: Uuid) -> String {
    let export = format!("export {RUN_ID_ENV}={run_id}");
    let mut lines: Vec<&str> = script.lines().collect();
    let at = lines.iter().position(|line| *line == "{").map_or_else(
        || usize::from(lines.first().is_some_and(|line| line.starts_with("#!"))),
        |index| index + 1,
    );
    lines.insert(at, &export);
    let mut tagged = lines.join("\n");
    tagged.push('\n');
    tagged
}

/// Shell fragment killing leftovers of the run tagged with `run_id`.
#[must_use]
pub fn cleanup_fragment(run_id: Uuid, sudo: bool) -> String {
    let kill = if sudo { "sudo kill" } else { "kill" };
    format!(
        "PROCESSES=\"\"\n\
         for ENVIRON in $(grep -lsxz '{RUN_ID_ENV}={run_id}' /proc/[0-9]*/environ); do\n\
         PID=${{ENVIRON#/proc/}}\n\
         PID=${{PID%/environ}}\n\
         if [ \"$PID\" != \"$$\" ] && [ \"$PID\" != \"$PPID\" ]; then\n\
         PROCESSES=\"$PROCESSES $PID\"\n\
         fi\n\
         done\n\
         if [ -n \"$PROCESSES\" ]; then\n\
         {kill} $PROCESSES 2>/dev/null || true\n\
         fi"
    )
}

/// Ships the script with `scp` and starts it with `ssh`.
pub struct SshBackend<'a> {
    ctx: BackendContext<'a>,
}

impl<'a> SshBackend<'a> {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(ctx: BackendContext<'a>) -> Self {
        Self { ctx }
    }

    /// Runs `request` to completion regardless of the configured mode.
    ///
    /// Used to unpack mounts on the host before the main script runs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when options are invalid or a command fails.
    pub fn run_blocking<'b>(&'b self, request: &'b LaunchRequest) -> BackendFuture<'b, LaunchHandle> {
        Box::pin(async move { self.execute(request, Some(SshMode::Block)) })
    }

    fn execute(
        &self,
        request: &LaunchRequest,
        forced: Option<SshMode>,
    ) -> Result<LaunchHandle, BackendError> {
        let opts: SshOptions = options(&request.config)?;
        let mode = forced.unwrap_or_else(|| opts.mode());
        let remote = remote_script_path(request.run_id);

        let mut script = tag_script(&request.script, request.run_id);
        if opts.cleanup {
            if !script.ends_with('\n') {
                script.push('\n');
            }
            script.push_str(&cleanup_fragment(request.run_id, opts.sudo));
            script.push('\n');
        }

        let settings = self.ctx.settings;
        let file = ScriptFile::write("sortie-launch-", &script)?;
        let (scp, scp_args) = opts
            .target
            .scp_command(settings, file.path().as_str(), &remote);
        let shell = if opts.sudo {
            format!("sudo bash {remote}")
        } else {
            format!("bash {remote}")
        };
        let (ssh, ssh_args) = opts.target.ssh_command(settings, &[OsString::from(shell)]);

        if opts.dry {
            let commands = vec![
                render_command(&scp, &scp_args),
                render_command(&ssh, &ssh_args),
            ];
            info!(commands = ?commands, "dry run: ssh launch not executed");
            debug!(script = %script, "ssh launch script");
            return Ok(LaunchHandle::DryRun(commands));
        }

        run_checked(self.ctx.runner, &scp, &scp_args)?;
        debug!(remote = %remote, host = %opts.target.destination(), "uploaded launch script");

        match mode {
            SshMode::Block => {
                let output = self.ctx.runner.run(&ssh, &ssh_args)?;
                Ok(LaunchHandle::Captured(output))
            }
            SshMode::Console => {
                self.ctx
                    .runner
                    .spawn(&ssh, &ssh_args, "", OutputMode::Captured)?;
                Ok(LaunchHandle::Detached)
            }
            SshMode::Stream => {
                self.ctx
                    .runner
                    .spawn(&ssh, &ssh_args, "", OutputMode::Inherited)?;
                Ok(LaunchHandle::Detached)
            }
        }
    }
}

impl Backend for SshBackend<'_> {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, LaunchHandle> {
        Box::pin(async move { self.execute(request, None) })
    }
}
