//! Runs the launch script on this machine.

use serde::Deserialize;
use tracing::{debug, info};

use super::{Backend, BackendContext, BackendFuture, LaunchHandle, LaunchRequest, options};
use crate::exec::os_args;

#[derive(Debug, Default, Deserialize)]
struct LocalOptions {
    #[serde(default)]
    dry: bool,
}

/// Pipes the script into `bash` and waits for it.
pub struct LocalBackend<'a> {
    ctx: BackendContext<'a>,
}

impl<'a> LocalBackend<'a> {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(ctx: BackendContext<'a>) -> Self {
        Self { ctx }
    }
}

impl Backend for LocalBackend<'_> {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, LaunchHandle> {
        Box::pin(async move {
            let opts: LocalOptions = options(&request.config)?;
            if opts.dry {
                info!(script = %request.script, "dry run: local script not executed");
                return Ok(LaunchHandle::DryRun(vec![request.script.clone()]));
            }

            let output = self.ctx.runner.run_with_input(
                &self.ctx.settings.bash_bin,
                &os_args(["-s"]),
                &request.script,
            )?;
            debug!(stdout = %output.stdout, stderr = %output.stderr, "local script finished");
            Ok(LaunchHandle::Exit(output.code))
        })
    }
}
