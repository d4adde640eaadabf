//! Command-line interface definitions for the `sortie` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `sortie` binary.
#[derive(Debug, Parser)]
#[command(
    name = "sortie",
    about = "Compose a launch script from .sortie.yml and dispatch it to a backend",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Increase log detail (`-v` debug, `-vv` trace); `RUST_LOG` wins.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `sortie`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Compose the launch script and dispatch it.
    #[command(name = "run", about = "Compose the launch script and dispatch it")]
    Run(RunCommand),
    /// Print the composed launch script without dispatching it.
    #[command(name = "script", about = "Print the composed launch script")]
    Script(JobArgs),
    /// Keep the process alive, logging a heartbeat.
    #[command(name = "listen", about = "Keep the process alive, logging a heartbeat")]
    Listen(ListenCommand),
}

/// Arguments for `sortie run`.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Keep listening after launch, optionally for SECS seconds only.
    #[arg(long, value_name = "SECS", num_args = 0..=1)]
    pub(crate) listen: Option<Option<u64>>,
    /// Job selection and overrides.
    #[command(flatten)]
    pub(crate) job: JobArgs,
}

/// Configuration selection, overrides, and the job itself.
#[derive(Debug, Args)]
pub(crate) struct JobArgs {
    /// Mode declared under `modes`; `local` runs the job here.
    #[arg(long, value_name = "MODE")]
    pub(crate) mode: Option<String>,
    /// Path to the job document; discovered from the working directory otherwise.
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Option<String>,
    /// Override a runner option (`key=value`, value read as YAML).
    #[arg(long = "runner", value_name = "KEY=VALUE", value_parser = parse_pair)]
    pub(crate) runner: Vec<(String, String)>,
    /// Override a launch option (`key=value`, value read as YAML).
    #[arg(long = "launch", value_name = "KEY=VALUE", value_parser = parse_pair)]
    pub(crate) launch: Vec<(String, String)>,
    /// Override a host option (`key=value`, value read as YAML).
    #[arg(long = "host", value_name = "KEY=VALUE", value_parser = parse_pair)]
    pub(crate) host: Vec<(String, String)>,
    /// Add a context extension (`key=value`, value read as YAML).
    #[arg(long = "ext", value_name = "KEY=VALUE", value_parser = parse_pair)]
    pub(crate) extensions: Vec<(String, String)>,
    /// Positional job parameter, read as YAML.
    #[arg(long = "arg", value_name = "VALUE")]
    pub(crate) args: Vec<String>,
    /// Keyword job parameter (`key=value`, value read as YAML).
    #[arg(long = "kwarg", value_name = "KEY=VALUE", value_parser = parse_pair)]
    pub(crate) kwargs: Vec<(String, String)>,
    /// Entry command of the job (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `sortie listen`.
#[derive(Debug, Args)]
pub(crate) struct ListenCommand {
    /// Stop after SECS seconds instead of listening forever.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
}

/// Splits `key=value` at the first `=`.
pub(crate) fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.to_owned()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
