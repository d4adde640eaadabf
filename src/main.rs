//! Binary entry point for the `sortie` CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use sortie::backend::LaunchHandle;
use sortie::config::Overrides;
use sortie::exec::ProcessCommandRunner;
use sortie::runner::Job;
use sortie::session::{ConfigureRequest, Session, SessionError, listen};
use sortie::settings::{Settings, SettingsError};

mod cli;

use cli::{Cli, Command, JobArgs, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid value for {flag}: {message}")]
    Value { flag: String, message: String },
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    sortie::logging::init(cli.verbose);

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> Result<ExitCode, CliError> {
    match command {
        Command::Run(run) => run_command(run).await,
        Command::Script(args) => script_command(&args),
        Command::Listen(listen_args) => {
            listen(listen_args.timeout.map(Duration::from_secs)).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_command(command: RunCommand) -> Result<ExitCode, CliError> {
    let (mut session, job) = configure(&command.job, false)?;
    let handle = session.run(&job, &BTreeMap::new()).await?;
    let code = report_handle(io::stdout(), &handle)?;
    if let Some(timeout) = command.listen {
        listen(timeout.map(Duration::from_secs)).await;
    }
    Ok(code)
}

fn script_command(args: &JobArgs) -> Result<ExitCode, CliError> {
    let (mut session, job) = configure(args, true)?;
    let prepared = session.compose(&job, &BTreeMap::new())?;
    write!(io::stdout(), "{}", prepared.script)?;
    Ok(ExitCode::SUCCESS)
}

fn configure(args: &JobArgs, compose_only: bool) -> Result<(Session, Job), CliError> {
    let settings = Settings::load_without_cli_args()?;
    let request = ConfigureRequest {
        mode: args.mode.clone(),
        config_path: args.config.as_deref().map(Utf8PathBuf::from),
        work_dir: None,
        overrides: Overrides {
            runner: non_empty(mapping("--runner", &args.runner)?),
            host: non_empty(mapping("--host", &args.host)?),
            launch: non_empty(mapping("--launch", &args.launch)?),
        },
        extensions: mapping("--ext", &args.extensions)?
            .into_iter()
            .filter_map(|(key, value)| key.as_str().map(|name| (name.to_owned(), value)))
            .collect(),
        compose_only,
    };
    let session = Session::configure(Arc::new(ProcessCommandRunner), settings, request)?;
    Ok((session, job(args)?))
}

fn job(args: &JobArgs) -> Result<Job, CliError> {
    let mut job = Job::new(args.command.iter().cloned());
    for raw in &args.args {
        job = job.arg(json_value("--arg", raw)?);
    }
    for (key, raw) in &args.kwargs {
        job = job.kwarg(key.clone(), json_value("--kwarg", raw)?);
    }
    Ok(job)
}

fn yaml_value(flag: &str, raw: &str) -> Result<Value, CliError> {
    serde_yaml::from_str(raw).map_err(|err| CliError::Value {
        flag: flag.to_owned(),
        message: err.to_string(),
    })
}

fn json_value(flag: &str, raw: &str) -> Result<serde_json::Value, CliError> {
    let value = yaml_value(flag, raw)?;
    serde_json::to_value(value).map_err(|err| CliError::Value {
        flag: flag.to_owned(),
        message: err.to_string(),
    })
}

fn mapping(flag: &str, pairs: &[(String, String)]) -> Result<Mapping, CliError> {
    let mut mapping = Mapping::new();
    for (key, raw) in pairs {
        mapping.insert(Value::from(key.as_str()), yaml_value(flag, raw)?);
    }
    Ok(mapping)
}

fn non_empty(mapping: Mapping) -> Option<Mapping> {
    (!mapping.is_empty()).then_some(mapping)
}

/// Prints what the backend returned and derives the process exit code.
fn report_handle(mut out: impl Write, handle: &LaunchHandle) -> Result<ExitCode, CliError> {
    let code = match handle {
        LaunchHandle::Exit(code) => {
            let status = code.map_or_else(|| String::from("signal"), |value| value.to_string());
            writeln!(out, "exit status: {status}")?;
            exit_code(*code)
        }
        LaunchHandle::Captured(output) => {
            write!(out, "{}", output.stdout)?;
            exit_code(output.code)
        }
        LaunchHandle::Detached => {
            writeln!(out, "launched; output streams from the remote host")?;
            ExitCode::SUCCESS
        }
        LaunchHandle::SpotRequest(id) => {
            writeln!(out, "spot request: {id}")?;
            ExitCode::SUCCESS
        }
        LaunchHandle::Instance(id) => {
            writeln!(out, "instance: {id}")?;
            ExitCode::SUCCESS
        }
        LaunchHandle::DryRun(lines) => {
            for line in lines {
                writeln!(out, "{line}")?;
            }
            ExitCode::SUCCESS
        }
        LaunchHandle::Request(body) => {
            let text = serde_json::to_string_pretty(body).map_err(io::Error::other)?;
            writeln!(out, "{text}")?;
            ExitCode::SUCCESS
        }
        LaunchHandle::Manager(reply) => {
            write!(out, "{}", reply.stdout)?;
            if reply.error.is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
    };
    Ok(code)
}

fn exit_code(code: Option<i32>) -> ExitCode {
    match code {
        Some(0) => ExitCode::SUCCESS,
        Some(value) => ExitCode::from(u8::try_from(value).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

fn report_error(err: &CliError) {
    writeln!(io::stderr(), "{err}").ok();
}
