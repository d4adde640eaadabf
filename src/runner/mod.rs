//! Runners: execution strategies turning a [`Job`] into shell fragments.
//!
//! A runner is declared in `.sortie.yml` as a tag (`!runners.Docker`) over an
//! option mapping. Options are interpolated per run, then the selected kind
//! renders its setup, run, and post fragments for the launch script.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::mount::SharedMount;

mod docker;
mod simple;
mod slurm;

/// Environment variable carrying the encoded job parameters.
pub const PARAMS_ENV: &str = "SORTIE_PARAMS";

/// Errors raised while rendering runner fragments.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when the option mapping does not fit the runner kind.
    #[error("invalid {kind} runner options: {message}")]
    Options {
        /// Runner kind, e.g. `Docker`.
        kind: &'static str,
        /// Explanation of the mismatch.
        message: String,
    },
    /// Raised when job parameters cannot be serialised.
    #[error("failed to encode job parameters: {message}")]
    Encode {
        /// Serialiser message.
        message: String,
    },
}

/// The command to run and the parameters handed to it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Job {
    /// Entry command, executed with [`PARAMS_ENV`] set.
    pub command: Vec<String>,
    /// Positional parameters.
    pub args: Vec<serde_json::Value>,
    /// Keyword parameters.
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Creates a job running `command`.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Appends a positional parameter.
    #[must_use]
    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword parameter.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Base64 encoded JSON of the job, safe to embed in single-quoted shell.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Encode`] if serialisation fails.
    pub fn encode(&self) -> Result<String, RunnerError> {
        let json = serde_json::to_vec(self).map_err(|err| RunnerError::Encode {
            message: err.to_string(),
        })?;
        Ok(STANDARD.encode(json))
    }

    /// The command line with every word shell-escaped.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.command
            .iter()
            .map(|word| shell_escape::unix::escape(word.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runner kinds known to the tag registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunnerKind {
    /// Runs the job inside `docker run`.
    Docker,
    /// Runs the job in a plain shell, optionally detached under `screen`.
    Simple,
    /// Submits the job to SLURM with `srun` or `sbatch`.
    Slurm,
}

impl RunnerKind {
    /// Name used in the `!runners.<Name>` tag.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Docker => "Docker",
            Self::Simple => "Simple",
            Self::Slurm => "Slurm",
        }
    }
}

/// Shell fragments a runner contributes to the launch script.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunnerFragments {
    /// Runs before the job, e.g. environment preparation.
    pub setup: String,
    /// Runs the job.
    pub run: String,
    /// Runs after the job.
    pub post: String,
}

/// Runner declaration: a kind and its option mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerSpec {
    /// Selected strategy.
    pub kind: RunnerKind,
    /// Options, possibly still containing `{placeholders}`.
    pub options: Mapping,
}

impl RunnerSpec {
    /// Creates a declaration.
    #[must_use]
    pub const fn new(kind: RunnerKind, options: Mapping) -> Self {
        Self { kind, options }
    }

    /// Merges `overrides` key by key, keeping options it does not name.
    pub fn merge_options(&mut self, overrides: &Mapping) {
        for (key, value) in overrides {
            self.options.insert(key.clone(), value.clone());
        }
    }

    /// Renders fragments for `job` from already-interpolated `options`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the options do not fit the kind or the
    /// job cannot be encoded.
    pub fn fragments(
        &self,
        options: &Mapping,
        job: &Job,
        mounts: &[SharedMount],
    ) -> Result<RunnerFragments, RunnerError> {
        let launch = EntryPoint::new(job)?;
        match self.kind {
            RunnerKind::Docker => {
                docker::fragments(parse_options(self.kind, options)?, &launch, mounts)
            }
            RunnerKind::Simple => Ok(simple::fragments(
                parse_options(self.kind, options)?,
                &launch,
            )),
            RunnerKind::Slurm => slurm::fragments(parse_options(self.kind, options)?, &launch),
        }
    }
}

/// Encoded job plus its default entry command.
#[derive(Clone, Debug)]
struct EntryPoint {
    payload: String,
    command: String,
}

impl EntryPoint {
    fn new(job: &Job) -> Result<Self, RunnerError> {
        Ok(Self {
            payload: job.encode()?,
            command: job.command_line(),
        })
    }

    /// `SORTIE_PARAMS=<payload>`.
    fn assignment(&self) -> String {
        format!("{PARAMS_ENV}={}", self.payload)
    }

    /// The explicit entry script when configured, else the job command.
    fn entry<'a>(&'a self, entry_script: Option<&'a str>) -> &'a str {
        entry_script.unwrap_or(&self.command)
    }

    /// `SORTIE_PARAMS=<payload> <entry>`.
    fn invocation(&self, entry_script: Option<&str>) -> String {
        format!("{} {}", self.assignment(), self.entry(entry_script))
    }
}

fn parse_options<T: DeserializeOwned>(kind: RunnerKind, options: &Mapping) -> Result<T, RunnerError> {
    serde_yaml::from_value(Value::Mapping(options.clone())).map_err(|err| RunnerError::Options {
        kind: kind.name(),
        message: err.to_string(),
    })
}

/// Terminates a non-empty script with `;` so it can be inlined.
fn inline(script: &str) -> String {
    let trimmed = script.trim();
    if trimmed.is_empty() || trimmed.ends_with(';') {
        return trimmed.to_owned();
    }
    format!("{trimmed};")
}

/// Renders catch-all options as `--key-name=value` flags.
fn extra_flags(options: &BTreeMap<String, Value>, quote: bool) -> String {
    options
        .iter()
        .map(|(key, value)| {
            let flag = key.replace('_', "-");
            let text = scalar_text(value);
            if quote {
                format!("--{flag}=\"{text}\"")
            } else {
                format!("--{flag}={text}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_owned())
            .unwrap_or_default(),
    }
}

/// Joins non-empty lines with newlines.
fn lines<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Joins non-empty words with single spaces.
fn words<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prefixes `command` with an optional environment assignment string.
fn with_envs(envs: Option<&str>, command: &str) -> String {
    match envs.map(str::trim).filter(|text| !text.is_empty()) {
        Some(prefix) => format!("{prefix} {command}"),
        None => command.to_owned(),
    }
}

#[cfg(test)]
mod tests;
