//! Declarative job document (`.sortie.yml`) loading and resolution.
//!
//! A document has root defaults, an optional `run` block, and named
//! `modes`. Tagged nodes (`!mounts.S3Code`, `!runners.Docker`, `!ENV`, ...)
//! are built once at load time through a static registry; resolution then
//! overlays the selected layer on the root and applies call-time overrides.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::debug;

use crate::launch::{LaunchConfig, LaunchError};
use crate::mount::SharedMount;
use crate::runner::RunnerSpec;
use crate::template::{ResolutionContext, TemplateError};

mod parse;
mod registry;

/// File name searched for in the working directory and its ancestors.
pub const CONFIG_FILE_NAME: &str = ".sortie.yml";

/// Mode that runs the job on this machine without composing a script.
pub const LOCAL_MODE: &str = "local";

/// Errors raised while locating, parsing, or resolving a document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Raised when no document exists in the directory or its ancestors.
    #[error("no {CONFIG_FILE_NAME} found in {start} or any parent directory")]
    NotFound {
        /// Directory the search started from.
        start: Utf8PathBuf,
    },
    /// Raised when the requested mode is not declared.
    #[error("mode `{mode}` is not declared under `modes`; available: {}", .available.join(", "))]
    UnknownMode {
        /// Requested mode.
        mode: String,
        /// Declared mode names.
        available: Vec<String>,
    },
    /// Raised when no mode is requested and no `run` block exists.
    #[error("{path} has no `run` block; add one or select a mode")]
    MissingDefault {
        /// Document that lacks the block.
        path: Utf8PathBuf,
    },
    /// Raised when the document cannot be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the document is not valid YAML.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Parser error string.
        message: String,
    },
    /// Raised when a node carries a tag that is not registered.
    #[error("unknown tag `!{tag}`; known tags: {known}")]
    UnknownTag {
        /// Tag without the leading `!`.
        tag: String,
        /// Comma separated registered tags.
        known: String,
    },
    /// Raised when a tagged node or section has the wrong shape.
    #[error("invalid `{tag}`: {message}")]
    InvalidNode {
        /// Tag or field that failed.
        tag: String,
        /// Human readable cause.
        message: String,
    },
    /// Raised when interpolating a load-time template fails.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Raised when a call-time override cannot be applied.
    #[error("cannot apply {section} override: {message}")]
    InvalidOverride {
        /// Overridden section (`runner`, `launch`, or `host`).
        section: &'static str,
        /// Human readable cause.
        message: String,
    },
}

/// One configuration layer: root defaults, `run`, or a mode.
#[derive(Clone, Debug, Default)]
pub struct Section {
    /// Mounts, built at load time.
    pub mounts: Option<Vec<SharedMount>>,
    /// Runner declaration with options still holding placeholders.
    pub runner: Option<RunnerSpec>,
    /// Launch options, including the backend `type`.
    pub launch: Option<Mapping>,
    /// Host options used by mount uploads (e.g. the SSH target).
    pub host: Option<Mapping>,
    /// Debug logging of composed scripts.
    pub verbose: Option<bool>,
    /// Every other key, verbatim.
    pub extra: BTreeMap<String, Value>,
}

impl Section {
    /// Replaces every key `other` declares. Keys are replaced whole.
    pub fn overlay(&mut self, other: &Self) {
        if let Some(ref mounts) = other.mounts {
            self.mounts = Some(mounts.clone());
        }
        if let Some(ref runner) = other.runner {
            self.runner = Some(runner.clone());
        }
        if let Some(ref launch) = other.launch {
            self.launch = Some(launch.clone());
        }
        if let Some(ref host) = other.host {
            self.host = Some(host.clone());
        }
        if other.verbose.is_some() {
            self.verbose = other.verbose;
        }
        self.extra
            .extend(other.extra.iter().map(|(key, value)| (key.clone(), value.clone())));
    }
}

/// Partial updates supplied at call time.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    /// Merged key by key into the runner options.
    pub runner: Option<Mapping>,
    /// Merged key by key into the host options.
    pub host: Option<Mapping>,
    /// Merged key by key into the launch options.
    pub launch: Option<Mapping>,
}

/// Effective configuration for one mode activation.
#[derive(Clone, Debug, Default)]
pub struct ResolvedConfig {
    /// Selected mode, `None` for the `run` block.
    pub mode: Option<String>,
    /// Set for the `local` mode: the job runs here, unlaunched.
    pub local: bool,
    /// Mounts in declaration order.
    pub mounts: Vec<SharedMount>,
    /// Runner declaration, options not yet interpolated.
    pub runner: Option<RunnerSpec>,
    /// Launch options.
    pub launch: Mapping,
    /// Host options.
    pub host: Mapping,
    /// Debug logging of composed scripts.
    pub verbose: bool,
    /// Remaining keys with extensions flattened in last.
    pub extra: BTreeMap<String, Value>,
}

impl ResolvedConfig {
    /// Looks up a key outside the structured sections.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Parses the launch options.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] when `type` is missing or a field is invalid.
    pub fn launch_config(&self) -> Result<LaunchConfig, LaunchError> {
        LaunchConfig::from_mapping(self.launch.clone())
    }

    fn from_section(mode: Option<&str>, section: Section) -> Self {
        Self {
            mode: mode.map(ToOwned::to_owned),
            local: false,
            mounts: section.mounts.unwrap_or_default(),
            runner: section.runner,
            launch: section.launch.unwrap_or_default(),
            host: section.host.unwrap_or_default(),
            verbose: section.verbose.unwrap_or_default(),
            extra: section.extra,
        }
    }
}

/// A parsed document with every tagged node built.
#[derive(Debug)]
pub struct Document {
    path: Utf8PathBuf,
    root: Section,
    run: Option<Section>,
    modes: BTreeMap<String, Section>,
}

impl Document {
    /// Walks from `start` up to the filesystem root looking for the document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when no ancestor holds one, or
    /// [`ConfigError::Read`] when a directory cannot be inspected.
    pub fn discover(start: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
        for dir in start.ancestors() {
            let dir = if dir.as_str().is_empty() {
                Utf8Path::new(".")
            } else {
                dir
            };
            if contains_document(dir)? {
                let found = dir.join(CONFIG_FILE_NAME);
                debug!(path = %found, "found configuration document");
                return Ok(found);
            }
        }
        Err(ConfigError::NotFound {
            start: start.to_path_buf(),
        })
    }

    /// Reads and parses the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when reading, parsing, or building a tagged
    /// node fails.
    pub fn load(path: &Utf8Path, ctx: &ResolutionContext) -> Result<Self, ConfigError> {
        let text = read_document(path)?;
        Self::parse(path, &text, ctx)
    }

    /// Parses document `text`; `path` is used for diagnostics and as the
    /// config root.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the text is not YAML, uses an unknown
    /// tag, or a tagged node is malformed.
    pub fn parse(path: &Utf8Path, text: &str, ctx: &ResolutionContext) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(text).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let layout = parse::layout(&value, ctx)?;
        Ok(Self {
            path: path.to_path_buf(),
            root: layout.root,
            run: layout.run,
            modes: layout.modes,
        })
    }

    /// Path the document was loaded from.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Directory holding the document.
    #[must_use]
    pub fn root_dir(&self) -> &Utf8Path {
        self.path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."))
    }

    /// Declared mode names, sorted.
    #[must_use]
    pub fn mode_names(&self) -> Vec<String> {
        self.modes.keys().cloned().collect()
    }

    /// Resolves the effective configuration.
    ///
    /// Precedence, lowest first: root defaults, then `run` (no mode) or the
    /// named mode, then the runner, launch, and host overrides merged key by
    /// key, then `extensions` flattened into [`ResolvedConfig::extra`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownMode`], [`ConfigError::MissingDefault`],
    /// or [`ConfigError::InvalidOverride`] when a runner override is given
    /// but no runner is declared.
    pub fn resolve(
        &self,
        mode: Option<&str>,
        overrides: &Overrides,
        extensions: &BTreeMap<String, Value>,
    ) -> Result<ResolvedConfig, ConfigError> {
        let mut effective = self.root.clone();
        let local = mode == Some(LOCAL_MODE);
        match mode {
            Some(LOCAL_MODE) => {}
            Some(name) => {
                let layer = self.modes.get(name).ok_or_else(|| ConfigError::UnknownMode {
                    mode: name.to_owned(),
                    available: self.mode_names(),
                })?;
                effective.overlay(layer);
            }
            None => {
                let layer = self.run.as_ref().ok_or_else(|| ConfigError::MissingDefault {
                    path: self.path.clone(),
                })?;
                effective.overlay(layer);
            }
        }

        let mut resolved = ResolvedConfig::from_section(mode, effective);
        resolved.local = local;

        if let Some(ref runner) = overrides.runner {
            let spec = resolved
                .runner
                .as_mut()
                .ok_or_else(|| ConfigError::InvalidOverride {
                    section: "runner",
                    message: String::from("no runner is declared to override"),
                })?;
            spec.merge_options(runner);
        }
        if let Some(ref launch) = overrides.launch {
            merge_into(&mut resolved.launch, launch);
        }
        if let Some(ref host) = overrides.host {
            merge_into(&mut resolved.host, host);
        }
        resolved
            .extra
            .extend(extensions.iter().map(|(key, value)| (key.clone(), value.clone())));

        debug!(
            mode = mode.unwrap_or("run"),
            mounts = resolved.mounts.len(),
            runner = resolved.runner.as_ref().map(|spec| spec.kind.name()),
            "resolved configuration"
        );
        Ok(resolved)
    }
}

fn merge_into(target: &mut Mapping, updates: &Mapping) {
    for (key, value) in updates {
        target.insert(key.clone(), value.clone());
    }
}

fn contains_document(dir: &Utf8Path) -> Result<bool, ConfigError> {
    match Dir::open_ambient_dir(dir, ambient_authority()) {
        Ok(handle) => handle
            .try_exists(CONFIG_FILE_NAME)
            .map_err(|err| ConfigError::Read {
                path: dir.join(CONFIG_FILE_NAME),
                message: err.to_string(),
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ConfigError::Read {
            path: dir.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn read_document(path: &Utf8Path) -> Result<String, ConfigError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| ConfigError::Read {
        path: path.to_path_buf(),
        message: String::from("configuration path is missing a file name"),
    })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigError::Read {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    dir.read_to_string(file_name).map_err(|err| ConfigError::Read {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
