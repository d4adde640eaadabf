//! Static table binding YAML tags to constructors.

use std::sync::Arc;

use serde_yaml::Value;

use crate::mount::{GsCode, MountError, S3Code, S3Output, SharedMount, Simple, SshCode};
use crate::runner::RunnerKind;

/// Builds a mount from its interpolated declaration.
pub(crate) type MountConstructor = fn(Value) -> Result<SharedMount, MountError>;

/// What a registered tag produces.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TagKind {
    /// A plain mapping whose strings are interpolated at load time.
    Mapping,
    /// A mount built at load time.
    Mount(MountConstructor),
    /// A runner declaration whose options are interpolated per run.
    Runner(RunnerKind),
}

fn s3_code(value: Value) -> Result<SharedMount, MountError> {
    Ok(Arc::new(S3Code::from_value(value)?))
}

fn gs_code(value: Value) -> Result<SharedMount, MountError> {
    Ok(Arc::new(GsCode::from_value(value)?))
}

fn ssh_code(value: Value) -> Result<SharedMount, MountError> {
    Ok(Arc::new(SshCode::from_value(value)?))
}

fn simple(value: Value) -> Result<SharedMount, MountError> {
    Ok(Arc::new(Simple::from_value(value)?))
}

fn s3_output(value: Value) -> Result<SharedMount, MountError> {
    Ok(Arc::new(S3Output::from_value(value)?))
}

const REGISTRY: &[(&str, TagKind)] = &[
    ("ENV", TagKind::Mapping),
    ("host", TagKind::Mapping),
    ("mounts.S3Code", TagKind::Mount(s3_code)),
    ("mounts.GsCode", TagKind::Mount(gs_code)),
    ("mounts.SshCode", TagKind::Mount(ssh_code)),
    ("mounts.Simple", TagKind::Mount(simple)),
    ("mounts.S3Output", TagKind::Mount(s3_output)),
    ("runners.Docker", TagKind::Runner(RunnerKind::Docker)),
    ("runners.Simple", TagKind::Runner(RunnerKind::Simple)),
    ("runners.Slurm", TagKind::Runner(RunnerKind::Slurm)),
];

/// Finds the constructor for `name` (without the leading `!`).
pub(crate) fn lookup(name: &str) -> Option<TagKind> {
    REGISTRY
        .iter()
        .find(|(tag, _)| *tag == name)
        .map(|(_, kind)| *kind)
}

/// Every registered tag, for diagnostics.
pub(crate) fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(tag, _)| *tag).collect()
}
