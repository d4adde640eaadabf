//! Launch script composition.
//!
//! Fragments are assembled in a fixed order: root config, log directory,
//! then a braced block holding launch setup, instance tagging, mount host
//! setup, mount uploads, runner setup/run/post, and termination. The block's
//! output is duplicated into two log files unless `pipe_out` overrides it.

use thiserror::Error;

use crate::launch::{BackendKind, MAX_INSTANCE_NAME, ScriptOptions};
use crate::runner::RunnerFragments;

/// Errors raised before any script text is produced.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptError {
    /// Raised when termination is requested on a backend that cannot do it.
    #[error("terminate_after is not supported with {kind}")]
    UnsupportedCapability {
        /// Canonical backend type.
        kind: &'static str,
    },
    /// Raised when the instance name exceeds the tag length limit.
    #[error("instance name has {length} characters; cloud tags are limited to 128")]
    InstanceNameTooLong {
        /// Length of the rejected name.
        length: usize,
    },
    /// Raised when a launch script is requested before a runner is set.
    #[error("no runner configured; add a `runner` entry to the configuration")]
    MissingRunner,
}

/// Fragments contributed by mounts and the runner.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScriptBody {
    /// Mount host setup fragments, in mount order.
    pub host_setup: Vec<String>,
    /// Mount upload fragments, in mount order.
    pub uploads: Vec<String>,
    /// Runner fragments.
    pub runner: RunnerFragments,
}

const HEADER: &str = "#!/bin/bash\n# process substitution needs bash outside posix mode\nset +o posix";
const EC2_METADATA: &str = "http://169.254.169.254/latest/meta-data";
const GCE_METADATA: &str = "http://metadata.google.internal/computeMetadata/v1/instance";

/// Rejects option combinations the backend cannot honour.
///
/// # Errors
///
/// Returns [`ScriptError::UnsupportedCapability`] when `terminate_after` is
/// set for a backend without a termination strategy, and
/// [`ScriptError::InstanceNameTooLong`] for names over 128 characters.
pub fn check(kind: BackendKind, options: &ScriptOptions) -> Result<(), ScriptError> {
    if options.terminate_after && !kind.supports_termination() {
        return Err(ScriptError::UnsupportedCapability {
            kind: kind.as_str(),
        });
    }
    if let Some(ref name) = options.instance_name {
        let length = name.chars().count();
        if length > MAX_INSTANCE_NAME {
            return Err(ScriptError::InstanceNameTooLong { length });
        }
    }
    Ok(())
}

/// Composes the full launch script.
///
/// # Errors
///
/// Returns [`ScriptError`] from [`check`]; nothing is composed on failure.
pub fn compose(
    kind: BackendKind,
    options: &ScriptOptions,
    body: &ScriptBody,
) -> Result<String, ScriptError> {
    check(kind, options)?;

    let launch_dir = &options.launch_dir;
    let tag = match (kind, options.instance_name.as_deref()) {
        (BackendKind::Ec2, Some(name)) => Some(ec2_tag_instance(name)),
        _ => None,
    };
    let terminate = options
        .terminate_after
        .then(|| terminate_commands(kind, options.delay))
        .flatten();

    let mut block: Vec<&str> = Vec::new();
    block.extend(options.setup.as_deref());
    block.extend(tag.as_deref());
    block.extend(body.host_setup.iter().map(String::as_str));
    block.extend(body.uploads.iter().map(String::as_str));
    block.extend([
        body.runner.setup.as_str(),
        body.runner.run.as_str(),
        body.runner.post.as_str(),
    ]);
    block.extend(terminate.as_deref());

    let redirect = options
        .pipe_out
        .clone()
        .unwrap_or_else(|| default_redirect(launch_dir));
    let directory = format!("mkdir -p {launch_dir}\nSORTIE_LAUNCH_DIR={launch_dir}");

    Ok(assemble(
        options.root_config.as_deref(),
        &directory,
        &block,
        &redirect,
    ))
}

/// Composes the minimal script that only unpacks mounts on the host.
#[must_use]
pub fn compose_host_unpack(options: &ScriptOptions, host_setup: &[String]) -> String {
    let launch_dir = &options.launch_dir;
    let sleep = options.delay.map(|delay| format!("sleep {delay}"));
    let mut block: Vec<&str> = host_setup.iter().map(String::as_str).collect();
    block.extend(sleep.as_deref());

    assemble(
        options.root_config.as_deref(),
        &format!("mkdir -p {launch_dir}"),
        &block,
        &default_redirect(launch_dir),
    )
}

fn assemble(root_config: Option<&str>, directory: &str, block: &[&str], redirect: &str) -> String {
    let mut sections = vec![HEADER.to_owned()];
    sections.extend(non_empty(root_config.unwrap_or_default()));
    sections.push(directory.to_owned());
    sections.push(String::from("{"));
    sections.extend(block.iter().filter_map(|fragment| non_empty(fragment)));
    let redirect_text = redirect.trim();
    if redirect_text.is_empty() {
        sections.push(String::from("}"));
    } else {
        sections.push(format!("}} {redirect_text}"));
    }
    let mut script = sections.join("\n");
    script.push('\n');
    script
}

fn non_empty(fragment: &str) -> Option<String> {
    let trimmed = fragment.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn default_redirect(launch_dir: &str) -> String {
    format!(
        "> >(tee -a {launch_dir}/sortie-launch.log) 2> >(tee -a {launch_dir}/sortie-launch.err.log >&2)"
    )
}

fn ec2_region() -> String {
    format!("$(curl -s {EC2_METADATA}/placement/region)")
}

fn ec2_tag_instance(name: &str) -> String {
    format!(
        "EC2_INSTANCE_ID=\"$(curl -s {EC2_METADATA}/instance-id)\"\n\
         aws ec2 create-tags --resources $EC2_INSTANCE_ID --tags Key=Name,Value='{name}' --region {}",
        ec2_region()
    )
}

fn terminate_commands(kind: BackendKind, delay: Option<u64>) -> Option<String> {
    let sleep = delay.map(|secs| format!("sleep {secs}\n")).unwrap_or_default();
    match kind {
        BackendKind::Ec2 => Some(format!(
            "{sleep}aws ec2 terminate-instances --instance-ids \"$(curl -s {EC2_METADATA}/instance-id)\" --region {}",
            ec2_region()
        )),
        BackendKind::Gce => Some(format!(
            "{sleep}gcloud compute instances delete \"$(hostname)\" --quiet --zone \
             \"$(curl -s -H 'Metadata-Flavor: Google' {GCE_METADATA}/zone | cut -d/ -f4)\""
        )),
        BackendKind::LocalDocker | BackendKind::Ssh | BackendKind::Manager => None,
    }
}

#[cfg(test)]
mod tests;
