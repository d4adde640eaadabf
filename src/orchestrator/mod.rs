//! Mount and runner bookkeeping across repeated launches.
//!
//! The orchestrator tracks which mounts were uploaded and whether the host
//! has already unpacked them, so repeated runs within one session neither
//! re-upload code nor unpack it twice.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::launch::{BackendKind, ScriptOptions};
use crate::mount::{MountError, MountId, SharedMount, UploadContext};
use crate::runner::RunnerFragments;
use crate::script::{self, ScriptBody, ScriptError};

/// Whether mount host setup already ran on the target.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum HostUnpack {
    /// Launch scripts still carry host setup fragments.
    #[default]
    NotUnpacked,
    /// Host setup ran; carries the unpack script when one was composed.
    Unpacked(Option<String>),
}

/// Owns mounts, the active runner, and the idempotency flags.
#[derive(Debug, Default)]
pub struct Orchestrator {
    mounts: Vec<SharedMount>,
    runner: Option<RunnerFragments>,
    uploaded: HashSet<MountId>,
    host_unpacked: HostUnpack,
}

impl Orchestrator {
    /// Creates an orchestrator with no mounts and no runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mount list.
    pub fn set_mounts(&mut self, mounts: Vec<SharedMount>) {
        self.mounts = mounts;
    }

    /// Replaces the runner fragments used for the next launch script.
    pub fn set_runner(&mut self, runner: RunnerFragments) {
        self.runner = Some(runner);
    }

    /// Current mounts, in declaration order.
    #[must_use]
    pub fn mounts(&self) -> &[SharedMount] {
        &self.mounts
    }

    /// Current host unpack state.
    #[must_use]
    pub const fn host_unpack(&self) -> &HostUnpack {
        &self.host_unpacked
    }

    /// Whether host setup already ran.
    #[must_use]
    pub const fn is_host_unpacked(&self) -> bool {
        matches!(self.host_unpacked, HostUnpack::Unpacked(_))
    }

    /// Uploads every mount not uploaded yet, returning how many ran.
    ///
    /// A mount is recorded as uploaded only after its upload succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first [`MountError`]; later mounts are not attempted.
    pub fn upload_mounts(&mut self, ctx: &UploadContext<'_>) -> Result<usize, MountError> {
        let mut count = 0;
        for mount in &self.mounts {
            let id = mount.id();
            if self.uploaded.contains(&id) {
                debug!(mount = %id, host_path = mount.host_path(), "mount already uploaded");
                continue;
            }
            mount.upload(ctx)?;
            self.uploaded.insert(id);
            count += 1;
        }
        Ok(count)
    }

    /// Host setup fragments of every mount, in order.
    #[must_use]
    pub fn host_setup_fragments(&self) -> Vec<String> {
        self.mounts
            .iter()
            .filter_map(|mount| mount.host_setup())
            .filter(|fragment| !fragment.trim().is_empty())
            .collect()
    }

    /// Composes the launch script, omitting host setup once unpacked.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError`] for unsupported option combinations or when
    /// no runner was set. Capabilities are checked first.
    pub fn compose_launch_script(
        &self,
        kind: BackendKind,
        options: &ScriptOptions,
    ) -> Result<String, ScriptError> {
        script::check(kind, options)?;
        let runner = self.runner.clone().ok_or(ScriptError::MissingRunner)?;
        let host_setup = if self.is_host_unpacked() {
            Vec::new()
        } else {
            self.host_setup_fragments()
        };
        let uploads = self
            .mounts
            .iter()
            .filter_map(|mount| mount.upload_fragment())
            .collect();

        script::compose(
            kind,
            options,
            &ScriptBody {
                host_setup,
                uploads,
                runner,
            },
        )
    }

    /// Composes the host unpack script and marks the host as unpacked.
    ///
    /// Once unpacked, the cached script is returned unchanged.
    pub fn compose_host_unpack_script(&mut self, options: &ScriptOptions) -> String {
        if let HostUnpack::Unpacked(Some(ref cached)) = self.host_unpacked {
            return cached.clone();
        }
        let unpack = script::compose_host_unpack(options, &self.host_setup_fragments());
        info!(mounts = self.mounts.len(), "composed host unpack script");
        self.host_unpacked = HostUnpack::Unpacked(Some(unpack.clone()));
        unpack
    }

    /// Records that host setup ran by other means, e.g. the manager.
    pub fn mark_host_unpacked(&mut self) {
        if !self.is_host_unpacked() {
            self.host_unpacked = HostUnpack::Unpacked(None);
        }
    }
}
