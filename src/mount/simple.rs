//! A path already present on the target.

use serde::Deserialize;
use serde_yaml::Value;

use super::{Mount, MountError, MountId, parse_spec};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimpleSpec {
    host_path: String,
    #[serde(default)]
    container_path: Option<String>,
    #[serde(default)]
    pypath: bool,
}

/// Mount that only maps an existing host path; it needs no setup or upload.
#[derive(Clone, Debug)]
pub struct Simple {
    id: MountId,
    host_path: String,
    container_path: String,
    pypath: bool,
}

impl Simple {
    /// Creates a mount for `host_path`, mirrored at the same container path.
    #[must_use]
    pub fn new(host_path: impl Into<String>, pypath: bool) -> Self {
        let host = host_path.into();
        Self {
            id: MountId::new(),
            container_path: host.clone(),
            host_path: host,
            pypath,
        }
    }

    /// Builds the mount from an interpolated declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Spec`] when `host_path` is missing.
    pub fn from_value(value: Value) -> Result<Self, MountError> {
        let spec: SimpleSpec = parse_spec("Simple", value)?;
        let container = spec
            .container_path
            .unwrap_or_else(|| spec.host_path.clone());
        Ok(Self {
            id: MountId::new(),
            host_path: spec.host_path,
            container_path: container,
            pypath: spec.pypath,
        })
    }
}

impl Mount for Simple {
    fn id(&self) -> MountId {
        self.id
    }

    fn host_path(&self) -> &str {
        &self.host_path
    }

    fn container_path(&self) -> &str {
        &self.container_path
    }

    fn on_search_path(&self) -> bool {
        self.pypath
    }
}
