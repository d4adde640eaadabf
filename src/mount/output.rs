//! Output directories mirrored back to S3 while the job runs.

use serde::Deserialize;
use serde_yaml::Value;

use super::{Mount, MountError, MountId, parse_spec};

const fn default_interval() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct S3OutputSpec {
    s3_prefix: String,
    host_path: String,
    #[serde(default)]
    container_path: Option<String>,
    #[serde(default = "default_interval")]
    interval: u64,
}

/// Directory on the target periodically synced to an S3 prefix.
#[derive(Clone, Debug)]
pub struct S3Output {
    id: MountId,
    s3_prefix: String,
    host_path: String,
    container_path: String,
    interval: u64,
}

impl S3Output {
    /// Builds the mount from an interpolated declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Spec`] when required fields are missing.
    pub fn from_value(value: Value) -> Result<Self, MountError> {
        let spec: S3OutputSpec = parse_spec("S3Output", value)?;
        let container = spec
            .container_path
            .unwrap_or_else(|| spec.host_path.clone());
        Ok(Self {
            id: MountId::new(),
            s3_prefix: spec.s3_prefix,
            host_path: spec.host_path,
            container_path: container,
            interval: spec.interval,
        })
    }
}

impl Mount for S3Output {
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
        false
    }

    fn host_setup(&self) -> Option<String> {
        Some(format!("mkdir -p {}", self.host_path))
    }

    fn upload_fragment(&self) -> Option<String> {
        Some(format!(
            "while true; do aws s3 sync {} {} --quiet; sleep {}; done &",
            self.host_path, self.s3_prefix, self.interval
        ))
    }
}
