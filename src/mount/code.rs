//! Code mounts: a local directory packed into a tarball, shipped to object
//! storage or straight to the SSH host, and unpacked on the target.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::info;
use uuid::Uuid;

use super::archive::{self, Archive};
use super::{Mount, MountError, MountId, UploadContext, default_compress, default_local_path, parse_spec};
use crate::exec::{os_args, run_checked};
use crate::ssh::SshTarget;

/// Fields shared by every code mount once its declaration is parsed.
#[derive(Clone, Debug)]
struct CodeLayout {
    id: MountId,
    local_path: String,
    host_path: String,
    container_path: String,
    pypath: bool,
    excludes: Vec<String>,
    compress: bool,
    archive_name: String,
}

impl CodeLayout {
    fn new(
        local_path: String,
        host_path: String,
        container_path: Option<String>,
        pypath: bool,
        excludes: Vec<String>,
        compress: bool,
        name: Option<String>,
    ) -> Self {
        let container = container_path.unwrap_or_else(|| host_path.clone());
        Self {
            id: MountId::new(),
            local_path,
            host_path,
            container_path: container,
            pypath,
            excludes,
            compress,
            archive_name: name.unwrap_or_else(|| format!("sortie-code-{}", Uuid::new_v4())),
        }
    }

    fn file_name(&self) -> String {
        format!("{}.{}", self.archive_name, archive::extension(self.compress))
    }

    fn remote_object(&self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.file_name())
    }

    fn unpack(&self, archive_path: &str) -> String {
        format!(
            "mkdir -p {host}\ntar {flags} {archive_path} -C {host}",
            host = self.host_path,
            flags = archive::extract_flags(self.compress),
        )
    }

    fn pack(&self, ctx: &UploadContext<'_>) -> Result<Archive, MountError> {
        archive::pack(ctx, &self.local_path, &self.excludes, self.compress)
    }
}

macro_rules! code_mount_paths {
    () => {
        fn id(&self) -> MountId {
            self.layout.id
        }

        fn host_path(&self) -> &str {
            &self.layout.host_path
        }

        fn container_path(&self) -> &str {
            &self.layout.container_path
        }

        fn on_search_path(&self) -> bool {
            self.layout.pypath
        }
    };
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct S3CodeSpec {
    #[serde(default = "default_local_path")]
    local_path: String,
    s3_prefix: String,
    host_path: String,
    #[serde(default)]
    container_path: Option<String>,
    #[serde(default)]
    pypath: bool,
    #[serde(default)]
    excludes: Vec<String>,
    #[serde(default = "default_compress")]
    compress: bool,
    #[serde(default)]
    name: Option<String>,
}

/// Code shipped through an S3 bucket.
#[derive(Clone, Debug)]
pub struct S3Code {
    layout: CodeLayout,
    object: String,
}

impl S3Code {
    /// Builds the mount from an interpolated declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Spec`] when required fields are missing.
    pub fn from_value(value: Value) -> Result<Self, MountError> {
        let spec: S3CodeSpec = parse_spec("S3Code", value)?;
        let layout = CodeLayout::new(
            spec.local_path,
            spec.host_path,
            spec.container_path,
            spec.pypath,
            spec.excludes,
            spec.compress,
            spec.name,
        );
        let object = layout.remote_object(&spec.s3_prefix);
        Ok(Self { layout, object })
    }
}

impl Mount for S3Code {
    code_mount_paths!();

    fn host_setup(&self) -> Option<String> {
        let local = format!("/tmp/{}", self.layout.file_name());
        Some(format!(
            "aws s3 cp {} {local}\n{}",
            self.object,
            self.layout.unpack(&local)
        ))
    }

    fn upload(&self, ctx: &UploadContext<'_>) -> Result<(), MountError> {
        let archive = self.layout.pack(ctx)?;
        run_checked(
            ctx.runner,
            &ctx.settings.aws_bin,
            &os_args(["s3", "cp", archive.path().as_str(), self.object.as_str()]),
        )?;
        info!(object = %self.object, "uploaded code mount");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GsCodeSpec {
    #[serde(default = "default_local_path")]
    local_path: String,
    gs_prefix: String,
    host_path: String,
    #[serde(default)]
    container_path: Option<String>,
    #[serde(default)]
    pypath: bool,
    #[serde(default)]
    excludes: Vec<String>,
    #[serde(default = "default_compress")]
    compress: bool,
    #[serde(default)]
    name: Option<String>,
}

/// Code shipped through a Google Cloud Storage bucket.
#[derive(Clone, Debug)]
pub struct GsCode {
    layout: CodeLayout,
    object: String,
}

impl GsCode {
    /// Builds the mount from an interpolated declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Spec`] when required fields are missing.
    pub fn from_value(value: Value) -> Result<Self, MountError> {
        let spec: GsCodeSpec = parse_spec("GsCode", value)?;
        let layout = CodeLayout::new(
            spec.local_path,
            spec.host_path,
            spec.container_path,
            spec.pypath,
            spec.excludes,
            spec.compress,
            spec.name,
        );
        let object = layout.remote_object(&spec.gs_prefix);
        Ok(Self { layout, object })
    }
}

impl Mount for GsCode {
    code_mount_paths!();

    fn host_setup(&self) -> Option<String> {
        let local = format!("/tmp/{}", self.layout.file_name());
        Some(format!(
            "gcloud storage cp {} {local}\n{}",
            self.object,
            self.layout.unpack(&local)
        ))
    }

    fn upload(&self, ctx: &UploadContext<'_>) -> Result<(), MountError> {
        let archive = self.layout.pack(ctx)?;
        run_checked(
            ctx.runner,
            &ctx.settings.gcloud_bin,
            &os_args(["storage", "cp", archive.path().as_str(), self.object.as_str()]),
        )?;
        info!(object = %self.object, "uploaded code mount");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SshCodeSpec {
    #[serde(default = "default_local_path")]
    local_path: String,
    host_path: String,
    #[serde(default)]
    container_path: Option<String>,
    #[serde(default)]
    remote_tar: Option<String>,
    #[serde(default)]
    pypath: bool,
    #[serde(default)]
    excludes: Vec<String>,
    #[serde(default = "default_compress")]
    compress: bool,
    #[serde(default)]
    name: Option<String>,
}

/// Code copied to the SSH host with `scp`.
#[derive(Clone, Debug)]
pub struct SshCode {
    layout: CodeLayout,
    remote_tar: String,
}

impl SshCode {
    /// Builds the mount from an interpolated declaration.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Spec`] when required fields are missing.
    pub fn from_value(value: Value) -> Result<Self, MountError> {
        let spec: SshCodeSpec = parse_spec("SshCode", value)?;
        let layout = CodeLayout::new(
            spec.local_path,
            spec.host_path,
            spec.container_path,
            spec.pypath,
            spec.excludes,
            spec.compress,
            spec.name,
        );
        let remote_tar = spec
            .remote_tar
            .unwrap_or_else(|| format!("/tmp/{}", layout.file_name()));
        Ok(Self { layout, remote_tar })
    }

    fn target(launch: &Mapping) -> Result<SshTarget, MountError> {
        serde_yaml::from_value(Value::Mapping(launch.clone())).map_err(|err| MountError::Target {
            kind: "SshCode",
            message: format!("launch options do not describe an SSH host: {err}"),
        })
    }
}

impl Mount for SshCode {
    code_mount_paths!();

    fn host_setup(&self) -> Option<String> {
        Some(self.layout.unpack(&self.remote_tar))
    }

    fn upload(&self, ctx: &UploadContext<'_>) -> Result<(), MountError> {
        let target = Self::target(ctx.launch)?;
        let archive = self.layout.pack(ctx)?;
        let (program, args) =
            target.scp_command(ctx.settings, archive.path().as_str(), &self.remote_tar);
        run_checked(ctx.runner, &program, &args)?;
        info!(host = %target.ip, path = %self.remote_tar, "copied code mount");
        Ok(())
    }
}
