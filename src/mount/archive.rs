//! Local tarballs for code mounts.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempPath;
use tracing::debug;

use super::{MountError, UploadContext};
use crate::exec::run_checked;

/// Temporary tarball removed when dropped.
#[derive(Debug)]
pub(super) struct Archive {
    path: Utf8PathBuf,
    _file: TempPath,
}

impl Archive {
    pub(super) fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// File extension of the archive a mount uploads.
pub(super) const fn extension(compress: bool) -> &'static str {
    if compress { "tar.gz" } else { "tar" }
}

/// Flags `tar` needs to extract an archive packed with [`pack`].
pub(super) const fn extract_flags(compress: bool) -> &'static str {
    if compress { "-xzf" } else { "-xf" }
}

/// Packs `local_path` into a temporary tarball, skipping `excludes`.
pub(super) fn pack(
    ctx: &UploadContext<'_>,
    local_path: &str,
    excludes: &[String],
    compress: bool,
) -> Result<Archive, MountError> {
    let file = tempfile::Builder::new()
        .prefix("sortie-mount-")
        .suffix(&format!(".{}", extension(compress)))
        .tempfile()
        .map_err(|err| MountError::Io {
            path: local_path.to_owned(),
            message: err.to_string(),
        })?
        .into_temp_path();
    let path = Utf8Path::from_path(&file)
        .ok_or_else(|| MountError::Io {
            path: file.to_string_lossy().into_owned(),
            message: String::from("temporary path is not valid UTF-8"),
        })?
        .to_owned();

    let mut args = vec![
        OsString::from(if compress { "-czf" } else { "-cf" }),
        OsString::from(path.as_str()),
    ];
    args.extend(
        excludes
            .iter()
            .map(|pattern| OsString::from(format!("--exclude={pattern}"))),
    );
    args.extend([
        OsString::from("-C"),
        OsString::from(local_path),
        OsString::from("."),
    ]);

    debug!(source = local_path, archive = %path, "packing mount");
    run_checked(ctx.runner, &ctx.settings.tar_bin, &args)?;

    Ok(Archive { path, _file: file })
}
