//! Mount utilities used inside the container's mount namespace.

use std::fs::OpenOptions;
use std::path::Path;

use lxrun_common::error::{LxrunError, Result};
use nix::mount::{MsFlags, mount};

/// Bind-mounts the file or directory `source` onto `target`.
///
/// A missing file target is created empty first, so device nodes can be
/// bound onto a bare root filesystem.
///
/// # Errors
///
/// Returns an error if the target cannot be created or `mount(2)` fails.
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() && !target.exists() {
        let _ = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .map_err(|e| LxrunError::Io {
                path: target.to_path_buf(),
                source: e,
            })?;
    }
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| LxrunError::sys("mount(MS_BIND)", e))?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}
