//! Cgroups v2 membership for the container process.
//!
//! Each container gets a directory under `<root>/lxrun/<name>` on the
//! unified hierarchy. Linking writes the init pid into `cgroup.procs`;
//! unlinking removes the (by then empty) directory. Resource limits are not
//! managed here.

use std::path::{Path, PathBuf};

use lxrun_common::constants::APP_NAME;
use lxrun_common::error::{LxrunError, Result};
use nix::unistd::Pid;

/// Cgroup collaborator consumed by the spawner.
pub trait Cgroup {
    /// Puts `pid` into the cgroup of container `name`.
    ///
    /// Returns `false` on failure; callers treat that as a warning.
    fn link(&self, name: &str, pid: Pid) -> bool;

    /// Removes the cgroup of container `name`, if any.
    fn unlink(&self, name: &str);
}

/// Cgroup v2 implementation rooted at a unified-hierarchy mount point.
#[derive(Debug, Clone)]
pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    /// Creates a handle for the hierarchy mounted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of container `name`'s cgroup.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(APP_NAME).join(name)
    }

    /// Creates the cgroup for `name` and adds `pid` to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or writing to
    /// `cgroup.procs` fails.
    pub fn add_process(&self, name: &str, pid: Pid) -> Result<()> {
        let path = self.path(name);
        std::fs::create_dir_all(&path).map_err(|e| LxrunError::Io {
            path: path.clone(),
            source: e,
        })?;
        write_procs(&path, pid)?;
        tracing::debug!(name, pid = pid.as_raw(), path = %path.display(), "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup of `name`.
    ///
    /// Only the directory itself is removed; the kernel refuses while
    /// processes are still in it.
    ///
    /// # Errors
    ///
    /// Returns an error if `rmdir` fails for a reason other than the
    /// directory being absent.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match std::fs::remove_dir(&path) {
            Ok(()) => {
                tracing::info!(name, path = %path.display(), "cgroup destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LxrunError::Io { path, source: e }),
        }
    }
}

impl Cgroup for CgroupV2 {
    fn link(&self, name: &str, pid: Pid) -> bool {
        match self.add_process(name, pid) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(name, pid = pid.as_raw(), error = %e, "failed to link cgroup");
                false
            }
        }
    }

    fn unlink(&self, name: &str) {
        if let Err(e) = self.destroy(name) {
            tracing::warn!(name, error = %e, "failed to remove cgroup");
        }
    }
}

fn write_procs(path: &Path, pid: Pid) -> Result<()> {
    let procs_path = path.join("cgroup.procs");
    std::fs::write(&procs_path, pid.as_raw().to_string()).map_err(|e| LxrunError::Io {
        path: procs_path,
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_namespaced_under_app() {
        let cg = CgroupV2::new("/sys/fs/cgroup");
        assert_eq!(cg.path("web"), PathBuf::from("/sys/fs/cgroup/lxrun/web"));
    }

    // A plain directory stands in for the hierarchy: the kernel interface is
    // just files.
    #[test]
    fn link_writes_pid_and_unlink_removes_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let cg = CgroupV2::new(root.path());
        assert!(cg.link("web", Pid::from_raw(4242)));

        let procs = std::fs::read_to_string(cg.path("web").join("cgroup.procs")).unwrap();
        assert_eq!(procs, "4242");

        // cgroupfs has no removable control files; emulate that.
        std::fs::remove_file(cg.path("web").join("cgroup.procs")).unwrap();
        cg.unlink("web");
        assert!(!cg.path("web").exists());
    }

    #[test]
    fn link_failure_is_reported_not_raised() {
        // A plain file as root fails even for root, unlike a missing path.
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("plain");
        std::fs::write(&root, "").unwrap();
        let cg = CgroupV2::new(&root);
        assert!(!cg.link("web", Pid::from_raw(1)));
        cg.unlink("web");
    }
}
