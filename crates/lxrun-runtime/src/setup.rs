//! Namespace-internal setup run by the container child.
//!
//! The setup runs strictly after the parent's go-ahead, inside the new
//! namespaces and before exec. Anything it reports as an error aborts the
//! spawn.

use std::path::{Path, PathBuf};

use lxrun_common::config::ContainerConfig;
use lxrun_common::error::Result;
use lxrun_core::filesystem::bind_mount;
use lxrun_core::namespace::uts::set_hostname;
use lxrun_core::tty::TtyInfo;

/// Setup collaborator invoked inside the child.
pub trait NamespaceSetup {
    /// Prepares the namespaces of container `name` for exec.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    fn setup(&self, name: &str, ttys: &TtyInfo) -> Result<()>;
}

/// Sets the hostname and wires the pty slaves into the root filesystem.
#[derive(Debug, Clone, Default)]
pub struct DefaultSetup {
    hostname: Option<String>,
    rootfs: Option<PathBuf>,
}

impl DefaultSetup {
    /// Takes the hostname and rootfs from the container configuration.
    #[must_use]
    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            rootfs: config.rootfs.clone(),
        }
    }
}

impl NamespaceSetup for DefaultSetup {
    fn setup(&self, name: &str, ttys: &TtyInfo) -> Result<()> {
        if let Some(hostname) = &self.hostname {
            set_hostname(hostname)?;
        }
        if let Some(rootfs) = &self.rootfs {
            for (index, pty) in ttys.iter() {
                bind_mount(pty.slave_path(), &tty_target(rootfs, index))?;
            }
        }
        tracing::debug!(name, "namespace setup done");
        Ok(())
    }
}

/// Mount point of tty `index` below `rootfs`.
fn tty_target(rootfs: &Path, index: usize) -> PathBuf {
    rootfs.join("dev").join(format!("tty{index}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tty_targets_are_one_based_dev_nodes() {
        assert_eq!(
            tty_target(Path::new("/srv/box"), 1),
            PathBuf::from("/srv/box/dev/tty1")
        );
    }

    #[test]
    fn empty_setup_does_nothing() {
        let setup = DefaultSetup::default();
        assert!(setup.setup("web", &TtyInfo::default()).is_ok());
    }
}
