//! Capability bounding-set management.
//!
//! The container init must not be able to reboot the host, so the
//! capabilities that would allow it are removed from the bounding set
//! before exec. Dropped capabilities cannot be regained by any descendant.

use lxrun_common::error::{LxrunError, Result};
use nix::errno::Errno;

/// Linux capability identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Allow `reboot(2)` and `kexec_load(2)`.
    SysBoot,
}

impl Capability {
    /// Kernel number of the capability.
    #[must_use]
    pub const fn number(self) -> libc::c_ulong {
        match self {
            Self::SysBoot => 22,
        }
    }
}

/// Removes `caps` from the calling process's bounding set.
///
/// # Errors
///
/// Returns an error if `prctl(PR_CAPBSET_DROP)` fails, typically for lack
/// of `CAP_SETPCAP`.
pub fn drop_bounding(caps: &[Capability]) -> Result<()> {
    for cap in caps {
        // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap.number(), 0, 0, 0) };
        if rc < 0 {
            return Err(LxrunError::sys("prctl(PR_CAPBSET_DROP)", Errno::last()));
        }
        tracing::debug!(?cap, "capability dropped from bounding set");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_bounding_set(cap: Capability) -> bool {
        // SAFETY: PR_CAPBSET_READ takes a capability number and no pointers.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_READ, cap.number(), 0, 0, 0) };
        assert!(rc >= 0, "PR_CAPBSET_READ failed");
        rc == 1
    }

    #[test]
    fn sys_boot_number_matches_kernel() {
        assert_eq!(Capability::SysBoot.number(), 22);
    }

    // Runs in a forked child so the test process keeps its bounding set.
    #[test]
    fn dropped_capability_leaves_the_bounding_set() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        // SAFETY: the child only calls async-signal-safe prctl and _exit.
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                let ok = drop_bounding(&[Capability::SysBoot]).is_ok()
                    && !in_bounding_set(Capability::SysBoot);
                // SAFETY: _exit is async-signal-safe.
                unsafe { libc::_exit(i32::from(!ok)) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
            }
        }
    }
}
