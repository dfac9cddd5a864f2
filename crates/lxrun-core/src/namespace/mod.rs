//! Linux namespace management for container isolation.
//!
//! Computes the `clone(2)` flags for a container and creates its first
//! process inside the new namespaces.

pub mod uts;

use lxrun_common::config::ContainerConfig;
use lxrun_common::constants::CLONE_STACK_SIZE;
use lxrun_common::error::{LxrunError, Result};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Which namespaces the container process is created in.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
    /// Isolate network namespace.
    pub network: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            ipc: true,
            uts: false,
            network: false,
        }
    }
}

impl NamespaceConfig {
    /// PID, IPC and mount always; UTS with a hostname, network with devices.
    #[must_use]
    pub fn for_container(config: &ContainerConfig) -> Self {
        Self {
            uts: config.wants_uts(),
            network: config.wants_network(),
            ..Self::default()
        }
    }

    /// Translates the selection into `clone(2)` flags.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWPID, self.pid);
        flags.set(CloneFlags::CLONE_NEWNS, self.mount);
        flags.set(CloneFlags::CLONE_NEWIPC, self.ipc);
        flags.set(CloneFlags::CLONE_NEWUTS, self.uts);
        flags.set(CloneFlags::CLONE_NEWNET, self.network);
        flags
    }
}

/// Runs `child` as a new process created with `flags`.
///
/// The child gets a private copy of the address space and a fresh stack; its
/// return value becomes its exit status. `SIGCHLD` is delivered to the
/// caller when it terminates.
///
/// # Errors
///
/// Returns an error if `clone(2)` fails.
pub fn clone_process<F>(flags: CloneFlags, child: F) -> Result<Pid>
where
    F: FnMut() -> isize,
{
    let mut stack = vec![0u8; CLONE_STACK_SIZE];
    tracing::debug!(?flags, "cloning container process");
    // SAFETY: without CLONE_VM the child runs on `stack` inside its own copy
    // of the address space, so nothing it does is observed by the caller.
    // The callback only returns or execs.
    let pid = unsafe {
        nix::sched::clone(
            Box::new(child),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }
    .map_err(|e| LxrunError::sys("clone", e))?;
    Ok(pid)
}

/// Asks the kernel to `SIGKILL` the calling process when its parent dies.
///
/// # Errors
///
/// Returns an error if `prctl(PR_SET_PDEATHSIG)` fails.
pub fn kill_on_parent_death() -> Result<()> {
    nix::sys::prctl::set_pdeathsig(Some(Signal::SIGKILL))
        .map_err(|e| LxrunError::sys("prctl(PR_SET_PDEATHSIG)", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lxrun_common::config::{NetworkDevice, NetworkKind};

    #[test]
    fn default_namespaces_exclude_uts_and_net() {
        let flags = NamespaceConfig::for_container(&ContainerConfig::default()).clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn hostname_and_network_add_namespaces() {
        let config = ContainerConfig {
            hostname: Some("box".into()),
            network: vec![NetworkDevice {
                kind: NetworkKind::Phys,
                link: "eth1".into(),
            }],
            ..ContainerConfig::default()
        };
        let ns = NamespaceConfig::for_container(&config);
        assert!(ns.uts && ns.network);
        let flags = ns.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn clone_without_namespaces_runs_the_callback() {
        let pid = clone_process(CloneFlags::empty(), || 7).unwrap();
        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        assert_eq!(status, nix::sys::wait::WaitStatus::Exited(pid, 7));
    }
}
