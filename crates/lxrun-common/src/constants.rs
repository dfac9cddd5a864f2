//! System-wide constants and default paths.

use std::path::{Path, PathBuf};

/// Application name used in socket names, cgroup paths and log output.
pub const APP_NAME: &str = "lxrun";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "lxrun";

/// Default directory holding per-container runtime state (pid file, lock).
pub const DEFAULT_RUN_DIR: &str = "/run/lxrun";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Name of the file holding the container init pid.
pub const PID_FILE_NAME: &str = "pid";

/// Name of the handler lock file.
pub const LOCK_FILE_NAME: &str = "lock";

/// Abstract socket name on which state changes are broadcast.
pub const MONITOR_SOCKET_NAME: &str = "lxrun/monitor";

/// Upper bound on the number of pseudo-terminals per container.
pub const MAX_TTYS: usize = 64;

/// Size of the stack handed to `clone(2)` for the container init.
pub const CLONE_STACK_SIZE: usize = 1024 * 1024;

/// Console escape prefix (`Ctrl+a`).
pub const CONSOLE_ESCAPE: u8 = 0x01;

/// Returns the per-container state directory under `run_dir`.
#[must_use]
pub fn container_dir(run_dir: &Path, name: &str) -> PathBuf {
    run_dir.join(name)
}

/// Returns the pid file path for a container.
#[must_use]
pub fn pid_file(run_dir: &Path, name: &str) -> PathBuf {
    container_dir(run_dir, name).join(PID_FILE_NAME)
}

/// Returns the handler lock path for a container.
#[must_use]
pub fn lock_file(run_dir: &Path, name: &str) -> PathBuf {
    container_dir(run_dir, name).join(LOCK_FILE_NAME)
}

/// Returns the abstract socket name of a container's tty rendezvous.
///
/// The name carries no leading NUL; callers bind it in the abstract namespace.
#[must_use]
pub fn tty_socket_name(name: &str) -> String {
    format!("{APP_NAME}/{name}/tty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_is_derived_from_name() {
        let p = pid_file(Path::new("/run/lxrun"), "web");
        assert_eq!(p, PathBuf::from("/run/lxrun/web/pid"));
    }

    #[test]
    fn lock_and_pid_share_container_dir() {
        let run = Path::new("/tmp/run");
        assert_eq!(pid_file(run, "a").parent(), lock_file(run, "a").parent());
    }

    #[test]
    fn tty_socket_name_is_per_container() {
        assert_eq!(tty_socket_name("db"), "lxrun/db/tty");
        assert_ne!(tty_socket_name("a"), tty_socket_name("b"));
    }
}
