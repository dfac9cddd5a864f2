//! Wait-status collection and decoding.

use lxrun_common::error::{ErrorKind, LxrunError, Result};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

/// Reaps `pid`, retrying when interrupted.
///
/// # Errors
///
/// Returns an error if `waitpid(2)` fails.
pub fn reap(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None).map_err(|e| LxrunError::sys("waitpid", e)) {
            Err(e) if e.kind() == ErrorKind::Transient => {}
            other => return other,
        }
    }
}

/// Shell-style exit code for a wait status.
///
/// Normal exit yields the exit code, death by signal N yields `128 + N`.
/// Anything else (the process is still alive) yields 0.
#[must_use]
pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 0,
    }
}
