//! File descriptor helpers.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;

use lxrun_common::error::{LxrunError, Result};
use nix::errno::Errno;

/// Marks a descriptor close-on-exec.
///
/// # Errors
///
/// Returns an error if `fcntl(2)` fails.
pub fn set_cloexec<F: AsFd>(fd: &F) -> Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    // SAFETY: `raw` comes from a live `BorrowedFd`; F_GETFD/F_SETFD only
    // touch the descriptor flags.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(LxrunError::sys("fcntl(F_GETFD)", Errno::last()));
    }
    // SAFETY: same descriptor as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(LxrunError::sys("fcntl(F_SETFD)", Errno::last()));
    }
    Ok(())
}

/// Returns whether a descriptor is close-on-exec.
///
/// # Errors
///
/// Returns an error if `fcntl(2)` fails.
pub fn is_cloexec<F: AsFd>(fd: &F) -> Result<bool> {
    // SAFETY: the descriptor is borrowed for the duration of the call.
    let flags = unsafe { libc::fcntl(fd.as_fd().as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(LxrunError::sys("fcntl(F_GETFD)", Errno::last()));
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Lists descriptors open in this process besides stdio and `ignore`.
///
/// Each entry carries the target the descriptor resolves to. A supervisor
/// should start with nothing but stdio; anything else would leak into the
/// container unless it is close-on-exec.
///
/// # Errors
///
/// Returns an error if `/proc/self/fd` cannot be listed.
pub fn inherited_fds(ignore: &[RawFd]) -> Result<Vec<(RawFd, PathBuf)>> {
    let dir = PathBuf::from("/proc/self/fd");
    let entries = std::fs::read_dir(&dir).map_err(|e| LxrunError::Io {
        path: dir.clone(),
        source: e,
    })?;

    let fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|fd| *fd > 2 && !ignore.contains(fd))
        .collect();

    // The directory handle used for listing is closed by now, so its link
    // no longer resolves and it drops out here.
    Ok(fds
        .into_iter()
        .filter_map(|fd| Some((fd, std::fs::read_link(dir.join(fd.to_string())).ok()?)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn cloexec_roundtrip() {
        let (a, _b) = UnixStream::pair().unwrap();
        // std creates sockets close-on-exec already.
        assert!(is_cloexec(&a).unwrap());
        set_cloexec(&a).unwrap();
        assert!(is_cloexec(&a).unwrap());
    }

    #[test]
    fn inherited_fds_reports_open_socket() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fds = inherited_fds(&[]).unwrap();
        assert!(fds.iter().any(|(fd, _)| *fd == a.as_raw_fd()));
    }

    #[test]
    fn inherited_fds_honours_ignore_list() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fds = inherited_fds(&[a.as_raw_fd()]).unwrap();
        assert!(fds.iter().all(|(fd, _)| *fd != a.as_raw_fd()));
        assert!(fds.iter().all(|(fd, _)| *fd > 2));
    }
}
