//! Durable per-container state: the pid file and the handler lock.
//!
//! Both live under `<run_dir>/<name>/`. The lock is an exclusive `flock`
//! held for the lifetime of the handler, so two supervisors can never
//! manage the same container at once.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use lxrun_common::constants::{container_dir, lock_file, pid_file};
use lxrun_common::error::{LxrunError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::Pid;

/// Exclusive lock on a container name.
///
/// Released when dropped.
#[derive(Debug)]
pub struct HandlerLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl HandlerLock {
    /// Takes the lock for container `name`, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::Locked`] if another process holds the lock and
    /// an I/O error if the lock file cannot be opened.
    pub fn acquire(run_dir: &Path, name: &str) -> Result<Self> {
        let dir = container_dir(run_dir, name);
        std::fs::create_dir_all(&dir).map_err(|e| LxrunError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let path = lock_file(run_dir, name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LxrunError::Io {
                path: path.clone(),
                source: e,
            })?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(LxrunError::Locked {
                    name: name.to_owned(),
                });
            }
            Err((_, e)) => return Err(LxrunError::sys("flock", e)),
        };
        tracing::debug!(name, path = %path.display(), "handler lock taken");
        Ok(Self { _lock: lock, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid file of a running container.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes `pid` to `<run_dir>/<name>/pid`.
    ///
    /// The file is written under a temporary name and renamed into place so
    /// readers never see a partial pid.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn create(run_dir: &Path, name: &str, pid: Pid) -> Result<Self> {
        let path = pid_file(run_dir, name);
        let tmp = path.with_extension("tmp");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |e| LxrunError::Io { path, source: e }
        };

        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        writeln!(file, "{pid}").map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;

        tracing::debug!(name, pid = pid.as_raw(), path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    /// Path of the pid file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the pid file.
    pub fn remove(self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "pid file removed"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pid file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_roundtrip_and_removal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _lock = HandlerLock::acquire(dir.path(), "web").unwrap();
        let file = PidFile::create(dir.path(), "web", Pid::from_raw(1234)).unwrap();
        assert_eq!(file.path(), pid_file(dir.path(), "web"));
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "1234\n");
        assert!(!file.path().with_extension("tmp").exists());

        let path = file.path().to_path_buf();
        file.remove();
        assert!(!path.exists());
    }

    #[test]
    fn second_lock_on_same_name_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = HandlerLock::acquire(dir.path(), "web").unwrap();
        assert!(matches!(
            HandlerLock::acquire(dir.path(), "web"),
            Err(LxrunError::Locked { .. })
        ));
        assert!(HandlerLock::acquire(dir.path(), "db").is_ok());

        drop(first);
        assert!(HandlerLock::acquire(dir.path(), "web").is_ok());
    }
}
