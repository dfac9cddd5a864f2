//! `SIGCHLD` delivery through a `signalfd`.
//!
//! Blocking the signal and reading it from a descriptor lets the event loop
//! treat child termination like any other readable source. `SIGINT` and
//! `SIGQUIT` go through the same descriptor so they reach the container
//! instead of killing the supervisor. The mask that was in effect before
//! blocking is remembered so the container child can restore it right
//! before exec.

use std::ops::ControlFlow;
use std::os::fd::{AsFd, BorrowedFd};

use lxrun_common::error::{LxrunError, Result};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;

use crate::mainloop::EventLoop;

/// Signals the supervisor passes on to the container init.
const FORWARDED: [Signal; 2] = [Signal::SIGINT, Signal::SIGQUIT];

/// What a signal record turned out to mean for the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildNotification {
    /// The supervised child terminated.
    Exited,
    /// The child was stopped or continued; it is still alive.
    JobControl,
    /// The record is about some other process.
    Unrelated,
    /// The supervisor was asked to stop; the signal belongs to the child.
    Forward(Signal),
}

impl ChildNotification {
    /// Classifies a raw `SIGCHLD` record against the expected child.
    #[must_use]
    pub fn classify(code: i32, sender: u32, expected: Pid) -> Self {
        if code == libc::CLD_STOPPED || code == libc::CLD_CONTINUED {
            return Self::JobControl;
        }
        if i64::from(sender) != i64::from(expected.as_raw()) {
            return Self::Unrelated;
        }
        Self::Exited
    }
}

/// Blocked `SIGCHLD` plus the descriptor it is read from.
///
/// Dropping the capture puts the saved mask back.
#[derive(Debug)]
pub struct SignalCapture {
    fd: SignalFd,
    saved: SigSet,
}

impl SignalCapture {
    /// Blocks `SIGCHLD`, `SIGINT` and `SIGQUIT` for the calling thread and
    /// opens a `signalfd` for them.
    ///
    /// On failure the previous mask is put back.
    ///
    /// # Errors
    ///
    /// Returns an error if the mask cannot be changed or the descriptor
    /// cannot be created.
    pub fn install() -> Result<Self> {
        let mut captured = SigSet::empty();
        captured.add(Signal::SIGCHLD);
        for signal in FORWARDED {
            captured.add(signal);
        }

        let mut saved = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&captured), Some(&mut saved))
            .map_err(|e| LxrunError::sys("sigprocmask", e))?;

        match SignalFd::with_flags(&captured, SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => {
                tracing::debug!("SIGCHLD, SIGINT and SIGQUIT routed to signalfd");
                Ok(Self { fd, saved })
            }
            Err(e) => {
                let _ = restore_mask(&saved);
                Err(LxrunError::sys("signalfd", e))
            }
        }
    }

    /// Mask that was in effect before the capture was installed.
    #[must_use]
    pub const fn saved_mask(&self) -> &SigSet {
        &self.saved
    }

    /// Reads one record and classifies it against `expected`.
    ///
    /// Pending `SIGCHLD`s merge into one record, so a record naming another
    /// process can hide the exit of `expected`. Such records are confirmed
    /// against the child itself before being reported as unrelated.
    ///
    /// `Ok(None)` means nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read(&mut self, expected: Pid) -> Result<Option<ChildNotification>> {
        let Some(info) = self
            .fd
            .read_signal()
            .map_err(|e| LxrunError::sys("read(signalfd)", e))?
        else {
            return Ok(None);
        };

        if let Some(signal) = forwarded(info.ssi_signo) {
            tracing::info!(signal = %signal, pid = %expected, "forwarding signal to container");
            return Ok(Some(ChildNotification::Forward(signal)));
        }

        let mut notification = ChildNotification::classify(info.ssi_code, info.ssi_pid, expected);
        if notification != ChildNotification::Exited && has_exited(expected) {
            tracing::debug!(pid = info.ssi_pid, expected = %expected, "exit merged into another SIGCHLD");
            notification = ChildNotification::Exited;
        }
        match notification {
            ChildNotification::JobControl => {
                tracing::debug!(pid = info.ssi_pid, "child stopped or continued, ignoring");
            }
            ChildNotification::Unrelated => {
                tracing::warn!(pid = info.ssi_pid, expected = %expected, "SIGCHLD from unexpected process");
            }
            ChildNotification::Exited => {
                tracing::debug!(pid = info.ssi_pid, status = info.ssi_status, "container init exited");
            }
            ChildNotification::Forward(_) => {}
        }
        Ok(Some(notification))
    }

    /// Puts the original mask back for the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if `sigprocmask(2)` fails.
    pub fn restore(&self) -> Result<()> {
        restore_mask(&self.saved)
    }
}

impl Drop for SignalCapture {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!(error = %e, "failed to restore signal mask");
        }
    }
}

impl AsFd for SignalCapture {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn forwarded(signo: u32) -> Option<Signal> {
    let signal = i32::try_from(signo).ok().and_then(|n| Signal::try_from(n).ok())?;
    FORWARDED.contains(&signal).then_some(signal)
}

/// Whether `pid` is waiting to be reaped. The zombie is left in place.
fn has_exited(pid: Pid) -> bool {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(pid), flags) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) | Err(Errno::ECHILD) => true,
        Err(e) => {
            tracing::warn!(pid = %pid, error = %e, "cannot check child status");
            false
        }
    }
}

/// Replaces the calling thread's signal mask with `mask`.
///
/// # Errors
///
/// Returns an error if `sigprocmask(2)` fails.
pub fn restore_mask(mask: &SigSet) -> Result<()> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(mask), None)
        .map_err(|e| LxrunError::sys("sigprocmask", e))
}

/// Registers the capture with the loop; the loop ends when `pid` exits.
///
/// `SIGINT` and `SIGQUIT` received meanwhile are sent on to `pid`. The
/// context must hand out the [`SignalCapture`] it owns.
///
/// # Errors
///
/// Returns an error if the registration is rejected.
pub fn watch_child<C>(lp: &mut EventLoop<C>, capture: &SignalCapture, pid: Pid) -> Result<()>
where
    C: AsMut<SignalCapture> + 'static,
{
    lp.add_handler(capture, move |_, _, _, ctx: &mut C| {
        match ctx.as_mut().read(pid)? {
            Some(ChildNotification::Exited) => return Ok(ControlFlow::Break(())),
            Some(ChildNotification::Forward(signal)) => {
                if let Err(e) = kill(pid, signal) {
                    tracing::warn!(pid = %pid, signal = %signal, error = %e, "failed to forward signal");
                }
            }
            _ => {}
        }
        Ok(ControlFlow::Continue(()))
    })
}
