//! Namespace spawner: creates the container init and walks it through the
//! synchronization handshake.
//!
//! Parent and child meet at two points. The child announces itself as soon
//! as it runs; the parent then does everything that needs the child's pid
//! (cgroup membership, moving network devices into its namespace) and lets
//! it proceed. Only then does the child set up its namespaces and exec.

use std::ffi::CString;

use lxrun_common::error::{ErrorKind, LxrunError, Result};
use lxrun_common::types::ContainerState;
use lxrun_core::capability::{Capability, drop_bounding};
use lxrun_core::namespace::{NamespaceConfig, clone_process, kill_on_parent_death};
use lxrun_core::signal::restore_mask;
use lxrun_core::sync::{Announce, AwaitReady, ChildSync, ParentSync, SyncChannel};
use lxrun_core::tty::TtyInfo;
use nix::sys::signal::SigSet;
use nix::unistd::{Pid, execvp};

use crate::handler::ContainerHandler;
use crate::setup::NamespaceSetup;

/// Exit status of a child that failed before exec.
const CHILD_FAILURE: isize = 1;

/// Clones the container init running `argv` and waits until it has exec'd.
///
/// On success the pid is persisted and the handler is RUNNING. On failure
/// the child (if any) is killed, the handler is ABORTING and network
/// devices created for the container are removed.
///
/// # Errors
///
/// Returns an error if the command is empty or contains NUL bytes, network
/// creation or assignment fails, the clone fails, the handshake breaks or
/// the child reports an error.
pub fn spawn(handler: &mut ContainerHandler, argv: &[String]) -> Result<()> {
    let argv = to_cstrings(argv)?;
    let channel = SyncChannel::new()?;
    let flags = NamespaceConfig::for_container(handler.config()).clone_flags();
    let devices = handler.config().network.clone();

    if !devices.is_empty() {
        if let Err(e) = handler.collaborators().network.create(&devices) {
            tracing::error!(name = handler.name(), error = %e, "failed to create network");
            handler.abort();
            return Err(e);
        }
    }

    let result = clone_and_sync(handler, channel, flags, &argv);
    match result {
        Ok(()) => {
            handler.set_state(ContainerState::Running)?;
            tracing::info!(
                name = handler.name(),
                pid = handler.pid().map_or(0, Pid::as_raw),
                "container started"
            );
            Ok(())
        }
        Err(e) => {
            report_failure(handler.name(), &e);
            handler.abort();
            if !devices.is_empty() {
                handler.collaborators().network.delete(&devices);
            }
            Err(e)
        }
    }
}

fn report_failure(name: &str, err: &LxrunError) {
    match err.kind() {
        ErrorKind::ProtocolFatal => {
            tracing::error!(name, error = %err, "container init failed before exec");
        }
        ErrorKind::Recoverable | ErrorKind::Transient => {
            tracing::warn!(name, error = %err, "container spawn interrupted");
        }
        ErrorKind::SetupFatal => {
            tracing::error!(name, error = %err, "failed to spawn container");
        }
    }
}

fn clone_and_sync(
    handler: &mut ContainerHandler,
    channel: SyncChannel,
    flags: nix::sched::CloneFlags,
    argv: &[CString],
) -> Result<()> {
    let mut slot = Some(channel);
    let pid = {
        let child = ChildInit {
            name: handler.name(),
            saved_mask: handler.signals().saved_mask(),
            ttys: handler.ttys().info(),
            setup: handler.collaborators().setup.as_ref(),
            argv,
        };
        clone_process(flags, || child.run(&mut slot))?
    };

    // The child has its own copy of the channel; keep ours.
    let channel = slot.take().ok_or_else(|| LxrunError::Setup {
        message: "sync channel lost across clone".into(),
    })?;
    let parent = channel.into_parent();
    handler.set_pid(pid);
    tracing::debug!(name = handler.name(), pid = pid.as_raw(), "container init cloned");

    handshake(handler, parent, pid)?;
    handler.persist_pid()
}

/// Parent side of the handshake.
fn handshake(
    handler: &mut ContainerHandler,
    parent: ParentSync<AwaitReady>,
    pid: Pid,
) -> Result<()> {
    let parent = parent.wait_ready()?;

    if handler.collaborators().cgroup.link(handler.name(), pid) {
        handler.mark_cgroup_linked();
    } else {
        tracing::warn!(name = handler.name(), pid = pid.as_raw(), "continuing without cgroup");
    }

    let devices = &handler.config().network;
    if !devices.is_empty() && !handler.collaborators().network.assign(devices, pid) {
        return Err(LxrunError::Setup {
            message: format!("failed to assign network to pid {pid}"),
        });
    }

    parent.proceed()?.wait_exec()
}

/// What the child needs, borrowed from the handler before the clone.
struct ChildInit<'a> {
    name: &'a str,
    saved_mask: &'a SigSet,
    ttys: &'a TtyInfo,
    setup: &'a dyn NamespaceSetup,
    argv: &'a [CString],
}

impl ChildInit<'_> {
    /// Body of the cloned process. Returns only on failure.
    fn run(&self, slot: &mut Option<SyncChannel>) -> isize {
        let Some(channel) = slot.take() else {
            return CHILD_FAILURE;
        };
        let sync = match channel.into_child() {
            Ok(sync) => sync,
            Err(_) => return CHILD_FAILURE,
        };
        self.exec(sync)
    }

    fn exec(&self, sync: ChildSync<Announce>) -> isize {
        if let Err(e) = restore_mask(self.saved_mask).and_then(|()| kill_on_parent_death()) {
            let mut sync = sync;
            let _ = sync.report_error(errno_of(&e));
            return CHILD_FAILURE;
        }

        let Ok(mut cleared) = sync.announce_ready().and_then(|s| s.wait_proceed()) else {
            // The parent is gone or broke the protocol; it already knows.
            return CHILD_FAILURE;
        };

        let prepared = self
            .setup
            .setup(self.name, self.ttys)
            .and_then(|()| drop_bounding(&[Capability::SysBoot]));
        if let Err(e) = prepared {
            tracing::error!(name = self.name, error = %e, "container setup failed");
            let _ = cleared.report_error(errno_of(&e));
            return CHILD_FAILURE;
        }

        // `argv` is never empty here.
        let Some(program) = self.argv.first() else {
            return CHILD_FAILURE;
        };
        // Only returns on failure; on success the close-on-exec channel
        // tells the parent.
        let errno = match execvp(program, self.argv) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };
        tracing::error!(name = self.name, program = ?program, error = %errno, "exec failed");
        let _ = cleared.report_error(errno as i32);
        CHILD_FAILURE
    }
}

/// Error code carried by an error token.
fn errno_of(err: &LxrunError) -> i32 {
    match err {
        LxrunError::Sys { source, .. } => *source as i32,
        LxrunError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        LxrunError::PermissionDenied { .. } => libc::EPERM,
        _ => libc::EINVAL,
    }
}

fn to_cstrings(argv: &[String]) -> Result<Vec<CString>> {
    if argv.is_empty() {
        return Err(LxrunError::Config {
            message: "no command to run in the container".into(),
        });
    }
    argv.iter()
        .map(|arg| {
            CString::new(arg.as_bytes()).map_err(|_| LxrunError::Config {
                message: format!("command argument {arg:?} contains a NUL byte"),
            })
        })
        .collect()
}
