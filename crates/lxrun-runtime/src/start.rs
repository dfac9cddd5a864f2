//! Orchestrator entry point.

use lxrun_common::config::ContainerConfig;
use lxrun_common::error::Result;
use lxrun_core::fd::inherited_fds;

use crate::handler::{Collaborators, ContainerHandler};
use crate::poll::poll;
use crate::spawn::spawn;
use crate::status::{exit_code, reap};

/// Runs `argv` as container `name` and supervises it until it exits.
///
/// Returns the shell-style exit code of the container init. The handler is
/// torn down on every path, including failures.
///
/// # Errors
///
/// Returns an error if the handler cannot be initialized, the spawn fails,
/// or supervision breaks down.
pub fn start(
    name: &str,
    argv: &[String],
    config: ContainerConfig,
    collab: Collaborators,
) -> Result<i32> {
    warn_inherited_fds();

    let mut handler = ContainerHandler::init(name, config, collab)?;

    if let Err(e) = spawn(&mut handler, argv) {
        reap_quietly(&handler);
        handler.fini();
        return Err(e);
    }

    if let Err(e) = poll(&mut handler) {
        tracing::error!(name, error = %e, "supervision failed");
        handler.abort();
        reap_quietly(&handler);
        handler.fini();
        return Err(e);
    }

    let status = match handler.pid().map(reap).transpose() {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(name, error = %e, "failed to collect exit status");
            handler.fini();
            return Err(e);
        }
    };
    let code = status.map_or(0, exit_code);
    tracing::info!(name, code, "container exited");
    handler.fini();
    Ok(code)
}

fn reap_quietly(handler: &ContainerHandler) {
    if let Some(pid) = handler.pid() {
        if let Err(e) = reap(pid) {
            tracing::debug!(name = handler.name(), error = %e, "nothing to reap");
        }
    }
}

/// Logs every descriptor this process holds besides stdio.
///
/// Anything listed here that is not close-on-exec ends up in the container.
fn warn_inherited_fds() {
    match inherited_fds(&[]) {
        Ok(fds) => {
            for (fd, target) in fds {
                tracing::warn!(fd, target = %target.display(), "inherited file descriptor");
            }
        }
        Err(e) => tracing::debug!(error = %e, "cannot list open descriptors"),
    }
}
