//! Supervision loop of a running container.

use lxrun_common::error::{LxrunError, Result};
use lxrun_core::mainloop::EventLoop;
use lxrun_core::signal::watch_child;

use crate::handler::ContainerHandler;

/// Dispatches `SIGCHLD` and tty requests until the container init exits.
///
/// The loop watches the signal capture, the tty rendezvous socket and the
/// connections of tty clients.
///
/// # Errors
///
/// Returns an error if the loop cannot be set up or a handler fails.
pub fn poll(handler: &mut ContainerHandler) -> Result<()> {
    let pid = handler.pid().ok_or_else(|| LxrunError::Setup {
        message: "cannot supervise a container that was never spawned".into(),
    })?;

    let mut lp = EventLoop::<ContainerHandler>::open(1 + handler.ttys().max_registrations())?;
    watch_child(&mut lp, handler.signals(), pid)?;
    handler.ttys().register(&mut lp)?;

    tracing::debug!(name = handler.name(), pid = pid.as_raw(), "supervising container");
    lp.run(handler)
}
