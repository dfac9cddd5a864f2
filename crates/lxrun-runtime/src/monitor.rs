//! State-change notifications.
//!
//! Every lifecycle transition is reported to a [`Monitor`]. Reporting is
//! fire-and-forget: a monitor must never block the supervisor or fail it.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use chrono::{DateTime, Utc};
use lxrun_common::constants::MONITOR_SOCKET_NAME;
use lxrun_common::types::ContainerState;
use serde::{Deserialize, Serialize};

/// Receiver of lifecycle transitions.
pub trait Monitor {
    /// Reports that container `name` entered `state`.
    fn send_state(&self, name: &str, state: ContainerState);
}

/// One state-change record as broadcast on the monitor socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Container name.
    pub name: String,
    /// State just entered.
    pub state: ContainerState,
    /// Time of the transition.
    pub timestamp: DateTime<Utc>,
}

/// Monitor that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn send_state(&self, name: &str, state: ContainerState) {
        tracing::info!(name, %state, "state changed");
    }
}

/// Monitor that sends a JSON [`StateRecord`] datagram per transition to an
/// abstract-namespace socket, where any number of listeners may be bound.
///
/// Sends never block; records nobody is listening for are dropped.
#[derive(Debug)]
pub struct SocketMonitor {
    socket: Option<UnixDatagram>,
    target: String,
}

impl SocketMonitor {
    /// Targets the default monitor socket.
    #[must_use]
    pub fn new() -> Self {
        Self::with_target(MONITOR_SOCKET_NAME)
    }

    /// Targets the abstract socket `target`.
    #[must_use]
    pub fn with_target(target: &str) -> Self {
        let socket = UnixDatagram::unbound()
            .and_then(|s| s.set_nonblocking(true).map(|()| s))
            .map_err(|e| tracing::debug!(error = %e, "monitor socket unavailable"))
            .ok();
        Self {
            socket,
            target: target.to_owned(),
        }
    }
}

impl Default for SocketMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for SocketMonitor {
    fn send_state(&self, name: &str, state: ContainerState) {
        tracing::info!(name, %state, "state changed");
        let Some(socket) = &self.socket else {
            return;
        };
        let record = StateRecord {
            name: name.to_owned(),
            state,
            timestamp: Utc::now(),
        };
        let sent = serde_json::to_vec(&record)
            .map_err(std::io::Error::other)
            .and_then(|payload| {
                let addr = SocketAddr::from_abstract_name(self.target.as_bytes())?;
                socket.send_to_addr(&payload, &addr)
            });
        if let Err(e) = sent {
            tracing::debug!(name, %state, error = %e, "state notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_delivered_to_a_listener() {
        let target = format!("lxrun-test/monitor-{}", std::process::id());
        let addr = SocketAddr::from_abstract_name(target.as_bytes()).unwrap();
        let listener = UnixDatagram::bind_addr(&addr).unwrap();

        SocketMonitor::with_target(&target).send_state("web", ContainerState::Running);

        let mut buf = [0u8; 512];
        let n = listener.recv(&mut buf).unwrap();
        let record: StateRecord = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(record.name, "web");
        assert_eq!(record.state, ContainerState::Running);
    }

    #[test]
    fn missing_listener_is_not_an_error() {
        let monitor = SocketMonitor::with_target("lxrun-test/nobody-listens");
        monitor.send_state("web", ContainerState::Stopped);
    }
}
