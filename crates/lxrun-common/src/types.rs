//! Domain primitive types used across the lxrun workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised container.
///
/// The fault-free sequence is `Starting -> Running -> Stopping -> Stopped`.
/// `Aborting` is entered from `Starting` or `Running` when something fatal
/// happens; `Stopped` and `Aborting` never lead back to an active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerState {
    /// Resources are being allocated and the init is being spawned.
    Starting,
    /// The container init has exec'd and is being supervised.
    Running,
    /// Teardown has begun.
    Stopping,
    /// Teardown is complete.
    Stopped,
    /// A fatal error interrupted the lifecycle.
    Aborting,
}

impl ContainerState {
    /// Returns whether `next` is a legal successor of `self`.
    ///
    /// Re-entering `Aborting` from `Aborting` is accepted so that abort stays
    /// idempotent.
    #[must_use]
    pub const fn permits(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Aborting)
                | (Self::Running, Self::Stopping | Self::Aborting)
                | (Self::Stopping, Self::Stopped)
                | (Self::Aborting, Self::Aborting)
        )
    }

    /// Upper-case name used on the monitor channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Aborting => "ABORTING",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
