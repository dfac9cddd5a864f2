//! Unified error types for the lxrun workspace.
//!
//! Every fallible operation in the workspace returns [`Result`]. Errors are
//! classified with [`LxrunError::kind`] so that callers can tell a retryable
//! interruption from a warning-level failure or a fatal one.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::types::ContainerState;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum LxrunError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A system call failed.
    #[error("{op} failed: {source}")]
    Sys {
        /// Name of the failed operation.
        op: &'static str,
        /// Errno reported by the kernel.
        source: Errno,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or credential check failed.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The synchronization handshake with the child broke down.
    ///
    /// Covers short reads and writes, unexpected tokens, and a peer that
    /// went away before the expected stage.
    #[error("synchronization failure while {stage}: {message}")]
    Protocol {
        /// Handshake stage that was in progress.
        stage: &'static str,
        /// What went wrong.
        message: String,
    },

    /// The child reported an explicit error token.
    #[error("child failed while {stage} (code {code})")]
    ChildFailed {
        /// Handshake stage at which the error was reported.
        stage: &'static str,
        /// Error code carried by the token.
        code: i32,
    },

    /// Namespace-internal setup or a setup-fatal collaborator failed.
    #[error("container setup failed: {message}")]
    Setup {
        /// Description of the failed step.
        message: String,
    },

    /// No pseudo-terminal slot could satisfy a request.
    #[error("tty {index} is not available")]
    TtyUnavailable {
        /// Requested slot index (0 means any slot).
        index: i32,
    },

    /// The event multiplexer registry rejected an operation.
    #[error("event registry: {message}")]
    Registry {
        /// Description of the rejected operation.
        message: String,
    },

    /// A lifecycle transition outside the state machine was requested.
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ContainerState,
        /// Requested state.
        to: ContainerState,
    },

    /// Another supervisor already holds the container lock.
    #[error("container {name} is already being supervised")]
    Locked {
        /// Container name.
        name: String,
    },
}

/// Failure classes used to decide how an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Interrupted blocking call, retried in place.
    Transient,
    /// Downgraded to a warning; execution continues.
    Recoverable,
    /// Aborts the in-progress spawn and releases partial resources.
    SetupFatal,
    /// Broken synchronization handshake, handled like an explicit error.
    ProtocolFatal,
}

impl LxrunError {
    /// Builds a [`LxrunError::Sys`] for the named operation.
    #[must_use]
    pub const fn sys(op: &'static str, source: Errno) -> Self {
        Self::Sys { op, source }
    }

    /// Builds a [`LxrunError::Protocol`] for the given handshake stage.
    #[must_use]
    pub fn protocol(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            stage,
            message: message.into(),
        }
    }

    /// Classifies this error into the failure taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sys {
                source: Errno::EINTR,
                ..
            } => ErrorKind::Transient,
            Self::Io { source, .. } if matches!(source.kind(), std::io::ErrorKind::Interrupted) => {
                ErrorKind::Transient
            }
            Self::TtyUnavailable { .. } | Self::PermissionDenied { .. } => ErrorKind::Recoverable,
            Self::Protocol { .. } | Self::ChildFailed { .. } => ErrorKind::ProtocolFatal,
            _ => ErrorKind::SetupFatal,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LxrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_syscall_is_transient() {
        let err = LxrunError::sys("epoll_wait", Errno::EINTR);
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn short_read_is_protocol_fatal() {
        let err = LxrunError::protocol("waiting for ready", "short read of 2 bytes");
        assert_eq!(err.kind(), ErrorKind::ProtocolFatal);
        assert!(err.to_string().contains("waiting for ready"));
    }

    #[test]
    fn child_error_token_is_protocol_fatal() {
        let err = LxrunError::ChildFailed {
            stage: "waiting for exec",
            code: -2,
        };
        assert_eq!(err.kind(), ErrorKind::ProtocolFatal);
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = LxrunError::InvalidTransition {
            from: ContainerState::Stopped,
            to: ContainerState::Running,
        };
        assert_eq!(err.to_string(), "invalid state transition STOPPED -> RUNNING");
        assert_eq!(err.kind(), ErrorKind::SetupFatal);
    }

    #[test]
    fn clone_failure_is_setup_fatal() {
        let err = LxrunError::sys("clone", Errno::EPERM);
        assert_eq!(err.kind(), ErrorKind::SetupFatal);
        assert_eq!(err.to_string(), "clone failed: EPERM: Operation not permitted");
    }
}
