//! Error types for pluggable discovery drivers.
//!
//! Two classes of failure are distinguished, both always attributable to a
//! single worker:
//!
//! - **`DiscoveryError::ProcessStart`**: the worker executable could not be
//!   spawned, or it failed the `HELLO` handshake. Fatal for that worker's
//!   `run`, harmless for its siblings.
//! - **`DiscoveryError::Protocol`**: the worker answered a well-formed command
//!   with a malformed, unexpected or failed reply, or the command was issued
//!   from a state that does not allow it. See [`ProtocolError`].
//!
//! Aggregation over many workers (lists of per-worker errors) lives in the
//! manager crate; this module only classifies a single failure.

use crate::state::DiscoveryState;
use thiserror::Error;

/// Failure of one driver operation.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Worker could not be spawned or failed its handshake.
    #[error("process not started: {0}")]
    ProcessStart(String),

    /// Worker broke the request/response protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl DiscoveryError {
    /// Whether this is a process start failure.
    pub fn is_process_start(&self) -> bool {
        matches!(self, DiscoveryError::ProcessStart(_))
    }

    /// The underlying protocol error, if any.
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            DiscoveryError::Protocol(e) => Some(e),
            DiscoveryError::ProcessStart(_) => None,
        }
    }
}

/// Protocol level failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Operation is not valid from the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the driver was in
        state: DiscoveryState,
    },

    /// Reply tag does not match the command that was sent.
    #[error("communication out of sync, expected '{expected}', received '{received}'")]
    OutOfSync {
        /// Reply tag of the outstanding command
        expected: &'static str,
        /// Tag that arrived instead
        received: String,
    },

    /// Worker reported failure for a command.
    #[error("command {command} failed: {message}")]
    CommandFailed {
        /// Command word
        command: &'static str,
        /// Worker's explanation
        message: String,
    },

    /// Output line was not a valid protocol message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Worker speaks a protocol version this driver does not.
    #[error(
        "protocol version not supported: requested {requested}, got {0}",
        requested = crate::protocol::PROTOCOL_VERSION
    )]
    UnsupportedVersion(u32),

    /// No reply within the configured response timeout.
    #[error("timed out waiting for {command} reply")]
    Timeout {
        /// Command word
        command: &'static str,
    },

    /// Worker output closed while a reply was expected.
    #[error("worker exited")]
    WorkerExited,

    /// Writing to the worker failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DiscoveryError::from(ProtocolError::InvalidState {
            operation: "start",
            state: DiscoveryState::Dead,
        });
        assert_eq!(err.to_string(), "protocol error: cannot start while dead");
        assert!(err.as_protocol().is_some());
        assert!(!err.is_process_start());

        let err = ProtocolError::OutOfSync {
            expected: "quit",
            received: "list".into(),
        };
        assert!(err.to_string().contains("expected 'quit', received 'list'"));

        let err = ProtocolError::UnsupportedVersion(2);
        assert_eq!(
            err.to_string(),
            format!(
                "protocol version not supported: requested {}, got 2",
                crate::protocol::PROTOCOL_VERSION
            )
        );

        let err = DiscoveryError::ProcessStart("No such file or directory".into());
        assert!(err.is_process_start());
        assert!(err.to_string().starts_with("process not started"));
    }
}
