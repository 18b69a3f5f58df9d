//! Manager level errors.
//!
//! Bulk operations never stop at the first failure. Each worker that fails
//! contributes one [`ManagerError`] naming it, and the successful siblings'
//! results are returned alongside.

use discovery_core::DiscoveryError;
use std::fmt;
use thiserror::Error;

/// Driver operation a per-worker error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Launch and handshake
    Run,
    /// Enter on-demand `LIST` mode
    Start,
    /// Enter event streaming mode
    StartSync,
    /// Return to idle
    Stop,
    /// Terminate the worker
    Quit,
    /// One-shot port listing
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Run => "running",
            Operation::Start => "starting",
            Operation::StartSync => "start syncing",
            Operation::Stop => "stopping",
            Operation::Quit => "quitting",
            Operation::List => "listing ports from",
        };
        f.write_str(label)
    }
}

/// Failure attributed to one registered worker.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// A discovery with this id is already registered.
    #[error("pluggable discovery already added: {0}")]
    DuplicateId(String),

    /// One worker failed one operation.
    #[error("{operation} discovery {id}: {source}")]
    Discovery {
        /// Worker id
        id: String,
        /// Operation that failed
        operation: Operation,
        /// Driver error
        #[source]
        source: DiscoveryError,
    },

    /// Operation task panicked; the worker is excluded from the result.
    #[error("{operation} discovery {id}: task panicked")]
    Panicked {
        /// Worker id
        id: String,
        /// Operation that was running
        operation: Operation,
    },

    /// Operation task was cancelled before it finished.
    #[error("{operation} discovery {id}: task cancelled ({reason})")]
    Cancelled {
        /// Worker id
        id: String,
        /// Operation that was running
        operation: Operation,
        /// Runtime's description of the cancellation
        reason: String,
    },
}

impl ManagerError {
    pub(crate) fn discovery(id: &str, operation: Operation, source: DiscoveryError) -> Self {
        ManagerError::Discovery {
            id: id.to_string(),
            operation,
            source,
        }
    }

    /// Worker the error is attributed to.
    pub fn id(&self) -> &str {
        match self {
            ManagerError::DuplicateId(id)
            | ManagerError::Discovery { id, .. }
            | ManagerError::Panicked { id, .. }
            | ManagerError::Cancelled { id, .. } => id,
        }
    }

    /// Underlying driver error, for `Discovery` errors.
    pub fn discovery_error(&self) -> Option<&DiscoveryError> {
        match self {
            ManagerError::Discovery { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_core::{DiscoveryState, ProtocolError};

    #[test]
    fn test_error_names_worker_and_operation() {
        let err = ManagerError::discovery(
            "serial",
            Operation::Start,
            ProtocolError::InvalidState {
                operation: "start",
                state: DiscoveryState::Dead,
            }
            .into(),
        );
        assert_eq!(
            err.to_string(),
            "starting discovery serial: protocol error: cannot start while dead"
        );
        assert_eq!(err.id(), "serial");
        assert!(err.discovery_error().is_some());

        let err = ManagerError::discovery(
            "mdns",
            Operation::List,
            DiscoveryError::ProcessStart("gone".into()),
        );
        assert!(err.to_string().starts_with("listing ports from discovery mdns"));

        let err = ManagerError::Cancelled {
            id: "ble".into(),
            operation: Operation::Quit,
            reason: "task 7 was cancelled".into(),
        };
        assert_eq!(err.id(), "ble");
        assert_eq!(
            err.to_string(),
            "quitting discovery ble: task cancelled (task 7 was cancelled)"
        );
    }
}
