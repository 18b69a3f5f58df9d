//! Lifecycle state of a discovery worker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Explicit state tracking for a pluggable discovery.
///
/// ```text
/// Dead --run--> Idling --start--> Running
///                  |                 |
///                  +--start_sync--> Syncing
///
/// Running/Syncing --stop--> Idling
/// any --quit--> Dead
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    /// No worker process, or the worker has exited
    #[default]
    Dead,
    /// Process running and handshake done, not discovering
    Idling,
    /// Answering on-demand `LIST` queries
    Running,
    /// Streaming add/remove events
    Syncing,
}

impl DiscoveryState {
    /// Whether a worker process is attached.
    pub fn is_alive(&self) -> bool {
        !matches!(self, DiscoveryState::Dead)
    }

    /// Lowercase name, as used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryState::Dead => "dead",
            DiscoveryState::Idling => "idling",
            DiscoveryState::Running => "running",
            DiscoveryState::Syncing => "syncing",
        }
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
