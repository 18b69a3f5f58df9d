//! `discovery-core`
//!
//! Core types shared by every part of the port discovery system.
//!
//! This crate has no I/O. It defines the records a discovery worker reports,
//! the lifecycle state of a worker, the line-oriented wire protocol used to
//! talk to worker processes, and the error taxonomy used by the drivers.
//!
//! ## Key Types
//!
//! - [`Port`]: One discoverable attachment point and its metadata
//! - [`Event`]: An add/remove notification emitted while a worker is syncing
//! - [`DiscoveryState`]: Explicit state machine for a worker's lifecycle
//! - [`protocol::Command`] / [`protocol::Message`]: Wire protocol codec
//! - [`DiscoveryError`]: Per-worker error with protocol classification

pub mod error;
pub mod port;
pub mod protocol;
pub mod state;

pub use error::{DiscoveryError, ProtocolError};
pub use port::{Event, EventKind, Port, PortKey};
pub use state::DiscoveryState;

/// Result alias for driver operations.
pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;
