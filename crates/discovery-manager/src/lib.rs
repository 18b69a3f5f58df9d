//! `discovery-manager`
//!
//! Drives external pluggable discovery workers and aggregates them.
//!
//! - [`PluggableDiscovery`]: one worker process and its lifecycle state machine
//! - [`DiscoveryManager`]: a registry of workers with concurrent bulk
//!   operations and a merged event stream
//! - [`ProcessLauncher`]: spawns worker executables
//! - [`mock::MockWorker`]: in-memory worker for tests
//!
//! ```rust,ignore
//! let manager = DiscoveryManager::new();
//! manager.add(PluggableDiscovery::new(
//!     "serial",
//!     Arc::new(ProcessLauncher::new("serial", "/opt/discovery/serial-discovery")),
//! ))?;
//! manager.run_all().await;
//! let (events, _errors) = manager.start_sync_all().await;
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.kind, event.port);
//! }
//! ```

pub mod error;
pub mod event_stream;
pub mod manager;
pub mod mock;
pub mod pluggable;
pub mod process;
pub mod transport;

pub use discovery_core::{DiscoveryError, DiscoveryState, Event, EventKind, Port, ProtocolError};
pub use error::{ManagerError, Operation};
pub use event_stream::EventStream;
pub use manager::{DiscoveryManager, ManagerSettings};
pub use pluggable::{DriverSettings, PluggableDiscovery};
pub use process::ProcessLauncher;
pub use transport::{CommandSink, MessageSource, Termination, WorkerIo, WorkerLauncher};
