//! # Port Discovery
//!
//! Runs pluggable discovery workers (external programs such as
//! `serial-discovery` or `mdns-discovery`) and reports the ports they find.
//!
//! The protocol types live in [`discovery_core`] and the worker drivers in
//! [`discovery_manager`]. This crate adds what an application around them
//! needs:
//!
//! - **`config`**: Figment layered configuration and construction of a
//!   [`DiscoveryManager`](discovery_manager::DiscoveryManager) from it.
//! - **`logging`**: `tracing-subscriber` setup for the binary.
//! - **`port_resolver`**: Resolves a user supplied address to a fully
//!   described port by syncing all discoveries for a short while.

pub mod config;
pub mod logging;
pub mod port_resolver;

pub use discovery_core;
pub use discovery_manager;
