//! Port resolution from a user supplied address.
//!
//! Turns an address typed by the user (`/dev/ttyACM0`, `COM3`,
//! `192.168.1.7`) into a fully described [`Port`] by briefly syncing every
//! configured discovery and waiting for one of them to announce it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use port_discovery::port_resolver::{resolve_port, PortQuery};
//!
//! let query = PortQuery::new("/dev/ttyACM0").with_timeout(Duration::from_secs(2));
//! let port = resolve_port(&manager, &query).await?;
//! println!("{} via {}", port.address, port.protocol);
//! ```
//!
//! An empty address resolves to the `default` protocol sentinel without
//! starting any worker. A bare address that no worker reports is assumed to be
//! a serial port unless a protocol was requested explicitly.

use discovery_core::port::SERIAL_PROTOCOL;
use discovery_manager::{DiscoveryManager, EventKind, EventStream, ManagerError, Port};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default time to wait for a matching port announcement.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during port resolution.
#[derive(Debug, Error)]
pub enum PortResolveError {
    /// Not a single discovery could be launched.
    #[error("no pluggable discovery could be started ({} failed)", .0.len())]
    AllDiscoveriesFailed(Vec<ManagerError>),

    /// Some discoveries refused to enter sync mode.
    #[error("failed to start syncing: {}", join_errors(.0))]
    StartSync(Vec<ManagerError>),

    /// No discovery reported the address with the requested protocol.
    #[error("port not found: {address} {protocol}")]
    PortNotFound {
        /// Requested address
        address: String,
        /// Requested protocol
        protocol: String,
    },
}

fn join_errors(errors: &[ManagerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// What to look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortQuery {
    /// Address as typed by the user; empty selects the default sentinel
    pub address: String,
    /// Protocol the port must be reported with, if any
    pub protocol: Option<String>,
    /// How long to wait for a matching announcement
    pub timeout: Duration,
}

impl PortQuery {
    /// Query for `address` with any protocol and the default timeout.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocol: None,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Require the port to be reported with `protocol`.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Override how long to wait for an announcement.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether `port` satisfies this query.
    pub fn matches(&self, port: &Port) -> bool {
        port.address == self.address
            && self
                .protocol
                .as_deref()
                .map_or(true, |protocol| port.protocol == protocol)
    }
}

/// Resolve `query` against the discoveries registered in `manager`.
///
/// Every worker that was started is quit before returning, whatever the
/// outcome.
pub async fn resolve_port(
    manager: &DiscoveryManager,
    query: &PortQuery,
) -> Result<Port, PortResolveError> {
    if query.address.is_empty() {
        return Ok(Port::default_port());
    }

    let mut events = None;
    let resolved = search(manager, query, &mut events).await;

    let quit_errors = match events {
        Some(events) => quit_draining(manager, &events).await,
        None => manager.quit_all().await,
    };
    for e in quit_errors {
        error!(error = %e, "failed to quit discovery");
    }
    resolved
}

/// Quit all workers while discarding events still in flight. A worker
/// blocked on a full event stream cannot read its `QUIT` reply.
pub async fn quit_draining(manager: &DiscoveryManager, events: &EventStream) -> Vec<ManagerError> {
    let quit = manager.quit_all();
    tokio::pin!(quit);
    loop {
        tokio::select! {
            errors = &mut quit => return errors,
            Some(event) = events.recv() => debug!(port = %event.port, "discarding late event"),
        }
    }
}

async fn search(
    manager: &DiscoveryManager,
    query: &PortQuery,
    stream: &mut Option<EventStream>,
) -> Result<Port, PortResolveError> {
    let errors = manager.run_all().await;
    if errors.len() >= manager.len() {
        return Err(PortResolveError::AllDiscoveriesFailed(errors));
    }
    for e in &errors {
        warn!(error = %e, "discovery not started, continuing without it");
    }

    let (events, errors) = manager.start_sync_all().await;
    *stream = Some(events.clone());
    if !errors.is_empty() {
        return Err(PortResolveError::StartSync(errors));
    }

    let deadline = Instant::now() + query.timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) if event.kind == EventKind::Add && query.matches(&event.port) => {
                info!(port = %event.port, "port resolved");
                return Ok(event.port);
            }
            Ok(Some(event)) => debug!(kind = %event.kind, port = %event.port, "skipping event"),
            Ok(None) => {
                debug!("event stream closed before a match");
                break;
            }
            Err(_) => {
                debug!(timeout = ?query.timeout, "no matching port announced in time");
                break;
            }
        }
    }

    match &query.protocol {
        None => Ok(Port::new(query.address.clone(), SERIAL_PROTOCOL)),
        Some(protocol) => Err(PortResolveError::PortNotFound {
            address: query.address.clone(),
            protocol: protocol.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matching() {
        let port = Port::new("/dev/ttyACM0", "serial");
        assert!(PortQuery::new("/dev/ttyACM0").matches(&port));
        assert!(PortQuery::new("/dev/ttyACM0")
            .with_protocol("serial")
            .matches(&port));
        assert!(!PortQuery::new("/dev/ttyACM0")
            .with_protocol("network")
            .matches(&port));
        assert!(!PortQuery::new("/dev/ttyACM1").matches(&port));
    }

    #[tokio::test]
    async fn test_empty_address_is_default_sentinel() {
        let manager = DiscoveryManager::new();
        let port = resolve_port(&manager, &PortQuery::new("")).await.unwrap();
        assert!(port.is_default());
    }

    #[tokio::test]
    async fn test_no_discoveries_fails() {
        let manager = DiscoveryManager::new();
        let err = resolve_port(&manager, &PortQuery::new("COM3"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortResolveError::AllDiscoveriesFailed(ref e) if e.is_empty()));
    }
}
