//! Discovery manager.
//!
//! Owns a registry of [`PluggableDiscovery`] drivers keyed by id and applies
//! lifecycle operations to all of them at once. Each bulk operation runs the
//! per-worker calls concurrently on a snapshot of the registry, waits for all
//! of them, and returns the successful results together with one
//! [`ManagerError`] per failed worker.
//!
//! While syncing, each worker's private event stream is copied into one
//! global channel by a forwarding task, so consumers see a single merged
//! [`EventStream`]. Events from one worker keep their order; events from
//! different workers interleave arbitrarily.
//!
//! Bulk operations on one manager must not overlap; the registry itself may
//! be read from anywhere.

use crate::error::{ManagerError, Operation};
use crate::event_stream::EventStream;
use crate::pluggable::PluggableDiscovery;
use discovery_core::{DiscoveryResult, DiscoveryState, Event, Port};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Channel sizes used by [`DiscoveryManager::start_sync_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Capacity of each worker's private event stream
    pub event_buffer_size: usize,
    /// Capacity of the merged stream
    pub global_buffer_size: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            event_buffer_size: 5,
            global_buffer_size: 5,
        }
    }
}

struct GlobalChannel {
    sender: mpsc::Sender<Event>,
    stream: EventStream,
    forwarders: Vec<JoinHandle<()>>,
}

impl GlobalChannel {
    fn new(capacity: usize) -> Self {
        let (sender, stream) = EventStream::channel(capacity);
        Self {
            sender,
            stream,
            forwarders: Vec::new(),
        }
    }
}

/// Aggregates many discovery workers.
pub struct DiscoveryManager {
    discoveries: RwLock<BTreeMap<String, Arc<PluggableDiscovery>>>,
    global: Mutex<Option<GlobalChannel>>,
    settings: ManagerSettings,
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryManager {
    /// Empty manager with default channel sizes.
    pub fn new() -> Self {
        Self::with_settings(ManagerSettings::default())
    }

    /// Empty manager with custom channel sizes.
    pub fn with_settings(settings: ManagerSettings) -> Self {
        Self {
            discoveries: RwLock::new(BTreeMap::new()),
            global: Mutex::new(None),
            settings,
        }
    }

    /// Channel sizes in use.
    pub fn settings(&self) -> ManagerSettings {
        self.settings
    }

    /// Register a driver. Fails if its id is already taken, leaving the
    /// registry unchanged.
    pub fn add(&self, discovery: PluggableDiscovery) -> Result<(), ManagerError> {
        let mut discoveries = self.discoveries.write();
        if discoveries.contains_key(discovery.id()) {
            return Err(ManagerError::DuplicateId(discovery.id().to_string()));
        }
        debug!(discovery = %discovery.id(), "registered discovery");
        discoveries.insert(discovery.id().to_string(), Arc::new(discovery));
        Ok(())
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.discoveries.read().keys().cloned().collect()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.discoveries.read().contains_key(id)
    }

    /// Driver registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<PluggableDiscovery>> {
        self.discoveries.read().get(id).cloned()
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.discoveries.read().len()
    }

    /// Whether no driver is registered.
    pub fn is_empty(&self) -> bool {
        self.discoveries.read().is_empty()
    }

    /// Launch every `Dead` worker.
    pub async fn run_all(&self) -> Vec<ManagerError> {
        self.parallelize(
            Operation::Run,
            |state| state == DiscoveryState::Dead,
            |discovery| async move { discovery.run().await },
        )
        .await
    }

    /// Put every `Idling` worker in `LIST` mode.
    pub async fn start_all(&self) -> Vec<ManagerError> {
        self.parallelize(
            Operation::Start,
            |state| state == DiscoveryState::Idling,
            |discovery| async move { discovery.start().await },
        )
        .await
    }

    /// Put every `Idling` worker in event mode and merge their events.
    ///
    /// The merged stream is created on first use and shared by later calls
    /// until a fully successful [`quit_all`](Self::quit_all) or
    /// [`clear`](Self::clear) closes it.
    pub async fn start_sync_all(&self) -> (EventStream, Vec<ManagerError>) {
        let (sender, stream) = {
            let mut global = self.global.lock();
            let channel = global
                .get_or_insert_with(|| GlobalChannel::new(self.settings.global_buffer_size));
            channel.forwarders.retain(|handle| !handle.is_finished());
            (channel.sender.clone(), channel.stream.clone())
        };

        let buffer = self.settings.event_buffer_size;
        let results = self
            .fan_out(
                Operation::StartSync,
                |state| state == DiscoveryState::Idling,
                move |discovery| async move {
                    let events = discovery.start_sync(buffer).await?;
                    Ok((discovery.id().to_string(), events))
                },
            )
            .await;

        let mut errors = Vec::new();
        let mut forwarders = Vec::new();
        for result in results {
            match result {
                Ok((id, events)) => {
                    forwarders.push(tokio::spawn(forward_events(id, events, sender.clone())))
                }
                Err(e) => errors.push(e),
            }
        }
        if let Some(channel) = self.global.lock().as_mut() {
            channel.forwarders.extend(forwarders);
        }

        (stream, errors)
    }

    /// Return every running or syncing worker to `Idling`.
    pub async fn stop_all(&self) -> Vec<ManagerError> {
        self.parallelize(
            Operation::Stop,
            |state| matches!(state, DiscoveryState::Running | DiscoveryState::Syncing),
            |discovery| async move { discovery.stop().await },
        )
        .await
    }

    /// Quit every live worker.
    ///
    /// The merged stream is closed only when every quit succeeded; it then
    /// ends once the forwarders have delivered what they still hold.
    pub async fn quit_all(&self) -> Vec<ManagerError> {
        let errors = self
            .parallelize(
                Operation::Quit,
                |state| state.is_alive(),
                |discovery| async move { discovery.quit().await },
            )
            .await;

        if errors.is_empty() && self.global.lock().take().is_some() {
            debug!("closed merged event stream");
        }
        errors
    }

    /// Ports reported by every `Running` worker.
    pub async fn list(&self) -> (Vec<Port>, Vec<ManagerError>) {
        let results = self
            .fan_out(
                Operation::List,
                |state| state == DiscoveryState::Running,
                |discovery| async move { discovery.list().await },
            )
            .await;

        let mut ports = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(found) => ports.extend(found),
                Err(e) => errors.push(e),
            }
        }
        (ports, errors)
    }

    /// Ports currently known from sync events of every `Syncing` worker.
    pub fn list_sync(&self) -> Vec<Port> {
        self.snapshot(|state| state == DiscoveryState::Syncing)
            .iter()
            .flat_map(|discovery| discovery.list_sync())
            .collect()
    }

    /// Quit everything, forget all workers and close the merged stream.
    pub async fn clear(&self) {
        for error in self.quit_all().await {
            warn!(error = %error, "ignoring quit failure while clearing");
        }
        self.discoveries.write().clear();

        if let Some(channel) = self.global.lock().take() {
            for forwarder in channel.forwarders {
                forwarder.abort();
            }
        }
        info!("discovery manager cleared");
    }

    fn snapshot(&self, select: impl Fn(DiscoveryState) -> bool) -> Vec<Arc<PluggableDiscovery>> {
        self.discoveries
            .read()
            .values()
            .filter(|discovery| select(discovery.state()))
            .cloned()
            .collect()
    }

    /// Run `op` concurrently on every selected worker and wait for all.
    ///
    /// Panics are contained per task and reported as
    /// [`ManagerError::Panicked`].
    async fn fan_out<T, F, Fut>(
        &self,
        operation: Operation,
        select: impl Fn(DiscoveryState) -> bool,
        op: F,
    ) -> Vec<Result<T, ManagerError>>
    where
        T: Send + 'static,
        F: Fn(Arc<PluggableDiscovery>) -> Fut,
        Fut: Future<Output = DiscoveryResult<T>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::new();
        for discovery in self.snapshot(select) {
            let id = discovery.id().to_string();
            let call = op(discovery);
            let owner = id.clone();
            let handle = tasks.spawn(async move {
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ManagerError::discovery(&id, operation, e)),
                    Err(_) => Err(ManagerError::Panicked { id, operation }),
                }
            });
            owners.insert(handle.id(), owner);
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap_or_else(|e| Err(join_failure(&owners, operation, e))));
        }
        results
    }

    async fn parallelize<F, Fut>(
        &self,
        operation: Operation,
        select: impl Fn(DiscoveryState) -> bool,
        op: F,
    ) -> Vec<ManagerError>
    where
        F: Fn(Arc<PluggableDiscovery>) -> Fut,
        Fut: Future<Output = DiscoveryResult<()>> + Send + 'static,
    {
        let errors: Vec<ManagerError> = self
            .fan_out(operation, select, op)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        for error in &errors {
            debug!(error = %error, "discovery operation failed");
        }
        errors
    }
}

/// Attribute a task that never produced a result to its worker.
fn join_failure(
    owners: &HashMap<task::Id, String>,
    operation: Operation,
    error: JoinError,
) -> ManagerError {
    let id = owners
        .get(&error.id())
        .cloned()
        .unwrap_or_else(|| format!("task {}", error.id()));
    if error.is_panic() {
        ManagerError::Panicked { id, operation }
    } else {
        ManagerError::Cancelled {
            id,
            operation,
            reason: error.to_string(),
        }
    }
}

async fn forward_events(id: String, mut events: mpsc::Receiver<Event>, merged: mpsc::Sender<Event>) {
    while let Some(event) = events.recv().await {
        if merged.send(event).await.is_err() {
            debug!(discovery = %id, "merged stream closed, stopping forwarder");
            return;
        }
    }
    debug!(discovery = %id, "event stream ended");
}

impl fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("discoveries", &self.ids())
            .field("syncing", &self.global.lock().is_some())
            .field("settings", &self.settings)
            .finish()
    }
}
