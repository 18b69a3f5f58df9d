//! Pluggable discovery driver.
//!
//! A [`PluggableDiscovery`] owns exactly one external worker and moves it
//! through the lifecycle:
//!
//! | From | Operation | To |
//! |------|-----------|----|
//! | Dead | [`run`](PluggableDiscovery::run) | Idling |
//! | Idling | [`start`](PluggableDiscovery::start) | Running |
//! | Idling | [`start_sync`](PluggableDiscovery::start_sync) | Syncing |
//! | Running / Syncing | [`stop`](PluggableDiscovery::stop) | Idling |
//! | any alive | [`quit`](PluggableDiscovery::quit) | Dead |
//!
//! Every operation either succeeds, is a no-op (already in the target state
//! where that makes sense), or fails with a typed error. Operations on one
//! driver are serialized, so only one command is ever in flight per worker.
//!
//! # Reader task
//!
//! After a successful launch a background task owns the worker's output. It
//! routes `add`/`remove` events into the sync session (replaying them into a
//! local port snapshot and pushing them on the event stream) and everything
//! else onto the reply queue awaited by the current command. When the worker's
//! output closes the driver moves to `Dead` and any open event stream is closed.

use crate::transport::{CommandSink, MessageSource, Termination, WorkerIo, WorkerLauncher};
use discovery_core::protocol::{Command, Incoming, Message, PROTOCOL_VERSION};
use discovery_core::{
    DiscoveryError, DiscoveryResult, DiscoveryState, Event, EventKind, Port, PortKey, ProtocolError,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Replies queued between the reader task and the awaiting command.
const REPLY_QUEUE: usize = 8;

/// Per-driver tunables.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Sent in the `HELLO` handshake
    pub user_agent: String,
    /// Time a worker gets to acknowledge `QUIT` and exit, in total
    pub quit_grace_period: Duration,
    /// Upper bound for any other command round trip (`None` waits forever)
    pub response_timeout: Option<Duration>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("port-discovery {}", env!("CARGO_PKG_VERSION")),
            quit_grace_period: Duration::from_secs(5),
            response_timeout: None,
        }
    }
}

impl DriverSettings {
    /// Override the `HELLO` user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Override the quit grace period.
    pub fn with_quit_grace_period(mut self, grace: Duration) -> Self {
        self.quit_grace_period = grace;
        self
    }

    /// Bound every non-`QUIT` round trip, or wait forever with `None`.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// One managed discovery worker.
pub struct PluggableDiscovery {
    id: String,
    launcher: Arc<dyn WorkerLauncher>,
    settings: DriverSettings,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

/// State touched by both the driver and its reader task.
#[derive(Default)]
struct Shared {
    status: Mutex<Status>,
    sync: Mutex<Option<SyncSession>>,
}

#[derive(Default)]
struct Status {
    state: DiscoveryState,
    /// Cleared by the reader task when the worker's output closes
    worker_alive: bool,
}

struct SyncSession {
    events: mpsc::Sender<Event>,
    ports: HashMap<PortKey, Port>,
    /// Events waiting for delivery while the stream is not handed out yet
    /// or still being flushed. `None` once delivery goes straight to `events`.
    backlog: Option<Backlog>,
}

type Backlog = Arc<Mutex<VecDeque<Event>>>;

impl SyncSession {
    fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            events,
            ports: HashMap::new(),
            backlog: Some(Backlog::default()),
        }
    }

    fn apply(&mut self, event: &Event) {
        match event.kind {
            EventKind::Add => {
                self.ports.insert(event.port.key(), event.port.clone());
            }
            EventKind::Remove => {
                self.ports.remove(&event.port.key());
            }
        }
    }
}

struct Session {
    commands: Box<dyn CommandSink>,
    replies: mpsc::Receiver<Result<Message, ProtocolError>>,
    reader: JoinHandle<()>,
}

impl Shared {
    fn state(&self) -> DiscoveryState {
        self.status.lock().state
    }

    /// Move to `to` unless the worker exited in the meantime.
    fn transition(&self, to: DiscoveryState) -> Result<(), ProtocolError> {
        let mut status = self.status.lock();
        if !status.worker_alive {
            return Err(ProtocolError::WorkerExited);
        }
        status.state = to;
        Ok(())
    }

    fn mark_dead(&self) {
        {
            let mut status = self.status.lock();
            status.worker_alive = false;
            status.state = DiscoveryState::Dead;
        }
        self.close_sync();
    }

    fn close_sync(&self) {
        self.sync.lock().take();
    }

    fn list_sync(&self) -> Vec<Port> {
        self.sync
            .lock()
            .as_ref()
            .map(|sync| sync.ports.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn dispatch_event(&self, id: &str, event: Event) {
        let sender = {
            let mut sync = self.sync.lock();
            let Some(session) = sync.as_mut() else {
                debug!(discovery = %id, kind = %event.kind, "ignoring event received outside sync");
                return;
            };
            session.apply(&event);
            match &session.backlog {
                Some(backlog) => {
                    backlog.lock().push_back(event);
                    return;
                }
                None => session.events.clone(),
            }
        };

        if sender.send(event).await.is_err() {
            debug!(discovery = %id, "event stream receiver dropped");
        }
    }

    /// Start delivering backlogged events once the receiver has an owner.
    fn release_backlog(self: &Arc<Self>, id: &str) {
        let flush = {
            let mut sync = self.sync.lock();
            let Some(session) = sync.as_mut() else { return };
            match session.backlog.take() {
                Some(backlog) if !backlog.lock().is_empty() => {
                    session.backlog = Some(Arc::clone(&backlog));
                    Some((session.events.clone(), backlog))
                }
                _ => None,
            }
        };

        if let Some((events, backlog)) = flush {
            debug!(discovery = %id, pending = backlog.lock().len(), "flushing events received before sync ack");
            tokio::spawn(flush_backlog(
                id.to_string(),
                Arc::clone(self),
                events,
                backlog,
            ));
        }
    }
}

/// Deliver `backlog` in order, then switch the session to direct delivery.
///
/// Events keep landing in the backlog while this runs, so ordering holds.
/// A closed session still gets its remaining backlog delivered.
async fn flush_backlog(
    id: String,
    shared: Arc<Shared>,
    events: mpsc::Sender<Event>,
    backlog: Backlog,
) {
    loop {
        let next = {
            let mut sync = shared.sync.lock();
            let mut pending = backlog.lock();
            let next = pending.pop_front();
            if next.is_none() {
                if let Some(session) = sync.as_mut() {
                    let current = session
                        .backlog
                        .as_ref()
                        .is_some_and(|b| Arc::ptr_eq(b, &backlog));
                    if current {
                        session.backlog = None;
                    }
                }
            }
            next
        };

        let Some(event) = next else { return };
        if events.send(event).await.is_err() {
            debug!(discovery = %id, "event stream receiver dropped during flush");
            return;
        }
    }
}

async fn read_messages(
    id: String,
    mut messages: Box<dyn MessageSource>,
    shared: Arc<Shared>,
    replies: mpsc::Sender<Result<Message, ProtocolError>>,
) {
    while let Some(received) = messages.receive().await {
        let forwarded = match received.and_then(Message::classify) {
            Ok(Incoming::Event(event)) => {
                shared.dispatch_event(&id, event).await;
                continue;
            }
            Ok(Incoming::Reply(message)) => Ok(message),
            Err(e) => {
                warn!(discovery = %id, error = %e, "invalid message from worker");
                Err(e)
            }
        };

        match replies.try_send(forwarded) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(discovery = %id, dropped = ?dropped, "reply queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    debug!(discovery = %id, "worker output closed");
    shared.mark_dead();
}

impl PluggableDiscovery {
    /// New driver in state `Dead` with default settings.
    pub fn new(id: impl Into<String>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::with_settings(id, launcher, DriverSettings::default())
    }

    /// New driver in state `Dead`.
    pub fn with_settings(
        id: impl Into<String>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            id: id.into(),
            launcher,
            settings,
            shared: Arc::new(Shared::default()),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Registry key, also used to tag logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Settings this driver was built with.
    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Current state. Never blocks on worker I/O.
    pub fn state(&self) -> DiscoveryState {
        self.shared.state()
    }

    /// Spawn the worker and perform the `HELLO` handshake.
    ///
    /// No-op when the worker is already alive. On failure the driver stays
    /// `Dead` and any spawned process is released.
    pub async fn run(&self) -> DiscoveryResult<()> {
        let mut guard = self.session.lock().await;
        if self.state().is_alive() {
            return Ok(());
        }
        if let Some(stale) = guard.take() {
            self.close_session(stale).await;
        }

        let WorkerIo { commands, messages } = self
            .launcher
            .launch()
            .await
            .map_err(|e| DiscoveryError::ProcessStart(e.to_string()))?;

        self.shared.status.lock().worker_alive = true;
        let (replies_tx, replies) = mpsc::channel(REPLY_QUEUE);
        let reader = tokio::spawn(read_messages(
            self.id.clone(),
            messages,
            Arc::clone(&self.shared),
            replies_tx,
        ));
        let mut session = Session {
            commands,
            replies,
            reader,
        };

        let handshake = match self.handshake(&mut session).await {
            Ok(()) => self.shared.transition(DiscoveryState::Idling),
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            self.close_session(session).await;
            self.shared.mark_dead();
            return Err(DiscoveryError::ProcessStart(format!("handshake failed: {}", e)));
        }

        *guard = Some(session);
        info!(discovery = %self.id, "discovery process started");
        Ok(())
    }

    /// Put an idling worker in on-demand `LIST` mode.
    pub async fn start(&self) -> DiscoveryResult<()> {
        let mut guard = self.session.lock().await;
        match self.state() {
            DiscoveryState::Running => return Ok(()),
            DiscoveryState::Idling => {}
            state => {
                return Err(ProtocolError::InvalidState {
                    operation: "start",
                    state,
                }
                .into())
            }
        }
        let session = guard.as_mut().ok_or(ProtocolError::WorkerExited)?;

        self.roundtrip(session, &Command::Start).await?;
        self.shared.transition(DiscoveryState::Running)?;
        info!(discovery = %self.id, "discovery started");
        Ok(())
    }

    /// Put an idling worker in event streaming mode.
    ///
    /// The returned stream holds at most `buffer` undelivered events and is
    /// closed once `stop` or `quit` completes or the worker exits. Events
    /// already queued are still delivered before closure.
    pub async fn start_sync(&self, buffer: usize) -> DiscoveryResult<mpsc::Receiver<Event>> {
        let mut guard = self.session.lock().await;
        let state = self.state();
        if state != DiscoveryState::Idling {
            return Err(ProtocolError::InvalidState {
                operation: "start sync",
                state,
            }
            .into());
        }
        let session = guard.as_mut().ok_or(ProtocolError::WorkerExited)?;

        // Installed before the command so events racing the ack are kept.
        // They stay in the backlog until the receiver is returned.
        let (events, stream) = mpsc::channel(buffer.max(1));
        *self.shared.sync.lock() = Some(SyncSession::new(events));

        let started = match self.roundtrip(session, &Command::StartSync).await {
            Ok(_) => self.shared.transition(DiscoveryState::Syncing),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.shared.close_sync();
            return Err(e.into());
        }

        self.shared.release_backlog(&self.id);
        info!(discovery = %self.id, "discovery syncing");
        Ok(stream)
    }

    /// Return a running or syncing worker to `Idling`.
    pub async fn stop(&self) -> DiscoveryResult<()> {
        let mut guard = self.session.lock().await;
        let state = self.state();
        if !matches!(state, DiscoveryState::Running | DiscoveryState::Syncing) {
            return Err(ProtocolError::InvalidState {
                operation: "stop",
                state,
            }
            .into());
        }
        let session = guard.as_mut().ok_or(ProtocolError::WorkerExited)?;

        self.roundtrip(session, &Command::Stop).await?;
        if state == DiscoveryState::Syncing {
            self.shared.close_sync();
        }
        self.shared.transition(DiscoveryState::Idling)?;
        info!(discovery = %self.id, "discovery stopped");
        Ok(())
    }

    /// Send `QUIT` and release the worker process.
    ///
    /// Always ends in `Dead`. The grace period bounds the acknowledgement and
    /// the exit together. A worker that does not make it in time is terminated
    /// and the call still succeeds; an explicit failure or malformed reply is
    /// returned as an error after the process is released. Quitting a `Dead`
    /// worker is a no-op.
    pub async fn quit(&self) -> DiscoveryResult<()> {
        let mut guard = self.session.lock().await;
        let session = guard.take();
        if !self.state().is_alive() {
            if let Some(stale) = session {
                self.close_session(stale).await;
            }
            return Ok(());
        }
        let Some(mut session) = session else {
            self.shared.mark_dead();
            return Ok(());
        };

        // One budget covers both the acknowledgement and the exit
        let grace = self.settings.quit_grace_period;
        let deadline = Instant::now() + grace;
        let acknowledged =
            tokio::time::timeout_at(deadline, self.roundtrip(&mut session, &Command::Quit)).await;
        let outcome = match acknowledged {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(ProtocolError::WorkerExited | ProtocolError::Transport(_))) => {
                debug!(discovery = %self.id, "worker already gone before QUIT");
                Ok(())
            }
            Ok(Err(ProtocolError::Timeout { .. })) | Err(_) => {
                warn!(discovery = %self.id, ?grace, "worker did not acknowledge QUIT, terminating");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.release(session, remaining).await;
        self.shared.mark_dead();
        info!(discovery = %self.id, "discovery quit");
        outcome.map_err(Into::into)
    }

    /// Query the ports currently seen by a running worker.
    pub async fn list(&self) -> DiscoveryResult<Vec<Port>> {
        let mut guard = self.session.lock().await;
        let state = self.state();
        if state != DiscoveryState::Running {
            return Err(ProtocolError::InvalidState {
                operation: "list",
                state,
            }
            .into());
        }
        let session = guard.as_mut().ok_or(ProtocolError::WorkerExited)?;

        let reply = self.roundtrip(session, &Command::List).await?;
        Ok(reply.ports.unwrap_or_default())
    }

    /// Ports known from replayed sync events. Empty unless `Syncing`.
    pub fn list_sync(&self) -> Vec<Port> {
        self.shared.list_sync()
    }

    async fn handshake(&self, session: &mut Session) -> Result<(), ProtocolError> {
        let hello = Command::Hello {
            user_agent: self.settings.user_agent.clone(),
        };
        let reply = self.roundtrip(session, &hello).await?;
        match reply.protocol_version {
            Some(version) if version > PROTOCOL_VERSION => {
                Err(ProtocolError::UnsupportedVersion(version))
            }
            Some(_) => Ok(()),
            None => Err(ProtocolError::Malformed(
                "hello reply without protocolVersion".into(),
            )),
        }
    }

    async fn roundtrip(
        &self,
        session: &mut Session,
        command: &Command,
    ) -> Result<Message, ProtocolError> {
        while let Ok(stale) = session.replies.try_recv() {
            warn!(discovery = %self.id, stale = ?stale, "discarding unexpected message");
        }

        debug!(discovery = %self.id, command = command.name(), "sending command");
        session.commands.send(command).await?;

        let reply = match self.settings.response_timeout {
            Some(limit) => tokio::time::timeout(limit, session.replies.recv())
                .await
                .map_err(|_| ProtocolError::Timeout {
                    command: command.name(),
                })?,
            None => session.replies.recv().await,
        };
        reply
            .ok_or(ProtocolError::WorkerExited)?
            .and_then(|message| message.reply_to(command))
    }

    async fn close_session(&self, session: Session) {
        self.release(session, self.settings.quit_grace_period).await;
    }

    /// Shut the worker down, allowing it `grace` to exit by itself.
    async fn release(&self, mut session: Session, grace: Duration) {
        match session.commands.shutdown(grace).await {
            Ok(Termination::Exited) => debug!(discovery = %self.id, "worker released"),
            Ok(Termination::Killed) => {
                warn!(discovery = %self.id, "worker did not exit in time and was terminated")
            }
            Err(e) => warn!(discovery = %self.id, error = %e, "failed to shut down worker"),
        }
        session.reader.abort();
        let _ = session.reader.await;
    }
}

impl fmt::Debug for PluggableDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluggableDiscovery")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
