//! In-memory discovery worker for tests.
//!
//! [`MockWorker`] implements [`WorkerLauncher`] over `tokio::io::duplex`
//! pipes, speaking the same line protocol a real worker would. Its
//! [`MockBehavior`] decides how each command is answered, and the test can
//! inject port events or a crash at any time.
//!
//! ```rust,ignore
//! let worker = MockWorker::new(MockBehavior::default());
//! let disc = PluggableDiscovery::new("mock", Arc::new(worker.clone()));
//! disc.run().await?;
//! let mut events = disc.start_sync(5).await?;
//! worker.emit(Event::add(Port::new("COM3", "serial")));
//! ```

use crate::transport::{CommandSink, LineReader, LineWriter, Termination, WorkerIo, WorkerLauncher};
use async_trait::async_trait;
use discovery_core::protocol::{Command, Message};
use discovery_core::{Event, Port};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 4096;

/// How the mock answers `QUIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuitBehavior {
    /// Acknowledge and exit
    #[default]
    Acknowledge,
    /// Reply with an error, exit once input closes
    Refuse,
    /// Never reply and never exit
    Hang,
    /// Answer with a line that is not JSON, exit once input closes
    Garble,
}

/// How the mock answers `STOP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBehavior {
    /// Acknowledge and leave the current mode
    #[default]
    Acknowledge,
    /// Reply with an error and keep the current mode
    Refuse,
    /// Answer with a line that is not JSON
    Garble,
    /// Answer with the reply tag of another command
    Misreply,
}

/// Scripted answers of a [`MockWorker`].
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Launch fails as if the executable were missing
    pub fail_launch: bool,
    /// Version announced in the `HELLO` reply
    pub protocol_version: u32,
    /// `START` is answered with an error
    pub fail_start: bool,
    /// `START_SYNC` is answered with an error
    pub fail_start_sync: bool,
    /// `LIST` reply, or the error message to fail it with
    pub list: Result<Vec<Port>, String>,
    /// `LIST` is never answered
    pub silent_on_list: bool,
    /// Ports announced when `START_SYNC` succeeds
    pub sync_ports: Vec<Port>,
    /// Announce `sync_ports` before the `START_SYNC` acknowledgement
    pub announce_before_ack: bool,
    /// Answer to `STOP`
    pub stop: StopBehavior,
    /// Answer to `QUIT`
    pub quit: QuitBehavior,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_launch: false,
            protocol_version: 1,
            fail_start: false,
            fail_start_sync: false,
            list: Ok(Vec::new()),
            silent_on_list: false,
            sync_ports: Vec::new(),
            announce_before_ack: false,
            stop: StopBehavior::Acknowledge,
            quit: QuitBehavior::Acknowledge,
        }
    }
}

impl MockBehavior {
    /// Fail every launch.
    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// Announce `version` in the handshake.
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Refuse `START`.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Refuse `START_SYNC`.
    pub fn failing_start_sync(mut self) -> Self {
        self.fail_start_sync = true;
        self
    }

    /// Answer `LIST` with `ports`.
    pub fn with_ports(mut self, ports: Vec<Port>) -> Self {
        self.list = Ok(ports);
        self
    }

    /// Refuse `LIST` with `message`.
    pub fn failing_list(mut self, message: impl Into<String>) -> Self {
        self.list = Err(message.into());
        self
    }

    /// Never answer `LIST`.
    pub fn silent_on_list(mut self) -> Self {
        self.silent_on_list = true;
        self
    }

    /// Announce `ports` on `START_SYNC`.
    pub fn with_sync_ports(mut self, ports: Vec<Port>) -> Self {
        self.sync_ports = ports;
        self
    }

    /// Send the sync announcements ahead of the acknowledgement.
    pub fn announcing_before_ack(mut self) -> Self {
        self.announce_before_ack = true;
        self
    }

    /// Answer `STOP` according to `stop`.
    pub fn with_stop(mut self, stop: StopBehavior) -> Self {
        self.stop = stop;
        self
    }

    /// Answer `QUIT` according to `quit`.
    pub fn with_quit(mut self, quit: QuitBehavior) -> Self {
        self.quit = quit;
        self
    }
}

enum WorkerSignal {
    Emit(Event),
    Crash,
}

#[derive(Default)]
struct Control {
    signals: Option<mpsc::UnboundedSender<WorkerSignal>>,
    received: Vec<String>,
    launches: usize,
}

/// Scriptable worker. Clones share behavior and recorded commands.
#[derive(Clone, Default)]
pub struct MockWorker {
    behavior: Arc<Mutex<MockBehavior>>,
    control: Arc<Mutex<Control>>,
}

impl MockWorker {
    /// Worker answering according to `behavior`.
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            control: Arc::default(),
        }
    }

    /// Change behavior for subsequent commands and launches.
    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    /// Announce a port event. Held back until the worker is syncing.
    pub fn emit(&self, event: Event) {
        self.signal(WorkerSignal::Emit(event));
    }

    /// Close the worker's output as if the process died.
    pub fn crash(&self) {
        self.signal(WorkerSignal::Crash);
    }

    /// Command lines received so far, across all launches.
    pub fn received_commands(&self) -> Vec<String> {
        self.control.lock().received.clone()
    }

    /// Number of successful launches.
    pub fn launches(&self) -> usize {
        self.control.lock().launches
    }

    fn signal(&self, signal: WorkerSignal) {
        if let Some(signals) = &self.control.lock().signals {
            let _ = signals.send(signal);
        }
    }
}

#[async_trait]
impl WorkerLauncher for MockWorker {
    async fn launch(&self) -> io::Result<WorkerIo> {
        if self.behavior.lock().fail_launch {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "mock worker executable not found",
            ));
        }

        let (driver_input, worker_input) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_output, driver_output) = tokio::io::duplex(PIPE_CAPACITY);
        let (signals_tx, signals) = mpsc::unbounded_channel();
        {
            let mut control = self.control.lock();
            control.signals = Some(signals_tx);
            control.launches += 1;
        }

        let task = tokio::spawn(serve(
            self.clone(),
            BufReader::new(worker_input),
            worker_output,
            signals,
        ));

        Ok(WorkerIo {
            commands: Box::new(MockSink {
                input: LineWriter::new(driver_input),
                task,
            }),
            messages: Box::new(LineReader::new(BufReader::new(driver_output))),
        })
    }
}

struct MockSink {
    input: LineWriter<DuplexStream>,
    task: JoinHandle<()>,
}

#[async_trait]
impl CommandSink for MockSink {
    async fn send(&mut self, command: &Command) -> io::Result<()> {
        self.input.send(command).await
    }

    async fn shutdown(&mut self, grace: Duration) -> io::Result<Termination> {
        let _ = self.input.close().await;
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => Ok(Termination::Exited),
            Err(_) => {
                self.task.abort();
                Ok(Termination::Killed)
            }
        }
    }
}

async fn write_message(output: &mut DuplexStream, message: &Message) -> io::Result<()> {
    let line = message
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    output.write_all(line.as_bytes()).await?;
    output.flush().await
}

async fn write_garbage(output: &mut DuplexStream) -> io::Result<()> {
    output.write_all(b"{this is not a protocol message\n").await?;
    output.flush().await
}

async fn serve(
    worker: MockWorker,
    input: BufReader<DuplexStream>,
    mut output: DuplexStream,
    mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
) {
    let mut lines = input.lines();
    let mut syncing = false;
    let mut pending: Vec<Event> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                worker.control.lock().received.push(line.clone());
                let behavior = worker.behavior.lock().clone();

                let word = line.split_whitespace().next().unwrap_or_default();
                let result = match word {
                    "HELLO" => write_message(&mut output, &Message::hello(behavior.protocol_version)).await,
                    "START" if behavior.fail_start => {
                        write_message(&mut output, &Message::failure("start", "cannot start")).await
                    }
                    "START" => write_message(&mut output, &Message::ack("start")).await,
                    "START_SYNC" if behavior.fail_start_sync => {
                        write_message(&mut output, &Message::failure("start_sync", "cannot sync")).await
                    }
                    "START_SYNC" => {
                        syncing = true;
                        let mut events: Vec<Event> =
                            behavior.sync_ports.iter().cloned().map(Event::add).collect();
                        events.append(&mut pending);
                        let ack = Message::ack("start_sync");
                        let mut lines: Vec<Message> = events.iter().map(Message::event).collect();
                        if behavior.announce_before_ack {
                            lines.push(ack);
                        } else {
                            lines.insert(0, ack);
                        }
                        let mut written = Ok(());
                        for line in &lines {
                            if written.is_ok() {
                                written = write_message(&mut output, line).await;
                            }
                        }
                        written
                    }
                    "STOP" | "STOP_SYNC" => match behavior.stop {
                        StopBehavior::Acknowledge => {
                            syncing = false;
                            write_message(&mut output, &Message::ack(word.to_lowercase())).await
                        }
                        StopBehavior::Refuse => {
                            write_message(&mut output, &Message::failure(word.to_lowercase(), "cannot stop")).await
                        }
                        StopBehavior::Garble => write_garbage(&mut output).await,
                        StopBehavior::Misreply => write_message(&mut output, &Message::ack("list")).await,
                    },
                    "LIST" if behavior.silent_on_list => Ok(()),
                    "LIST" => {
                        let reply = match &behavior.list {
                            Ok(ports) => Message::port_list(ports.clone()),
                            Err(message) => Message::failure("list", message.clone()),
                        };
                        write_message(&mut output, &reply).await
                    }
                    "QUIT" => match behavior.quit {
                        QuitBehavior::Acknowledge => {
                            let _ = write_message(&mut output, &Message::ack("quit")).await;
                            break;
                        }
                        QuitBehavior::Refuse => {
                            write_message(&mut output, &Message::failure("quit", "refusing to quit")).await
                        }
                        QuitBehavior::Hang => std::future::pending().await,
                        QuitBehavior::Garble => write_garbage(&mut output).await,
                    },
                    _ => {
                        write_message(&mut output, &Message::failure("command_error", format!("unknown command {}", word))).await
                    }
                };
                if result.is_err() {
                    break;
                }
            }
            Some(signal) = signals.recv() => match signal {
                WorkerSignal::Emit(event) if syncing => {
                    if write_message(&mut output, &Message::event(&event)).await.is_err() {
                        break;
                    }
                }
                WorkerSignal::Emit(event) => pending.push(event),
                WorkerSignal::Crash => break,
            },
        }
    }
}
