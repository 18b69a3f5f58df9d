//! Worker transport abstractions.
//!
//! The driver never talks to a process directly. It receives a
//! [`WorkerIo`] from a [`WorkerLauncher`] and uses two narrow capabilities:
//!
//! - [`CommandSink`]: write one command, or shut the worker down
//! - [`MessageSource`]: read the next decoded message
//!
//! [`LineWriter`] and [`LineReader`] implement the line framing on top of any
//! tokio byte stream, so the same code drives a child process
//! ([`crate::process::ProcessLauncher`]) or an in-memory duplex pipe
//! ([`crate::mock::MockWorker`]).

use async_trait::async_trait;
use discovery_core::protocol::{Command, Message};
use discovery_core::ProtocolError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

/// Both halves of a freshly launched worker.
pub struct WorkerIo {
    /// Write side (worker stdin)
    pub commands: Box<dyn CommandSink>,
    /// Read side (worker stdout)
    pub messages: Box<dyn MessageSource>,
}

/// Creates worker connections.
///
/// Called once per `run`. Every call must produce an independent worker.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a new worker and hand back its I/O.
    async fn launch(&self) -> io::Result<WorkerIo>;
}

/// How a worker ended after [`CommandSink::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited by itself within the grace period
    Exited,
    /// Had to be killed
    Killed,
}

/// Write half of a worker connection.
#[async_trait]
pub trait CommandSink: Send {
    /// Write one command line.
    async fn send(&mut self, command: &Command) -> io::Result<()>;

    /// Close the worker's input and wait up to `grace` for it to exit,
    /// terminating it forcibly afterwards.
    async fn shutdown(&mut self, grace: Duration) -> io::Result<Termination>;
}

/// Read half of a worker connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Next message, or `None` once the worker's output is closed.
    async fn receive(&mut self) -> Option<Result<Message, ProtocolError>>;
}

/// Newline framed command writer.
pub struct LineWriter<W> {
    writer: Option<W>,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    /// Writer over `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Flush and close the underlying stream. Further sends fail.
    pub async fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> CommandSink for LineWriter<W> {
    async fn send(&mut self, command: &Command) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker input closed"))?;
        writer.write_all(command.encode().as_bytes()).await?;
        writer.flush().await
    }

    async fn shutdown(&mut self, _grace: Duration) -> io::Result<Termination> {
        self.close().await?;
        Ok(Termination::Exited)
    }
}

/// Newline framed JSON message reader.
///
/// Blank lines are skipped. A read error is reported once, after which the
/// source behaves as closed.
pub struct LineReader<R> {
    lines: Lines<R>,
    failed: bool,
}

impl<R: AsyncBufRead + Unpin + Send> LineReader<R> {
    /// Reader over `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            failed: false,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> MessageSource for LineReader<R> {
    async fn receive(&mut self) -> Option<Result<Message, ProtocolError>> {
        if self.failed {
            return None;
        }
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(Message::decode(&line)),
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(ProtocolError::Transport(e)));
                }
            }
        }
    }
}
