//! Child process transport for discovery workers.
//!
//! The worker executable is spawned with piped stdin/stdout/stderr. Commands
//! go to stdin, protocol messages come from stdout and every stderr line is
//! forwarded to `tracing` at debug level, tagged with the discovery id.

use crate::transport::{CommandSink, LineReader, LineWriter, Termination, WorkerIo, WorkerLauncher};
use async_trait::async_trait;
use discovery_core::protocol::Command as WorkerCommand;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tracing::{debug, warn};

/// Launches a worker executable from disk.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    id: String,
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launcher for `program`; `id` is only used to tag logs.
    pub fn new(id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments passed to every spawned worker.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Executable spawned on every launch.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to the executable.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> io::Result<WorkerIo> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("cannot spawn {}: {}", self.program.display(), e),
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.id.clone(), stderr));
        }

        debug!(discovery = %self.id, pid = ?child.id(), program = %self.program.display(), "spawned worker process");

        Ok(WorkerIo {
            commands: Box::new(ProcessSink {
                id: self.id.clone(),
                input: LineWriter::new(stdin),
                child,
            }),
            messages: Box::new(LineReader::new(BufReader::new(stdout))),
        })
    }
}

struct ProcessSink {
    id: String,
    input: LineWriter<ChildStdin>,
    child: Child,
}

#[async_trait]
impl CommandSink for ProcessSink {
    async fn send(&mut self, command: &WorkerCommand) -> io::Result<()> {
        self.input.send(command).await
    }

    async fn shutdown(&mut self, grace: Duration) -> io::Result<Termination> {
        // Broken pipe here just means the worker is already gone
        if let Err(e) = self.input.close().await {
            debug!(discovery = %self.id, error = %e, "closing worker stdin");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(discovery = %self.id, %status, "worker process exited");
                Ok(Termination::Exited)
            }
            Err(_) => {
                warn!(discovery = %self.id, ?grace, "worker process still alive, killing it");
                self.child.kill().await?;
                Ok(Termination::Killed)
            }
        }
    }
}

async fn forward_stderr(id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "discovery_worker", discovery = %id, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(discovery = %id, error = %e, "stopped reading worker stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_keeps_command_line() {
        let launcher = ProcessLauncher::new("serial", "/opt/discovery/serial-discovery")
            .with_args(["-v", "--interval=1s"]);
        assert_eq!(launcher.program(), Path::new("/opt/discovery/serial-discovery"));
        assert_eq!(launcher.args(), ["-v", "--interval=1s"]);
    }

    #[tokio::test]
    async fn test_missing_executable_names_program() {
        let launcher = ProcessLauncher::new("ghost", "/nonexistent/discovery-worker");
        let err = launcher.launch().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("/nonexistent/discovery-worker"));
    }
}
