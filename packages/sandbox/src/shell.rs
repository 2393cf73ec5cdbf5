// ABOUTME: Shell command serialization over persistent sandbox shell sessions
// ABOUTME: One command at a time per session, completion detected via sentinel marker

use crate::handle::{SandboxError, SandboxHandle, ShellIo};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Command was cancelled")]
    Cancelled,

    #[error("Shell session closed")]
    SessionClosed,

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

pub type Result<T> = std::result::Result<T, ShellError>;

/// Fully flushed output of one serialized shell command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
    pub truncated: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

struct OutputState {
    rx: mpsc::UnboundedReceiver<String>,
    /// Marker of a command whose wait was cancelled. The shell is still
    /// executing that command; everything up to and including this marker
    /// belongs to it and must be consumed before the next command runs.
    stale_marker: Option<String>,
}

/// One persistent shell process with strictly serialized command execution.
///
/// Callers may invoke `run` concurrently; the per-session lock queues them
/// FIFO so at most one command executes at a time, and a resolved `run`
/// means the command finished and its output is fully flushed (the shell
/// echoed the completion marker carrying the exit code).
pub struct ShellSession {
    name: String,
    io: Arc<dyn ShellIo>,
    output: Mutex<OutputState>,
    exec_lock: Mutex<()>,
    marker_prefix: String,
    max_output_bytes: usize,
}

impl ShellSession {
    pub fn new(
        name: impl Into<String>,
        io: Arc<dyn ShellIo>,
        output: mpsc::UnboundedReceiver<String>,
        marker_prefix: impl Into<String>,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            name: name.into(),
            io,
            output: Mutex::new(OutputState {
                rx: output,
                stale_marker: None,
            }),
            exec_lock: Mutex::new(()),
            marker_prefix: marker_prefix.into(),
            max_output_bytes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        Ok(self.io.resize(cols, rows).await?)
    }

    /// Run a command and wait for its completion marker.
    ///
    /// Cancellation is checked before the command is issued and while waiting
    /// for the marker. A cancelled wait leaves the session usable: the
    /// cancelled command's marker is remembered, and the next `run` consumes
    /// everything up to it before issuing its own command, so late-arriving
    /// output can never bleed into another command's capture.
    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let _guard = tokio::select! {
            guard = self.exec_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(ShellError::Cancelled),
        };
        if cancel.is_cancelled() {
            return Err(ShellError::Cancelled);
        }

        let mut state = self.output.lock().await;

        // A previously cancelled command is still running in the shell;
        // its output (terminated by its marker) is owed before ours starts.
        if let Some(stale) = state.stale_marker.clone() {
            let stale_lead = format!("{stale}:");
            loop {
                let line = tokio::select! {
                    line = state.rx.recv() => line,
                    _ = cancel.cancelled() => return Err(ShellError::Cancelled),
                };
                let Some(line) = line else {
                    return Err(ShellError::SessionClosed);
                };
                if line.starts_with(&stale_lead) {
                    break;
                }
            }
            state.stale_marker = None;
        }

        // Drop any residual lines that slipped in after the stale marker.
        while state.rx.try_recv().is_ok() {}

        let nonce = Uuid::new_v4().simple().to_string();
        let marker = format!("{}_{}", self.marker_prefix, &nonce[..12]);

        debug!(session = %self.name, %command, "running shell command");
        self.io.write_line(command).await?;
        self.io.write_line(&format!("echo \"{marker}:$?\"")).await?;

        let marker_lead = format!("{marker}:");
        let mut output = String::new();
        let mut truncated = false;

        loop {
            let received = tokio::select! {
                line = state.rx.recv() => Some(line),
                _ = cancel.cancelled() => None,
            };
            let line = match received {
                None => {
                    state.stale_marker = Some(marker);
                    return Err(ShellError::Cancelled);
                }
                Some(None) => return Err(ShellError::SessionClosed),
                Some(Some(line)) => line,
            };

            if let Some(code) = line.strip_prefix(&marker_lead) {
                let exit_code = code.trim().parse::<i32>().unwrap_or(-1);
                return Ok(CommandOutput {
                    exit_code,
                    output,
                    truncated,
                });
            }

            if output.len() + line.len() < self.max_output_bytes {
                output.push_str(&line);
                output.push('\n');
            } else if !truncated {
                warn!(session = %self.name, "shell output truncated at {} bytes", self.max_output_bytes);
                truncated = true;
            }
        }
    }

    /// Resolve once every queued command on this session has finished.
    pub async fn wait_idle(&self) {
        let _guard = self.exec_lock.lock().await;
    }

    pub async fn detach(&self) -> Result<()> {
        Ok(self.io.detach().await?)
    }
}

/// Registry of named shell sessions against the current sandbox handle.
///
/// The agent's actions share one logical terminal ("agent"); deploy and
/// setup scripts get their own. `detach_all` is called by the supervisor
/// before swapping the handle.
pub struct ShellPool {
    marker_prefix: String,
    max_output_bytes: usize,
    sessions: Mutex<HashMap<String, Arc<ShellSession>>>,
}

impl ShellPool {
    pub fn new(marker_prefix: impl Into<String>, max_output_bytes: usize) -> Self {
        Self {
            marker_prefix: marker_prefix.into(),
            max_output_bytes,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the session named `name`, spawning it on the given handle if it
    /// does not exist yet.
    pub async fn get_or_spawn(
        &self,
        name: &str,
        handle: &Arc<dyn SandboxHandle>,
    ) -> Result<Arc<ShellSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(name) {
            return Ok(session.clone());
        }

        let (io, output) = handle.spawn_shell().await?;
        let session = Arc::new(ShellSession::new(
            name,
            io,
            output,
            self.marker_prefix.clone(),
            self.max_output_bytes,
        ));
        sessions.insert(name.to_string(), session.clone());
        Ok(session)
    }

    /// Detach every session. Sessions spawned afterwards run on whichever
    /// handle the caller passes next.
    pub async fn detach_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (name, session) in sessions.drain() {
            if let Err(e) = session.detach().await {
                warn!(session = %name, "failed to detach shell session: {e}");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
