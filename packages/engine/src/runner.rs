// ABOUTME: Action dispatch: executes file, modify, and shell payloads
// ABOUTME: Bridges the scheduler to the sandbox, file store, and shell pool

use crate::queue::{ActionExecutor, CancelCell};
use crate::types::{ActionPayload, ActionStatus, ActionTable};
use crate::ArtifactRegistry;
use async_trait::async_trait;
use atelier_core::{Alert, AlertHub, AlertKind, AlertSource, FileStore};
use atelier_sandbox::{SandboxError, SandboxSupervisor, ShellError, ShellPool, SupervisorError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the shared terminal that agent-issued shell actions run on.
pub const AGENT_TERMINAL: &str = "agent";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Action was aborted")]
    Cancelled,

    #[error("Command failed with exit code {exit_code}")]
    CommandFailed { exit_code: i32, output: String },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Shell error: {0}")]
    Shell(ShellError),
}

impl From<ShellError> for DispatchError {
    fn from(e: ShellError) -> Self {
        match e {
            ShellError::Cancelled => DispatchError::Cancelled,
            other => DispatchError::Shell(other),
        }
    }
}

/// Executes one action at a time on behalf of the scheduler.
///
/// Every outcome is absorbed here: success, failure, and abort all update
/// the action table and the artifact's running counter, and the chain moves
/// on. Failures surface to the operator as alerts, never as panics or
/// poisoned queues.
pub struct ActionDispatcher {
    table: Arc<ActionTable>,
    registry: Arc<ArtifactRegistry>,
    files: Arc<FileStore>,
    supervisor: Arc<SandboxSupervisor>,
    shells: Arc<ShellPool>,
    alerts: Arc<AlertHub>,
    cancel: Arc<CancelCell>,
}

impl ActionDispatcher {
    pub fn new(
        table: Arc<ActionTable>,
        registry: Arc<ArtifactRegistry>,
        files: Arc<FileStore>,
        supervisor: Arc<SandboxSupervisor>,
        shells: Arc<ShellPool>,
        alerts: Arc<AlertHub>,
        cancel: Arc<CancelCell>,
    ) -> Self {
        Self {
            table,
            registry,
            files,
            supervisor,
            shells,
            alerts,
            cancel,
        }
    }

    async fn dispatch(&self, payload: &ActionPayload) -> Result<(), DispatchError> {
        match payload {
            ActionPayload::File { path, content } => {
                // Surface the file being written in the editing surface,
                // then persist and confirm the cache.
                self.files.select(path).await;
                self.files.update(path, content.as_bytes().to_vec()).await;

                let handle = self.supervisor.handle().await?;
                handle
                    .write_file(Path::new(path), content.as_bytes())
                    .await?;
                self.files.confirm(path, content.as_bytes().to_vec()).await;
                debug!(%path, bytes = content.len(), "wrote file");
                Ok(())
            }
            ActionPayload::Modify { path, patch } => {
                let handle = self.supervisor.handle().await?;
                let result = handle.apply_patch(Path::new(path), patch).await?;
                self.files.select(path).await;
                self.files.confirm(path, result).await;
                debug!(%path, "applied patch");
                Ok(())
            }
            ActionPayload::Shell { command } => {
                let handle = self.supervisor.handle().await?;
                let session = self.shells.get_or_spawn(AGENT_TERMINAL, &handle).await?;
                let cancel = self.cancel.current().await;
                let output = session.run(command, &cancel).await?;
                if !output.success() {
                    return Err(DispatchError::CommandFailed {
                        exit_code: output.exit_code,
                        output: output.output,
                    });
                }
                info!(%command, "command completed");
                Ok(())
            }
        }
    }

    fn alert_for(&self, payload: &ActionPayload, error: &DispatchError) {
        let alert = match error {
            DispatchError::CommandFailed { exit_code, output } => Alert::new(
                AlertKind::BuildFailed,
                "Command failed",
                format!("exit code {exit_code}"),
                output.clone(),
                AlertSource::Shell,
            ),
            other => Alert::new(
                AlertKind::ActionFailed,
                format!("{} action failed", payload.kind()),
                "the action could not be applied to the sandbox",
                other.to_string(),
                AlertSource::Engine,
            ),
        };
        self.alerts.publish(alert);
    }
}

#[async_trait]
impl ActionExecutor for ActionDispatcher {
    async fn execute(&self, action_id: &str) {
        let Some(action) = self.table.get(action_id).await else {
            warn!(action_id, "scheduled action missing from table");
            return;
        };

        self.table.set_status(action_id, ActionStatus::Running).await;
        let cancel = self.cancel.current().await;

        // Shell payloads observe the token inside `run`; file and modify
        // payloads are raced against it here so an abort lands promptly
        // instead of waiting behind a pending sandbox handle.
        let result = tokio::select! {
            result = self.dispatch(&action.payload) => result,
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        };

        match &result {
            Ok(()) => {
                self.table.mark_executed(action_id).await;
                self.table.set_status(action_id, ActionStatus::Complete).await;
            }
            Err(DispatchError::Cancelled) => {
                // Never ran to completion, so `executed` stays false.
                self.table.set_status(action_id, ActionStatus::Aborted).await;
                info!(action_id, "action aborted");
            }
            Err(e) => {
                self.table.mark_executed(action_id).await;
                self.table.set_status(action_id, ActionStatus::Failed).await;
                warn!(action_id, "action failed: {e}");
                self.alert_for(&action.payload, e);
            }
        }

        if let Some(artifact) = self
            .registry
            .get(&action.message_id, &action.artifact_id)
            .await
        {
            artifact.runner().mark_finished().await;
        }
    }
}

/// Rate limiter for streaming deliveries: at most one accepted sample per
/// key per window. The final (non-streaming) delivery bypasses sampling and
/// calls `forget` so a reused key starts fresh.
pub struct StreamSampler {
    window: std::time::Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl StreamSampler {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub async fn should_sample(&self, key: &str) -> bool {
        let mut last = self.last.lock().await;
        let now = Instant::now();
        match last.get(key) {
            Some(previous) if now.duration_since(*previous) < self.window => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    pub async fn forget(&self, key: &str) {
        self.last.lock().await.remove(key);
    }
}
