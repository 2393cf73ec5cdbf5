// ABOUTME: Action execution engine: ordered queues, artifact lifecycle, idle tracking
// ABOUTME: The Workbench facade wires the scheduler, dispatcher, and sandbox supervisor

pub mod artifacts;
pub mod events;
pub mod idle;
pub mod queue;
pub mod runner;
pub mod types;

pub use artifacts::{ActionRunner, Artifact, ArtifactRegistry};
pub use idle::{CloseCallback, IdleTracker};
pub use runner::{ActionDispatcher, DispatchError, StreamSampler, AGENT_TERMINAL};
pub use types::{
    Action, ActionPayload, ActionStatus, ActionTable, AddActionRequest, AddArtifactRequest,
    ArtifactKind, ArtifactUpdate,
};

use crate::events::EngineEvent;
use crate::queue::{ActionScheduler, CancelCell};
use atelier_core::{Alert, AlertHub, ConnectionState, EngineSettings, FileStore};
use atelier_sandbox::{
    CommandOutput, SandboxError, SandboxHandle, SandboxProvider, SandboxSupervisor, ShellError,
    ShellPool, SupervisorError,
};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown artifact {artifact_id} for message {message_id}")]
    UnknownArtifact {
        message_id: String,
        artifact_id: String,
    },

    #[error("Message {message_id} did not go idle within {elapsed_ms}ms")]
    IdleTimeout { message_id: String, elapsed_ms: u64 },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Facade over the whole engine.
///
/// One workbench per conversation: it owns the sandbox supervisor, the shell
/// pool, the in-memory file mirror, the action table and scheduler, and the
/// idle tracker. All entry points are safe to call concurrently; ordering
/// guarantees are per message id.
pub struct Workbench {
    settings: EngineSettings,
    files: Arc<FileStore>,
    alerts: Arc<AlertHub>,
    supervisor: Arc<SandboxSupervisor>,
    shells: Arc<ShellPool>,
    table: Arc<ActionTable>,
    registry: Arc<ArtifactRegistry>,
    scheduler: Arc<ActionScheduler>,
    idle: IdleTracker,
    cancel: Arc<CancelCell>,
    sampler: StreamSampler,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Workbench {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: EngineSettings) -> Arc<Self> {
        let files = Arc::new(FileStore::new());
        let alerts = Arc::new(AlertHub::default());
        let shells = Arc::new(ShellPool::new(
            settings.shell_marker_prefix.clone(),
            settings.max_shell_output_bytes,
        ));
        let supervisor = Arc::new(SandboxSupervisor::new(
            provider,
            files.clone(),
            alerts.clone(),
            shells.clone(),
        ));
        let table = Arc::new(ActionTable::new());
        let registry = Arc::new(ArtifactRegistry::new());
        let cancel = Arc::new(CancelCell::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(ActionDispatcher::new(
            table.clone(),
            registry.clone(),
            files.clone(),
            supervisor.clone(),
            shells.clone(),
            alerts.clone(),
            cancel.clone(),
        ));
        let scheduler = ActionScheduler::new(dispatcher, events_tx.clone());

        let workbench = Arc::new(Self {
            sampler: StreamSampler::new(settings.streaming_sample_window()),
            settings,
            files,
            alerts,
            supervisor,
            shells,
            table,
            registry,
            scheduler,
            idle: IdleTracker::new(),
            cancel,
            events: events_tx,
        });

        tokio::spawn(Self::coordinate(Arc::downgrade(&workbench), events_rx));
        workbench
    }

    /// Consumes the internal event bus and fires idle notifications once a
    /// message's artifacts are all closed and its chain has drained.
    async fn coordinate(
        workbench: Weak<Workbench>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(workbench) = workbench.upgrade() else {
                break;
            };
            let message_id = event.message_id().to_string();
            if workbench.is_idle(&message_id).await {
                workbench.idle.fire(&message_id).await;
            }
        }
    }

    // ---- sandbox lifecycle -------------------------------------------------

    pub async fn initialize(&self, credential: &str) -> Result<Arc<dyn SandboxHandle>> {
        Ok(self.supervisor.initialize(credential).await?)
    }

    /// Tear down and recreate the sandbox, remounting the in-memory file
    /// tree onto the fresh instance.
    pub async fn reinitialize(&self, credential: &str) -> Result<Arc<dyn SandboxHandle>> {
        Ok(self.supervisor.reinitialize(credential).await?)
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.connection()
    }

    // ---- artifacts ---------------------------------------------------------

    pub async fn add_artifact(&self, request: AddArtifactRequest) -> Arc<Artifact> {
        self.registry.add(request).await
    }

    /// Apply a partial artifact update. A `closed: true` routes through the
    /// deferred-close path; titles apply immediately.
    pub async fn update_artifact(
        self: &Arc<Self>,
        message_id: &str,
        artifact_id: &str,
        update: ArtifactUpdate,
    ) -> Result<()> {
        if self.registry.get(message_id, artifact_id).await.is_none() {
            return Err(EngineError::UnknownArtifact {
                message_id: message_id.to_string(),
                artifact_id: artifact_id.to_string(),
            });
        }
        self.registry.update(message_id, artifact_id, &update).await;
        if update.closed == Some(true) {
            self.close_artifact(message_id, artifact_id).await?;
        }
        Ok(())
    }

    /// Request an artifact close.
    ///
    /// If actions of this artifact are still running or queued, the close is
    /// deferred until the last one finishes; the request resolves
    /// immediately either way. Closing twice is a no-op.
    pub async fn close_artifact(
        self: &Arc<Self>,
        message_id: &str,
        artifact_id: &str,
    ) -> Result<()> {
        let artifact = self.registry.get(message_id, artifact_id).await.ok_or_else(|| {
            EngineError::UnknownArtifact {
                message_id: message_id.to_string(),
                artifact_id: artifact_id.to_string(),
            }
        })?;
        if artifact.is_closed() {
            return Ok(());
        }

        match artifact.runner().on_idle().await {
            None => self.finalize_close(&artifact),
            Some(rx) => {
                debug!(
                    message_id,
                    artifact_id, "deferring artifact close until actions finish"
                );
                let workbench = self.clone();
                tokio::spawn(async move {
                    let mut rx = rx;
                    loop {
                        let _ = rx.await;
                        // An action may have started between the notification
                        // and now; wait for the next settle if so.
                        match artifact.runner().on_idle().await {
                            None => break,
                            Some(next) => rx = next,
                        }
                    }
                    workbench.finalize_close(&artifact);
                });
            }
        }
        Ok(())
    }

    fn finalize_close(&self, artifact: &Arc<Artifact>) {
        if artifact.set_closed() {
            info!(
                message_id = artifact.message_id(),
                artifact_id = artifact.artifact_id(),
                "artifact closed"
            );
            let _ = self
                .events
                .send(EngineEvent::ArtifactClosed(artifact.message_id().to_string()));
        }
    }

    // ---- actions -----------------------------------------------------------

    /// Register an action and append it to its message's execution chain.
    /// Re-delivery of a known action id is a no-op.
    pub async fn add_action(&self, request: AddActionRequest) -> Result<()> {
        let artifact = self
            .registry
            .get(&request.message_id, &request.artifact_id)
            .await
            .ok_or_else(|| EngineError::UnknownArtifact {
                message_id: request.message_id.clone(),
                artifact_id: request.artifact_id.clone(),
            })?;

        let action = Action::new(
            request.action_id.clone(),
            request.artifact_id.clone(),
            request.message_id.clone(),
            request.payload,
        );
        if !self.table.insert(action).await {
            return Ok(());
        }

        artifact.runner().mark_started().await;
        self.scheduler
            .enqueue(&request.message_id, &request.action_id)
            .await;
        Ok(())
    }

    /// Content delivery for an action.
    ///
    /// Streaming deliveries refresh the stored payload and, for file
    /// payloads, surface a sampled live preview in the file store. The final
    /// delivery always lands: it refreshes the payload of a known unexecuted
    /// action, or registers and enqueues the action if it was never added.
    pub async fn run_action(&self, request: AddActionRequest, is_streaming: bool) -> Result<()> {
        if is_streaming {
            self.table
                .update_payload(&request.action_id, request.payload.clone())
                .await;
            if let ActionPayload::File { path, content } = &request.payload {
                if self.sampler.should_sample(&request.action_id).await {
                    self.files.select(path).await;
                    self.files.update(path, content.as_bytes().to_vec()).await;
                }
            }
            return Ok(());
        }

        self.sampler.forget(&request.action_id).await;
        match self.table.get(&request.action_id).await {
            Some(action) if !action.executed => {
                self.table
                    .update_payload(&request.action_id, request.payload)
                    .await;
                Ok(())
            }
            Some(_) => Ok(()),
            None => self.add_action(request).await,
        }
    }

    /// Cancel the in-flight action and drop every queued one.
    ///
    /// Cleared actions are marked aborted without executing; a message that
    /// receives new actions afterwards starts a fresh chain immediately.
    pub async fn abort_all_actions(&self) {
        let stale = self.cancel.reset().await;
        stale.cancel();

        let cleared = self.scheduler.clear().await;
        info!(queued = cleared.len(), "aborting all actions");
        for action_id in cleared {
            self.table
                .set_status(&action_id, ActionStatus::Aborted)
                .await;
            if let Some(action) = self.table.get(&action_id).await {
                if let Some(artifact) = self
                    .registry
                    .get(&action.message_id, &action.artifact_id)
                    .await
                {
                    artifact.runner().mark_finished().await;
                }
            }
        }
    }

    pub async fn action_status(&self, action_id: &str) -> Option<ActionStatus> {
        self.table.status(action_id).await
    }

    pub async fn message_action_statuses(&self, message_id: &str) -> Vec<(String, ActionStatus)> {
        self.table.statuses_for_message(message_id).await
    }

    // ---- idle tracking -----------------------------------------------------

    /// Whether every artifact of the message is closed and no action chain
    /// remains. Vacuously true for an unknown message id.
    pub async fn is_idle(&self, message_id: &str) -> bool {
        self.registry.all_closed(message_id).await && !self.scheduler.has_chain(message_id).await
    }

    /// Run `callback` once the message settles; immediately if it already has.
    pub async fn on_message_close(&self, message_id: &str, callback: CloseCallback) {
        // Register first, then check: if the message settled in between, the
        // coordinator's fire already happened and would never see this
        // callback, so fire again (firing an idle message is a no-op once
        // its registrations are drained).
        self.idle.register_callback(message_id, callback).await;
        if self.is_idle(message_id).await {
            self.idle.fire(message_id).await;
        }
    }

    /// Resolve once the message is idle.
    ///
    /// Returns immediately when it already is. Otherwise waits on the idle
    /// notification, with a polling safety net in case a notification was
    /// missed, bounded by `timeout` (engine default when `None`).
    pub async fn wait_for_message_idle(
        &self,
        message_id: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.is_idle(message_id).await {
            return Ok(());
        }

        let timeout = timeout.unwrap_or_else(|| self.settings.idle_timeout());
        let started = Instant::now();
        let mut rx = self.idle.register_waiter(message_id).await;

        let settled = async {
            let mut poll = tokio::time::interval(self.settings.idle_poll_interval());
            loop {
                tokio::select! {
                    _ = &mut rx => return,
                    _ = poll.tick() => {
                        if self.is_idle(message_id).await {
                            return;
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, settled).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.idle.prune(message_id).await;
                Err(EngineError::IdleTimeout {
                    message_id: message_id.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    // ---- scripts and surfaces ----------------------------------------------

    /// Run a command on a named terminal outside the agent's action stream
    /// (setup and deploy scripts). Serialized against whatever else runs on
    /// that terminal; aborts cancel it like any other command.
    pub async fn run_script(&self, terminal: &str, command: &str) -> Result<CommandOutput> {
        let handle = self.supervisor.handle().await?;
        let session = self.shells.get_or_spawn(terminal, &handle).await?;
        let cancel = self.cancel.current().await;
        Ok(session.run(command, &cancel).await?)
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    pub fn supervisor(&self) -> &Arc<SandboxSupervisor> {
        &self.supervisor
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}
