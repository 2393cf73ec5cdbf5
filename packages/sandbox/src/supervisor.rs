// ABOUTME: Sandbox lifecycle supervision: creation, connection monitoring, recreation
// ABOUTME: Publishes the authoritative handle and migrates file state across recreations

use crate::handle::{SandboxError, SandboxEvent, SandboxHandle, SandboxProvider};
use crate::shell::ShellPool;
use atelier_core::{Alert, AlertHub, AlertKind, AlertSource, ConnectionState, FileStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Sandbox creation failed: {0}")]
    Creation(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Supervisor shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Idle,
    Initializing,
    Reinitializing,
}

/// Owns the lifecycle of the sandbox handle.
///
/// Exactly one authoritative handle exists at a time, published through a
/// watch channel so consumers that asked for it before it existed resolve
/// when it appears. Recreation bumps a generation counter, detaches shell
/// sessions, and remounts the in-memory file tree onto the new instance.
pub struct SandboxSupervisor {
    provider: Arc<dyn SandboxProvider>,
    files: Arc<FileStore>,
    alerts: Arc<AlertHub>,
    shells: Arc<ShellPool>,
    state: Mutex<LifecycleState>,
    attempt_done: Notify,
    last_error: Mutex<Option<String>>,
    handle_tx: watch::Sender<Option<Arc<dyn SandboxHandle>>>,
    connection_tx: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    observer_cancel: Mutex<Option<CancellationToken>>,
}

impl SandboxSupervisor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        files: Arc<FileStore>,
        alerts: Arc<AlertHub>,
        shells: Arc<ShellPool>,
    ) -> Self {
        let (handle_tx, _) = watch::channel(None);
        let (connection_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            provider,
            files,
            alerts,
            shells,
            state: Mutex::new(LifecycleState::Idle),
            attempt_done: Notify::new(),
            last_error: Mutex::new(None),
            handle_tx,
            connection_tx,
            generation: AtomicU64::new(0),
            observer_cancel: Mutex::new(None),
        }
    }

    /// The currently published handle, if any.
    pub fn try_handle(&self) -> Option<Arc<dyn SandboxHandle>> {
        self.handle_tx.borrow().clone()
    }

    /// Wait for the authoritative handle. Pending until a successful
    /// `initialize` (or `reinitialize`) publishes one.
    pub async fn handle(&self) -> Result<Arc<dyn SandboxHandle>> {
        let mut rx = self.handle_tx.subscribe();
        loop {
            if let Some(handle) = rx.borrow_and_update().clone() {
                return Ok(handle);
            }
            if rx.changed().await.is_err() {
                return Err(SupervisorError::ShutDown);
            }
        }
    }

    /// Monotonic counter bumped on every recreation; consumers compare it to
    /// detect that a handle they captured earlier is stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    /// Create the sandbox and publish its handle.
    ///
    /// Re-entrant calls while a (re)initialization is in flight join that
    /// attempt instead of starting a duplicate.
    pub async fn initialize(&self, credential: &str) -> Result<Arc<dyn SandboxHandle>> {
        {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Idle {
                drop(state);
                return self.join_inflight().await;
            }
            *state = LifecycleState::Initializing;
        }

        let result = self.create_and_publish(credential).await;

        *self.state.lock().await = LifecycleState::Idle;
        self.attempt_done.notify_waiters();
        result
    }

    /// Tear down and recreate the sandbox, migrating in-memory file state.
    ///
    /// If the handle was never published, this is equivalent to
    /// `initialize`. Remount failures are logged per path and never fatal:
    /// the new handle stays usable even when the migration is partial.
    pub async fn reinitialize(&self, credential: &str) -> Result<Arc<dyn SandboxHandle>> {
        if self.try_handle().is_none() {
            return self.initialize(credential).await;
        }

        {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Idle {
                drop(state);
                return self.join_inflight().await;
            }
            *state = LifecycleState::Reinitializing;
        }

        info!("reinitializing sandbox");
        self.shells.detach_all().await;
        self.handle_tx.send_replace(None);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let result = self.create_and_publish(credential).await;
        if let Ok(handle) = &result {
            self.remount(handle).await;
        }

        *self.state.lock().await = LifecycleState::Idle;
        self.attempt_done.notify_waiters();
        result
    }

    async fn join_inflight(&self) -> Result<Arc<dyn SandboxHandle>> {
        loop {
            let notified = self.attempt_done.notified();
            if *self.state.lock().await == LifecycleState::Idle {
                break;
            }
            notified.await;
        }
        match self.try_handle() {
            Some(handle) => Ok(handle),
            None => {
                let message = self
                    .last_error
                    .lock()
                    .await
                    .clone()
                    .unwrap_or_else(|| "initialization did not complete".to_string());
                Err(SupervisorError::Creation(message))
            }
        }
    }

    async fn create_and_publish(&self, credential: &str) -> Result<Arc<dyn SandboxHandle>> {
        // send_replace throughout: a watch sender with no live receivers
        // drops plain sends, and consumers may subscribe only after
        // publication.
        self.connection_tx.send_replace(ConnectionState::Connecting);

        let handle = match self.provider.create(credential).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("sandbox creation failed: {e}");
                *self.last_error.lock().await = Some(e.to_string());
                self.connection_tx.send_replace(ConnectionState::Failed);
                self.alerts.publish(Alert::new(
                    AlertKind::InitializationFailed,
                    "Sandbox unavailable",
                    "the sandbox runtime could not be created",
                    e.to_string(),
                    AlertSource::Supervisor,
                ));
                return Err(SupervisorError::Creation(e.to_string()));
            }
        };

        let observer = self.spawn_observer(&handle);
        {
            let mut slot = self.observer_cancel.lock().await;
            if let Some(previous) = slot.replace(observer) {
                previous.cancel();
            }
        }

        *self.last_error.lock().await = None;
        self.handle_tx.send_replace(Some(handle.clone()));
        self.connection_tx.send_replace(ConnectionState::Connected);
        self.alerts.connection_restored();
        info!(workdir = %handle.workdir().display(), "sandbox ready");
        Ok(handle)
    }

    fn spawn_observer(&self, handle: &Arc<dyn SandboxHandle>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut events = handle.events();
        let alerts = self.alerts.clone();
        let connection_tx = self.connection_tx.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SandboxEvent::ConnectionState(state)) => {
                        let current = *connection_tx.borrow();
                        if !current.can_transition_to(state) {
                            warn!(%current, %state, "ignoring illegal connection transition");
                            continue;
                        }
                        connection_tx.send_replace(state);
                        match state {
                            ConnectionState::Connected => alerts.connection_restored(),
                            ConnectionState::Reconnecting => {
                                alerts.publish(Alert::new(
                                    AlertKind::Reconnecting,
                                    "Reconnecting",
                                    "sandbox connection dropped, reconnecting",
                                    "",
                                    AlertSource::Supervisor,
                                ));
                            }
                            ConnectionState::Disconnected | ConnectionState::Failed => {
                                alerts.publish(Alert::new(
                                    AlertKind::ConnectionLost,
                                    "Connection lost",
                                    "lost connection to the sandbox runtime",
                                    "",
                                    AlertSource::Supervisor,
                                ));
                            }
                            ConnectionState::Connecting => {}
                        }
                    }
                    Ok(SandboxEvent::PreviewMessage(message)) => {
                        alerts.publish(Alert::new(
                            AlertKind::RuntimeError,
                            "Runtime error",
                            "error reported by the preview frame",
                            message,
                            AlertSource::Sandbox,
                        ));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sandbox event observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        cancel
    }

    async fn remount(&self, handle: &Arc<dyn SandboxHandle>) {
        let snapshot = self.files.snapshot().await;
        let mut mounted = 0usize;
        for (path, content) in &snapshot.files {
            match handle.write_file(path, content).await {
                Ok(()) => mounted += 1,
                Err(e) => warn!(path = %path.display(), "remount failed: {e}"),
            }
        }
        info!(mounted, total = snapshot.len(), "remounted file tree");
    }
}
