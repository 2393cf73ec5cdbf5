// ABOUTME: Artifact registry and per-artifact running-action accounting
// ABOUTME: Backs the deferred-close contract: close waits for in-flight actions

use crate::types::{AddArtifactRequest, ArtifactKind, ArtifactUpdate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::debug;

#[derive(Default)]
struct RunnerInner {
    running: usize,
    listeners: Vec<oneshot::Sender<()>>,
}

/// Counts the actions of one artifact that are started but not yet finished.
///
/// Close requests arriving while actions are in flight park a listener here;
/// every listener fires when the count reaches zero. Listeners accumulate in
/// a list, so a second close request never silently replaces the first.
#[derive(Default)]
pub struct ActionRunner {
    inner: Mutex<RunnerInner>,
}

impl ActionRunner {
    pub async fn mark_started(&self) {
        self.inner.lock().await.running += 1;
    }

    pub async fn mark_finished(&self) {
        let mut inner = self.inner.lock().await;
        inner.running = inner.running.saturating_sub(1);
        if inner.running == 0 {
            for listener in inner.listeners.drain(..) {
                let _ = listener.send(());
            }
        }
    }

    pub async fn is_idle(&self) -> bool {
        self.inner.lock().await.running == 0
    }

    /// None when already idle; otherwise a receiver that fires on the next
    /// transition to zero running actions.
    pub async fn on_idle(&self) -> Option<oneshot::Receiver<()>> {
        let mut inner = self.inner.lock().await;
        if inner.running == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.listeners.push(tx);
        Some(rx)
    }
}

/// One unit of agent work (a file bundle or a shell step) under a message.
pub struct Artifact {
    message_id: String,
    artifact_id: String,
    title: RwLock<String>,
    kind: ArtifactKind,
    closed: AtomicBool,
    runner: Arc<ActionRunner>,
}

impl Artifact {
    fn new(request: AddArtifactRequest) -> Self {
        Self {
            message_id: request.message_id,
            artifact_id: request.artifact_id,
            title: RwLock::new(request.title),
            kind: request.kind,
            closed: AtomicBool::new(false),
            runner: Arc::new(ActionRunner::default()),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub async fn title(&self) -> String {
        self.title.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed. Returns true only for the transition, so the caller can
    /// make close-side effects (idle events) fire exactly once.
    pub fn set_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn runner(&self) -> &Arc<ActionRunner> {
        &self.runner
    }
}

/// All artifacts the engine knows about, keyed by (message id, artifact id).
///
/// Streaming re-delivery of an `addArtifact` never recreates an existing
/// entry; the first registration wins and later ones get the same `Arc`.
#[derive(Default)]
pub struct ArtifactRegistry {
    artifacts: RwLock<HashMap<(String, String), Arc<Artifact>>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, request: AddArtifactRequest) -> Arc<Artifact> {
        let key = (request.message_id.clone(), request.artifact_id.clone());
        let mut artifacts = self.artifacts.write().await;
        if let Some(existing) = artifacts.get(&key) {
            return existing.clone();
        }
        debug!(message_id = %key.0, artifact_id = %key.1, "registered artifact");
        let artifact = Arc::new(Artifact::new(request));
        artifacts.insert(key, artifact.clone());
        artifact
    }

    pub async fn get(&self, message_id: &str, artifact_id: &str) -> Option<Arc<Artifact>> {
        self.artifacts
            .read()
            .await
            .get(&(message_id.to_string(), artifact_id.to_string()))
            .cloned()
    }

    /// Apply a partial update. Only the title is mutated here; the closed
    /// flag routes through the deferred-close path instead.
    pub async fn update(&self, message_id: &str, artifact_id: &str, update: &ArtifactUpdate) {
        if let Some(artifact) = self.get(message_id, artifact_id).await {
            if let Some(title) = &update.title {
                *artifact.title.write().await = title.clone();
            }
        }
    }

    /// Whether every artifact of this message is closed. Vacuously true for
    /// a message with no artifacts.
    pub async fn all_closed(&self, message_id: &str) -> bool {
        self.artifacts
            .read()
            .await
            .iter()
            .filter(|((mid, _), _)| mid == message_id)
            .all(|(_, artifact)| artifact.is_closed())
    }

    pub async fn for_message(&self, message_id: &str) -> Vec<Arc<Artifact>> {
        self.artifacts
            .read()
            .await
            .iter()
            .filter(|((mid, _), _)| mid == message_id)
            .map(|(_, artifact)| artifact.clone())
            .collect()
    }

    pub async fn open_count(&self, message_id: &str) -> usize {
        self.artifacts
            .read()
            .await
            .iter()
            .filter(|((mid, _), artifact)| mid == message_id && !artifact.is_closed())
            .count()
    }
}
