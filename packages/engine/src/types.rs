// ABOUTME: Action and artifact data model for the execution engine
// ABOUTME: Status enums, request payloads, and the in-memory action table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Discriminated payload of a single agent-issued effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionPayload {
    /// Write a file in full.
    File { path: String, content: String },
    /// Patch a file in place; `patch` is the JSON patch-op contract of the
    /// sandbox capability layer.
    Modify { path: String, patch: String },
    /// Run a shell command on the shared agent terminal.
    Shell { command: String },
}

impl ActionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionPayload::File { .. } => "file",
            ActionPayload::Modify { .. } => "modify",
            ActionPayload::Shell { .. } => "shell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Running,
    Complete,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: String,
    pub artifact_id: String,
    pub message_id: String,
    pub payload: ActionPayload,
    /// Set once the action has actually run (complete or failed). Aborted
    /// actions never ran, so they stay unexecuted.
    pub executed: bool,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(
        action_id: impl Into<String>,
        artifact_id: impl Into<String>,
        message_id: impl Into<String>,
        payload: ActionPayload,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            artifact_id: artifact_id.into(),
            message_id: message_id.into(),
            payload,
            executed: false,
            status: ActionStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Tag describing what kind of unit of work an artifact represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A bundle of file edits, possibly with shell steps.
    Bundled,
    /// A standalone shell invocation.
    Shell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddArtifactRequest {
    pub message_id: String,
    pub artifact_id: String,
    pub title: String,
    pub kind: ArtifactKind,
}

/// Partial artifact mutation, as delivered by `updateArtifact` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactUpdate {
    pub title: Option<String>,
    pub closed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddActionRequest {
    pub message_id: String,
    pub artifact_id: String,
    pub action_id: String,
    pub payload: ActionPayload,
}

/// In-memory table of every action the engine has seen, keyed by action id.
///
/// Ephemeral by design: there is no persistence of queue state across
/// restarts.
#[derive(Debug, Default)]
pub struct ActionTable {
    actions: RwLock<HashMap<String, Action>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new action. Returns false (and leaves the table untouched)
    /// when the id is already present, making re-delivery a no-op.
    pub async fn insert(&self, action: Action) -> bool {
        let mut actions = self.actions.write().await;
        if actions.contains_key(&action.action_id) {
            return false;
        }
        actions.insert(action.action_id.clone(), action);
        true
    }

    pub async fn get(&self, action_id: &str) -> Option<Action> {
        self.actions.read().await.get(action_id).cloned()
    }

    pub async fn status(&self, action_id: &str) -> Option<ActionStatus> {
        self.actions.read().await.get(action_id).map(|a| a.status)
    }

    pub async fn set_status(&self, action_id: &str, status: ActionStatus) {
        let mut actions = self.actions.write().await;
        if let Some(action) = actions.get_mut(action_id) {
            action.status = status;
        }
    }

    pub async fn mark_executed(&self, action_id: &str) {
        let mut actions = self.actions.write().await;
        if let Some(action) = actions.get_mut(action_id) {
            action.executed = true;
        }
    }

    /// Replace the payload of a known action (streaming content updates).
    pub async fn update_payload(&self, action_id: &str, payload: ActionPayload) {
        let mut actions = self.actions.write().await;
        if let Some(action) = actions.get_mut(action_id) {
            action.payload = payload;
        }
    }

    pub async fn statuses_for_message(&self, message_id: &str) -> Vec<(String, ActionStatus)> {
        self.actions
            .read()
            .await
            .values()
            .filter(|a| a.message_id == message_id)
            .map(|a| (a.action_id.clone(), a.status))
            .collect()
    }

    pub async fn running_count(&self, message_id: &str) -> usize {
        self.actions
            .read()
            .await
            .values()
            .filter(|a| a.message_id == message_id && a.status == ActionStatus::Running)
            .count()
    }
}
