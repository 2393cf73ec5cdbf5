// ABOUTME: Alert channel for surfacing engine faults to the presentation layer
// ABOUTME: Broadcast-based hub with de-duplication of repeated connection-loss alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Classification of an alert routed to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A single action (file/modify/shell) failed; the queue continued.
    ActionFailed,
    /// A shell command used for a build or deploy exited non-zero.
    BuildFailed,
    /// Runtime exception caught from the sandbox (preview message channel).
    RuntimeError,
    /// Sandbox connection was lost; recovery is automatic.
    ConnectionLost,
    /// Sandbox is reconnecting; informational, non-blocking.
    Reconnecting,
    /// Sandbox could not be created at all.
    InitializationFailed,
}

/// Where the alert originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    Engine,
    Sandbox,
    Shell,
    Supervisor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub title: String,
    pub description: String,
    /// Raw payload (command output, error text) for the detail view.
    pub content: String,
    pub source: AlertSource,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        title: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        source: AlertSource,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            description: description.into(),
            content: content.into(),
            source,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out point for alerts.
///
/// Subscribers come and go (panels open and close); a broadcast channel with
/// a bounded backlog fits that. Connection-loss alerts are de-duplicated so a
/// flapping transport produces a single notification until the connection is
/// restored.
#[derive(Debug)]
pub struct AlertHub {
    tx: broadcast::Sender<Alert>,
    connection_lost_notified: AtomicBool,
}

impl AlertHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            connection_lost_notified: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Publish an alert. Returns false if it was suppressed as a duplicate.
    pub fn publish(&self, alert: Alert) -> bool {
        match alert.kind {
            AlertKind::ConnectionLost => {
                if self.connection_lost_notified.swap(true, Ordering::SeqCst) {
                    tracing::debug!("suppressing duplicate connection-lost alert");
                    return false;
                }
            }
            AlertKind::Reconnecting => {}
            _ => {}
        }

        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.tx.send(alert);
        true
    }

    /// Clear the connection-loss dedup flag once the connection is restored.
    pub fn connection_restored(&self) {
        self.connection_lost_notified.store(false, Ordering::SeqCst);
    }
}

impl Default for AlertHub {
    fn default() -> Self {
        Self::new(64)
    }
}
