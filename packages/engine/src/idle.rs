// ABOUTME: Message idle tracking: waiters, close callbacks, and pruning
// ABOUTME: Fired by the engine coordinator when a message's work fully settles

use futures::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Async callback invoked when a message settles, used to flush UI state or
/// notify the transport that a turn has finished.
pub type CloseCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Bookkeeping for "has this message finished all its work" consumers.
///
/// The tracker itself does not decide idleness; the engine coordinator calls
/// `fire` when the conditions hold (all artifacts closed, no queued chain).
/// Waiters are one-shot: once fired they are gone, and a message going busy
/// again later fires any newly registered waiters on the next settle.
#[derive(Default)]
pub struct IdleTracker {
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    callbacks: Mutex<HashMap<String, Vec<CloseCallback>>>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_waiter(&self, message_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry(message_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn register_callback(&self, message_id: &str, callback: CloseCallback) {
        self.callbacks
            .lock()
            .await
            .entry(message_id.to_string())
            .or_default()
            .push(callback);
    }

    /// Resolve everything registered for this message. Callbacks run to
    /// completion (awaited, in registration order) before waiters resolve.
    pub async fn fire(&self, message_id: &str) {
        let callbacks = self
            .callbacks
            .lock()
            .await
            .remove(message_id)
            .unwrap_or_default();
        let fired_callbacks = callbacks.len();
        for callback in callbacks {
            callback().await;
        }

        let waiters = self
            .waiters
            .lock()
            .await
            .remove(message_id)
            .unwrap_or_default();
        let fired_waiters = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(());
        }

        if fired_callbacks + fired_waiters > 0 {
            debug!(
                message_id,
                callbacks = fired_callbacks,
                waiters = fired_waiters,
                "message idle"
            );
        }
    }

    /// Drop waiters whose receiving side went away (e.g. a timed-out
    /// `wait_for_message_idle`), so abandoned entries do not pile up.
    pub async fn prune(&self, message_id: &str) {
        let mut waiters = self.waiters.lock().await;
        if let Some(list) = waiters.get_mut(message_id) {
            list.retain(|tx| !tx.is_closed());
            if list.is_empty() {
                waiters.remove(message_id);
            }
        }
    }

    pub async fn waiter_count(&self, message_id: &str) -> usize {
        self.waiters
            .lock()
            .await
            .get(message_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}
