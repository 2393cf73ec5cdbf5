// ABOUTME: Action queue scheduler with strict per-message ordering
// ABOUTME: One FIFO chain per message id, drained sequentially by a dedicated task

use crate::events::EngineEvent;
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Executes one action by id. Implementations contain their own failures;
/// the scheduler always advances to the next queued action regardless of
/// what happened to the previous one.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    async fn execute(&self, action_id: &str);
}

/// Per-message-id FIFO scheduler.
///
/// Actions under one message id execute strictly in arrival order and never
/// concurrently with each other; chains for different message ids drain
/// independently. A chain's map entry is removed once it empties, and a
/// `ChainDrained` event is published so the idle coordinator can re-check.
pub struct ActionScheduler {
    chains: Mutex<HashMap<String, VecDeque<String>>>,
    executor: Arc<dyn ActionExecutor>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl ActionScheduler {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chains: Mutex::new(HashMap::new()),
            executor,
            events,
        })
    }

    /// Append an action to the message's chain, starting a drain task if the
    /// chain did not exist. The first action of a fresh chain therefore
    /// executes immediately; later ones run when their predecessor finishes.
    pub async fn enqueue(self: &Arc<Self>, message_id: &str, action_id: &str) {
        let mut chains = self.chains.lock().await;
        match chains.entry(message_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push_back(action_id.to_string());
            }
            Entry::Vacant(entry) => {
                let mut chain = VecDeque::new();
                chain.push_back(action_id.to_string());
                entry.insert(chain);

                let scheduler = self.clone();
                let message_id = message_id.to_string();
                tokio::spawn(async move {
                    scheduler.drain(message_id).await;
                });
            }
        }
    }

    async fn drain(self: Arc<Self>, message_id: String) {
        loop {
            let next = {
                let mut chains = self.chains.lock().await;
                // Entry gone means an abort cleared the chain out from under
                // us; the abort path already published ChainDrained.
                let Some(chain) = chains.get_mut(&message_id) else {
                    break;
                };
                match chain.pop_front() {
                    Some(action_id) => action_id,
                    None => {
                        chains.remove(&message_id);
                        debug!(message_id, "action chain drained");
                        let _ = self
                            .events
                            .send(EngineEvent::ChainDrained(message_id.clone()));
                        break;
                    }
                }
            };

            self.executor.execute(&next).await;
        }
    }

    pub async fn has_chain(&self, message_id: &str) -> bool {
        self.chains.lock().await.contains_key(message_id)
    }

    /// Remove every chain without executing anything. Returns the action ids
    /// that were still queued so the caller can mark them aborted; publishes
    /// `ChainDrained` for each cleared message id. A later enqueue for the
    /// same message id starts a fresh chain.
    pub async fn clear(&self) -> Vec<String> {
        let mut chains = self.chains.lock().await;
        let mut cleared = Vec::new();
        for (message_id, chain) in chains.drain() {
            cleared.extend(chain.into_iter());
            let _ = self.events.send(EngineEvent::ChainDrained(message_id));
        }
        cleared
    }
}

/// Holder of the current abort signal.
///
/// `abort_all_actions` cancels the held token and swaps in a fresh one, so
/// work enqueued afterwards is never blocked behind a stale cancellation.
#[derive(Debug)]
pub struct CancelCell {
    token: Mutex<CancellationToken>,
}

impl CancelCell {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
        }
    }

    pub async fn current(&self) -> CancellationToken {
        self.token.lock().await.clone()
    }

    /// Swap in a fresh token, returning the old one for the caller to cancel.
    pub async fn reset(&self) -> CancellationToken {
        let mut token = self.token.lock().await;
        std::mem::replace(&mut token, CancellationToken::new())
    }
}

impl Default for CancelCell {
    fn default() -> Self {
        Self::new()
    }
}
