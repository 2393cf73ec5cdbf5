// ABOUTME: Internal engine events keyed by message id
// ABOUTME: Explicit pub/sub between scheduler, registry, and the idle coordinator

/// Events published on the engine's internal bus. The coordinator consumes
/// them to decide when a message id has gone idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The action queue chain for this message id drained to empty.
    ChainDrained(String),
    /// An artifact belonging to this message id was closed.
    ArtifactClosed(String),
}

impl EngineEvent {
    pub fn message_id(&self) -> &str {
        match self {
            EngineEvent::ChainDrained(id) | EngineEvent::ArtifactClosed(id) => id,
        }
    }
}
