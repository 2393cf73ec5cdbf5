// ABOUTME: Shared leaf types for the Atelier action execution engine
// ABOUTME: Alert channel, connection state machine, in-memory file store, settings

pub mod alerts;
pub mod connection;
pub mod files;
pub mod settings;

pub use alerts::{Alert, AlertHub, AlertKind, AlertSource};
pub use connection::ConnectionState;
pub use files::{FileSnapshot, FileStore};
pub use settings::EngineSettings;
