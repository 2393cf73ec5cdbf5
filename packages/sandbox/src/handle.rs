// ABOUTME: Capability trait for the sandboxed runtime and its provider seam
// ABOUTME: Filesystem, shell spawning, and event subscription behind a narrow interface

use async_trait::async_trait;
use atelier_core::ConnectionState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Path escapes the sandbox workdir: {0}")]
    PathEscape(PathBuf),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Patch target not found in {path}: {context}")]
    PatchMismatch { path: PathBuf, context: String },

    #[error("Failed to spawn shell: {0}")]
    ShellSpawn(String),

    #[error("Sandbox is disconnected")]
    Disconnected,

    #[error("Provider error: {0}")]
    Provider(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Runtime-originated events surfaced through the handle.
#[derive(Debug, Clone)]
pub enum SandboxEvent {
    /// Transport state changed.
    ConnectionState(ConnectionState),
    /// Message caught from the preview frame (runtime exceptions, console errors).
    PreviewMessage(String),
}

/// Filesystem change notification from `watch_paths`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Paths to watch, relative to the workdir.
    pub paths: Vec<PathBuf>,
    /// Poll interval in milliseconds for providers without native notification.
    pub poll_interval_ms: Option<u64>,
}

/// One end of a spawned interactive shell.
///
/// `write_line` feeds input to the shell's stdin; the output receiver is
/// handed out once at spawn time (single consumer, the command serializer).
#[async_trait]
pub trait ShellIo: Send + Sync {
    async fn write_line(&self, line: &str) -> Result<()>;

    /// Resize the pseudo-terminal, if the provider has one.
    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Detach the session and release the underlying process.
    async fn detach(&self) -> Result<()>;
}

/// A single patch instruction: replace the first occurrence of `find` with
/// `replace`. The patch payload of a modify action is a JSON array of these,
/// applied in order. Binary-aware diffing lives with the producer of the
/// patch, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub find: String,
    pub replace: String,
}

/// Capability object for the isolated runtime where project files live and
/// commands execute. Exactly one authoritative handle exists at a time; the
/// supervisor swaps it out on crash recovery.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Base path for relative resolution.
    fn workdir(&self) -> &Path;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Apply a patch to a file and return the resulting content.
    async fn apply_patch(&self, path: &Path, patch: &str) -> Result<Vec<u8>>;

    /// Watch paths for changes; events arrive on the returned channel until
    /// the receiver is dropped.
    async fn watch_paths(&self, options: WatchOptions) -> Result<mpsc::UnboundedReceiver<FsEvent>>;

    /// Spawn a persistent interactive shell. Returns the input/control half
    /// and the line-oriented output stream (stdout and stderr merged).
    async fn spawn_shell(&self) -> Result<(Arc<dyn ShellIo>, mpsc::UnboundedReceiver<String>)>;

    /// Subscribe to runtime-originated events.
    fn events(&self) -> broadcast::Receiver<SandboxEvent>;
}

/// Provider seam for creating sandbox instances.
///
/// The supervisor calls this on initialization and on every recreation; a
/// provider may be a remote runtime client or the in-process local sandbox.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, credential: &str) -> Result<Arc<dyn SandboxHandle>>;
}
