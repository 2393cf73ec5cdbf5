// ABOUTME: In-memory file store mirroring the sandbox filesystem
// ABOUTME: Document cache with modification tracking and snapshots for remount

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Point-in-time copy of the file tree, used to remount state onto a freshly
/// created sandbox after crash recovery.
#[derive(Debug, Clone, Default)]
pub struct FileSnapshot {
    pub files: Vec<(PathBuf, Vec<u8>)>,
}

impl FileSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
struct FileEntry {
    content: Vec<u8>,
    /// Set while the in-memory content has diverged from the sandbox
    /// filesystem (user edits, streaming partials). Cleared once the engine
    /// confirms the content was persisted.
    modified: bool,
}

/// In-memory mirror of the project file tree.
///
/// The editing surface owns the user-visible documents; the engine treats
/// this store as a cache it keeps consistent after every successful file or
/// modify action and after every successful remount.
#[derive(Debug, Default)]
pub struct FileStore {
    entries: RwLock<HashMap<PathBuf, FileEntry>>,
    /// Path currently open in the editing surface, if any.
    selected: RwLock<Option<PathBuf>>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update in-memory content and mark the path modified.
    pub async fn update(&self, path: impl AsRef<Path>, content: Vec<u8>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            path.as_ref().to_path_buf(),
            FileEntry {
                content,
                modified: true,
            },
        );
    }

    /// Replace content with what the sandbox reports, clearing the modified
    /// flag (the cache and the filesystem agree again).
    pub async fn confirm(&self, path: impl AsRef<Path>, content: Vec<u8>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            path.as_ref().to_path_buf(),
            FileEntry {
                content,
                modified: false,
            },
        );
    }

    /// Clear modification tracking for a path without touching content.
    pub async fn clear_modified(&self, path: impl AsRef<Path>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(path.as_ref()) {
            entry.modified = false;
        }
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let entries = self.entries.read().await;
        entries.get(path.as_ref()).map(|e| e.content.clone())
    }

    pub async fn is_modified(&self, path: impl AsRef<Path>) -> bool {
        let entries = self.entries.read().await;
        entries.get(path.as_ref()).map(|e| e.modified).unwrap_or(false)
    }

    pub async fn remove(&self, path: impl AsRef<Path>) {
        let mut entries = self.entries.write().await;
        entries.remove(path.as_ref());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot every known file, modified or not. Paths are sorted so the
    /// remount order is deterministic.
    pub async fn snapshot(&self) -> FileSnapshot {
        let entries = self.entries.read().await;
        let mut files: Vec<(PathBuf, Vec<u8>)> = entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.content.clone()))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        FileSnapshot { files }
    }

    /// Open a path in the editing surface. Returns true if the selection
    /// changed.
    pub async fn select(&self, path: impl AsRef<Path>) -> bool {
        let mut selected = self.selected.write().await;
        let path = path.as_ref().to_path_buf();
        if selected.as_deref() == Some(path.as_path()) {
            return false;
        }
        *selected = Some(path);
        true
    }

    pub async fn selected(&self) -> Option<PathBuf> {
        self.selected.read().await.clone()
    }

    /// Drop everything, e.g. when the surrounding conversation is discarded.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        *self.selected.write().await = None;
    }
}
