// ABOUTME: In-process sandbox provider backed by a scratch directory and /bin/sh
// ABOUTME: Reference implementation of the capability trait for tests and local mode

use crate::handle::{
    FsEvent, PatchOp, Result, SandboxError, SandboxEvent, SandboxHandle, SandboxProvider, ShellIo,
    WatchOptions,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

const DEFAULT_WATCH_POLL_MS: u64 = 500;

/// Local sandbox: a scratch directory plus `/bin/sh` sessions.
///
/// Connection-state events never fire on their own here (the "transport" is
/// the process itself); `emit` lets the supervisor and tests inject them.
pub struct LocalSandbox {
    root: PathBuf,
    events: broadcast::Sender<SandboxEvent>,
}

impl LocalSandbox {
    pub fn new(root: PathBuf) -> Self {
        let (events, _) = broadcast::channel(32);
        Self { root, events }
    }

    /// Inject a runtime event, as the remote transport would.
    pub fn emit(&self, event: SandboxEvent) {
        let _ = self.events.send(event);
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SandboxError::PathEscape(path.to_path_buf()));
        }
        if path.is_absolute() {
            if !path.starts_with(&self.root) {
                return Err(SandboxError::PathEscape(path.to_path_buf()));
            }
            return Ok(path.to_path_buf());
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl SandboxHandle for LocalSandbox {
    fn workdir(&self) -> &Path {
        &self.root
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, contents).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_patch(&self, path: &Path, patch: &str) -> Result<Vec<u8>> {
        let ops: Vec<PatchOp> = serde_json::from_str(patch)
            .map_err(|e| SandboxError::InvalidPatch(e.to_string()))?;

        let bytes = self.read_file(path).await?;
        let mut content = String::from_utf8(bytes)
            .map_err(|_| SandboxError::InvalidPatch("patch target is not UTF-8".to_string()))?;

        for op in &ops {
            if !content.contains(&op.find) {
                let context: String = op.find.chars().take(64).collect();
                return Err(SandboxError::PatchMismatch {
                    path: path.to_path_buf(),
                    context,
                });
            }
            content = content.replacen(&op.find, &op.replace, 1);
        }

        let result = content.into_bytes();
        self.write_file(path, &result).await?;
        Ok(result)
    }

    async fn watch_paths(&self, options: WatchOptions) -> Result<mpsc::UnboundedReceiver<FsEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let interval =
            Duration::from_millis(options.poll_interval_ms.unwrap_or(DEFAULT_WATCH_POLL_MS));

        let mut targets = Vec::new();
        for path in &options.paths {
            targets.push((path.clone(), self.resolve(path)?));
        }

        // No native notification for plain directories; poll mtimes.
        tokio::spawn(async move {
            let mut seen: HashMap<PathBuf, Option<SystemTime>> = HashMap::new();
            for (rel, full) in &targets {
                let mtime = tokio::fs::metadata(full)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());
                seen.insert(rel.clone(), mtime);
            }

            loop {
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    break;
                }
                for (rel, full) in &targets {
                    let mtime = tokio::fs::metadata(full)
                        .await
                        .ok()
                        .and_then(|m| m.modified().ok());
                    let previous = seen.insert(rel.clone(), mtime);
                    let event = match (previous.flatten(), mtime) {
                        (None, Some(_)) => Some(FsEvent::Created(rel.clone())),
                        (Some(_), None) => Some(FsEvent::Removed(rel.clone())),
                        (Some(a), Some(b)) if a != b => Some(FsEvent::Modified(rel.clone())),
                        _ => None,
                    };
                    if let Some(event) = event {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn spawn_shell(&self) -> Result<(Arc<dyn ShellIo>, mpsc::UnboundedReceiver<String>)> {
        let mut child = Command::new("/bin/sh")
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::ShellSpawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::ShellSpawn("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::ShellSpawn("no stdout handle".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::ShellSpawn("no stderr handle".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let out_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if out_tx.send(line).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let io: Arc<dyn ShellIo> = Arc::new(LocalShell {
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
        });
        Ok((io, rx))
    }

    fn events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }
}

struct LocalShell {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl ShellIo for LocalShell {
    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        // Plain pipes, nothing to resize.
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(e) = child.start_kill() {
                warn!("failed to kill detached shell: {e}");
            }
        }
        Ok(())
    }
}

/// Provider that creates one `LocalSandbox` per generation under a base
/// directory. Each recreation lands in a fresh subdirectory, so stale
/// handles keep pointing at dead trees instead of racing the new one.
pub struct LocalProvider {
    base: PathBuf,
    counter: AtomicU64,
}

impl LocalProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn create(&self, _credential: &str) -> Result<Arc<dyn SandboxHandle>> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let root = self.base.join(format!("sandbox-{n}"));
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "created local sandbox");
        Ok(Arc::new(LocalSandbox::new(root)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sandbox() -> (LocalSandbox, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalSandbox::new(dir.path().to_path_buf()), dir)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (sb, _dir) = sandbox();
        sb.write_file(Path::new("src/main.rs"), b"fn main() {}")
            .await
            .unwrap();
        let bytes = sb.read_file(Path::new("src/main.rs")).await.unwrap();
        assert_eq!(bytes, b"fn main() {}".to_vec());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let (sb, _dir) = sandbox();
        let err = sb.read_file(Path::new("nope.txt")).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (sb, _dir) = sandbox();
        let err = sb
            .read_file(Path::new("../outside.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_apply_patch() {
        let (sb, _dir) = sandbox();
        sb.write_file(Path::new("a.js"), b"const x = 1;\nconst y = 2;\n")
            .await
            .unwrap();

        let patch =
            serde_json::to_string(&vec![PatchOp {
                find: "const x = 1;".to_string(),
                replace: "const x = 10;".to_string(),
            }])
            .unwrap();

        let result = sb.apply_patch(Path::new("a.js"), &patch).await.unwrap();
        assert_eq!(
            String::from_utf8(result).unwrap(),
            "const x = 10;\nconst y = 2;\n"
        );
        // Persisted too, not just returned.
        let on_disk = sb.read_file(Path::new("a.js")).await.unwrap();
        assert!(String::from_utf8(on_disk).unwrap().contains("x = 10"));
    }

    #[tokio::test]
    async fn test_apply_patch_mismatch() {
        let (sb, _dir) = sandbox();
        sb.write_file(Path::new("a.js"), b"const x = 1;").await.unwrap();

        let patch = serde_json::to_string(&vec![PatchOp {
            find: "not present".to_string(),
            replace: "whatever".to_string(),
        }])
        .unwrap();

        let err = sb.apply_patch(Path::new("a.js"), &patch).await.unwrap_err();
        assert!(matches!(err, SandboxError::PatchMismatch { .. }));
    }

    #[tokio::test]
    async fn test_shell_echo() {
        let (sb, _dir) = sandbox();
        let (io, mut rx) = sb.spawn_shell().await.unwrap();
        io.write_line("echo hello").await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "hello");
        io.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_paths_reports_creation() {
        let (sb, _dir) = sandbox();
        let mut rx = sb
            .watch_paths(WatchOptions {
                paths: vec![PathBuf::from("watched.txt")],
                poll_interval_ms: Some(20),
            })
            .await
            .unwrap();

        sb.write_file(Path::new("watched.txt"), b"now you see me")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, FsEvent::Created(PathBuf::from("watched.txt")));
    }

    #[tokio::test]
    async fn test_provider_creates_fresh_roots() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path());
        let a = provider.create("").await.unwrap();
        let b = provider.create("").await.unwrap();
        assert_ne!(a.workdir(), b.workdir());
    }
}
