// ABOUTME: End-to-end engine tests against the local sandbox provider
// ABOUTME: Ordering, isolation, deferred close, idle tracking, recreation, abort

use atelier_core::EngineSettings;
use atelier_engine::{
    ActionPayload, ActionStatus, AddActionRequest, AddArtifactRequest, ArtifactKind, EngineError,
    Workbench,
};
use atelier_sandbox::LocalProvider;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn workbench() -> (Arc<Workbench>, TempDir) {
    let dir = TempDir::new().unwrap();
    let settings = EngineSettings {
        idle_poll_ms: 50,
        idle_timeout_ms: 5_000,
        ..EngineSettings::default()
    };
    let workbench = Workbench::new(Arc::new(LocalProvider::new(dir.path())), settings);
    workbench.initialize("cred").await.unwrap();
    (workbench, dir)
}

fn artifact(message_id: &str, artifact_id: &str) -> AddArtifactRequest {
    AddArtifactRequest {
        message_id: message_id.to_string(),
        artifact_id: artifact_id.to_string(),
        title: "Test artifact".to_string(),
        kind: ArtifactKind::Bundled,
    }
}

fn file_action(
    message_id: &str,
    artifact_id: &str,
    action_id: &str,
    path: &str,
    content: &str,
) -> AddActionRequest {
    AddActionRequest {
        message_id: message_id.to_string(),
        artifact_id: artifact_id.to_string(),
        action_id: action_id.to_string(),
        payload: ActionPayload::File {
            path: path.to_string(),
            content: content.to_string(),
        },
    }
}

fn shell_action(
    message_id: &str,
    artifact_id: &str,
    action_id: &str,
    command: &str,
) -> AddActionRequest {
    AddActionRequest {
        message_id: message_id.to_string(),
        artifact_id: artifact_id.to_string(),
        action_id: action_id.to_string(),
        payload: ActionPayload::Shell {
            command: command.to_string(),
        },
    }
}

async fn read_sandbox_file(workbench: &Workbench, path: &str) -> Option<String> {
    let handle = workbench.supervisor().try_handle()?;
    handle
        .read_file(Path::new(path))
        .await
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn test_actions_execute_in_order_within_message() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;

    // Appends observe execution order directly.
    for i in 1..=4 {
        wb.add_action(shell_action(
            "m1",
            "art1",
            &format!("a{i}"),
            &format!("echo {i} >> order.log"),
        ))
        .await
        .unwrap();
    }
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();

    let log = read_sandbox_file(&wb, "order.log").await.unwrap();
    assert_eq!(log, "1\n2\n3\n4\n");
    for i in 1..=4 {
        assert_eq!(
            wb.action_status(&format!("a{i}")).await,
            Some(ActionStatus::Complete)
        );
    }
}

#[tokio::test]
async fn test_messages_progress_independently() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "slow")).await;
    wb.add_artifact(artifact("m2", "fast")).await;

    wb.add_action(shell_action("m1", "slow", "a-slow", "sleep 0.6"))
        .await
        .unwrap();
    wb.add_action(file_action("m2", "fast", "a-fast", "fast.txt", "hi"))
        .await
        .unwrap();
    wb.close_artifact("m1", "slow").await.unwrap();
    wb.close_artifact("m2", "fast").await.unwrap();

    // m2 settles while m1's shell command is still sleeping.
    wb.wait_for_message_idle("m2", Some(Duration::from_millis(400)))
        .await
        .unwrap();
    assert!(!wb.is_idle("m1").await);
    assert_eq!(read_sandbox_file(&wb, "fast.txt").await.unwrap(), "hi");

    wb.wait_for_message_idle("m1", None).await.unwrap();
}

#[tokio::test]
async fn test_shell_commands_never_interleave_across_messages() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;
    wb.add_artifact(artifact("m2", "art2")).await;

    wb.add_action(shell_action(
        "m1",
        "art1",
        "a1",
        "echo a-start >> trace.log; sleep 0.2; echo a-end >> trace.log",
    ))
    .await
    .unwrap();
    wb.add_action(shell_action(
        "m2",
        "art2",
        "b1",
        "echo b-start >> trace.log; sleep 0.2; echo b-end >> trace.log",
    ))
    .await
    .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.close_artifact("m2", "art2").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();
    wb.wait_for_message_idle("m2", None).await.unwrap();

    // Both ran on the shared agent terminal, one fully after the other.
    let trace = read_sandbox_file(&wb, "trace.log").await.unwrap();
    let lines: Vec<&str> = trace.lines().collect();
    assert_eq!(lines.len(), 4);
    let allowed = [
        vec!["a-start", "a-end", "b-start", "b-end"],
        vec!["b-start", "b-end", "a-start", "a-end"],
    ];
    assert!(allowed.contains(&lines), "interleaved trace: {lines:?}");
}

#[tokio::test]
async fn test_close_defers_until_actions_finish() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;
    wb.add_action(shell_action("m1", "art1", "a1", "sleep 0.3"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Close resolves immediately but the artifact stays open while the
    // action runs.
    wb.close_artifact("m1", "art1").await.unwrap();
    let art = wb
        .add_artifact(artifact("m1", "art1"))
        .await;
    assert!(!art.is_closed());

    wb.wait_for_message_idle("m1", None).await.unwrap();
    assert!(art.is_closed());
    assert_eq!(wb.action_status("a1").await, Some(ActionStatus::Complete));
}

#[tokio::test]
async fn test_wait_idle_immediate_and_timeout() {
    let (wb, _dir) = workbench().await;

    // Unknown message: vacuously idle.
    wb.wait_for_message_idle("nothing", Some(Duration::from_millis(100)))
        .await
        .unwrap();

    // An open artifact with no close request never settles.
    wb.add_artifact(artifact("m1", "art1")).await;
    let err = wb
        .wait_for_message_idle("m1", Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IdleTimeout { .. }));
}

#[tokio::test]
async fn test_on_message_close_fires_after_settle() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;
    wb.add_action(file_action("m1", "art1", "a1", "x.txt", "x"))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = std::sync::Mutex::new(Some(tx));
    wb.on_message_close(
        "m1",
        Box::new(move || {
            let tx = tx.lock().unwrap().take();
            Box::pin(async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            })
        }),
    )
    .await;

    wb.close_artifact("m1", "art1").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_on_message_close_fires_when_already_idle() {
    let (wb, _dir) = workbench().await;

    // No artifacts for this message: idle, so the callback runs right away.
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = std::sync::Mutex::new(Some(tx));
    wb.on_message_close(
        "m-empty",
        Box::new(move || {
            let tx = tx.lock().unwrap().take();
            Box::pin(async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            })
        }),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();

    // Registration racing a settle: the message goes idle concurrently with
    // the registration, and the callback must still fire.
    wb.add_artifact(artifact("m1", "art1")).await;
    wb.add_action(file_action("m1", "art1", "a1", "x.txt", "x"))
        .await
        .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = std::sync::Mutex::new(Some(tx));
    wb.on_message_close(
        "m1",
        Box::new(move || {
            let tx = tx.lock().unwrap().take();
            Box::pin(async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            })
        }),
    )
    .await;
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_close_requests_close_once() {
    let (wb, _dir) = workbench().await;
    let art = wb.add_artifact(artifact("m1", "art1")).await;
    wb.add_action(shell_action("m1", "art1", "a1", "sleep 0.3"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closes = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let closes = closes.clone();
        wb.on_message_close(
            "m1",
            Box::new(move || {
                Box::pin(async move {
                    closes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            }),
        )
        .await;
    }

    // Both close requests land while the action is still running; both
    // resolve immediately and the artifact stays open.
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    assert!(!art.is_closed());

    wb.wait_for_message_idle("m1", None).await.unwrap();
    assert!(art.is_closed());
    assert_eq!(closes.load(std::sync::atomic::Ordering::SeqCst), 1);

    // A third close after the fact remains a no-op.
    wb.close_artifact("m1", "art1").await.unwrap();
    assert!(art.is_closed());
    assert_eq!(wb.action_status("a1").await, Some(ActionStatus::Complete));
}

#[tokio::test]
async fn test_reinitialize_preserves_written_files() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;
    wb.add_action(file_action(
        "m1",
        "art1",
        "a1",
        "src/app.js",
        "console.log('v1')",
    ))
    .await
    .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();

    let before = wb.supervisor().try_handle().unwrap();
    wb.reinitialize("cred").await.unwrap();
    let after = wb.supervisor().try_handle().unwrap();
    assert_ne!(before.workdir(), after.workdir());
    assert_eq!(wb.supervisor().generation(), 1);

    // The file store was remounted onto the fresh instance.
    assert_eq!(
        read_sandbox_file(&wb, "src/app.js").await.unwrap(),
        "console.log('v1')"
    );
}

#[tokio::test]
async fn test_abort_clears_queue_and_allows_fresh_work() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;

    wb.add_action(shell_action("m1", "art1", "a1", "sleep 5"))
        .await
        .unwrap();
    wb.add_action(file_action("m1", "art1", "a2", "later.txt", "later"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    wb.abort_all_actions().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Nothing left running; the in-flight command and the queued action are
    // both aborted, and neither executed.
    for (_, status) in wb.message_action_statuses("m1").await {
        assert_eq!(status, ActionStatus::Aborted);
    }
    assert!(read_sandbox_file(&wb, "later.txt").await.is_none());

    // A fresh chain starts immediately on the same message.
    wb.add_action(file_action("m1", "art1", "a3", "fresh.txt", "ok"))
        .await
        .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();
    assert_eq!(wb.action_status("a3").await, Some(ActionStatus::Complete));
    assert_eq!(read_sandbox_file(&wb, "fresh.txt").await.unwrap(), "ok");
}

#[tokio::test]
async fn test_rewrite_then_build_scenario() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;

    // Two writes to the same path followed by a command that reads it: the
    // command must observe the second write.
    wb.add_action(file_action("m1", "art1", "a1", "a.txt", "1"))
        .await
        .unwrap();
    wb.add_action(file_action("m1", "art1", "a2", "a.txt", "2"))
        .await
        .unwrap();
    wb.add_action(shell_action("m1", "art1", "a3", "cat a.txt > copy.txt"))
        .await
        .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();

    assert_eq!(read_sandbox_file(&wb, "a.txt").await.unwrap(), "2");
    assert_eq!(read_sandbox_file(&wb, "copy.txt").await.unwrap(), "2");
    assert_eq!(
        wb.files().read("a.txt").await.unwrap(),
        b"2".to_vec()
    );
}

#[tokio::test]
async fn test_failed_command_raises_alert_and_queue_continues() {
    let (wb, _dir) = workbench().await;
    let mut alerts = wb.alerts();
    wb.add_artifact(artifact("m1", "art1")).await;

    wb.add_action(shell_action("m1", "art1", "bad", "exit 3"))
        .await
        .unwrap();
    wb.add_action(file_action("m1", "art1", "good", "after.txt", "still ran"))
        .await
        .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();

    assert_eq!(wb.action_status("bad").await, Some(ActionStatus::Failed));
    assert_eq!(wb.action_status("good").await, Some(ActionStatus::Complete));
    assert_eq!(
        read_sandbox_file(&wb, "after.txt").await.unwrap(),
        "still ran"
    );

    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.kind, atelier_core::AlertKind::BuildFailed);
    assert!(alert.description.contains("3"));
}

#[tokio::test]
async fn test_streaming_then_final_delivery() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;

    // Partials surface in the file store preview without enqueueing work.
    wb.run_action(
        file_action("m1", "art1", "a1", "page.html", "<html>"),
        true,
    )
    .await
    .unwrap();
    assert_eq!(wb.files().read("page.html").await.unwrap(), b"<html>".to_vec());
    assert!(wb.files().is_modified("page.html").await);
    assert!(wb.action_status("a1").await.is_none());

    // The final delivery registers and executes the action.
    wb.run_action(
        file_action("m1", "art1", "a1", "page.html", "<html></html>"),
        false,
    )
    .await
    .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();

    assert_eq!(
        read_sandbox_file(&wb, "page.html").await.unwrap(),
        "<html></html>"
    );
    assert!(!wb.files().is_modified("page.html").await);
    assert_eq!(wb.action_status("a1").await, Some(ActionStatus::Complete));
}

#[tokio::test]
async fn test_modify_action_patches_file() {
    let (wb, _dir) = workbench().await;
    wb.add_artifact(artifact("m1", "art1")).await;

    wb.add_action(file_action(
        "m1",
        "art1",
        "a1",
        "main.js",
        "const x = 1;\nconsole.log(x);\n",
    ))
    .await
    .unwrap();
    let patch = serde_json::json!([{ "find": "const x = 1;", "replace": "const x = 42;" }]);
    wb.add_action(AddActionRequest {
        message_id: "m1".to_string(),
        artifact_id: "art1".to_string(),
        action_id: "a2".to_string(),
        payload: ActionPayload::Modify {
            path: "main.js".to_string(),
            patch: patch.to_string(),
        },
    })
    .await
    .unwrap();
    wb.close_artifact("m1", "art1").await.unwrap();
    wb.wait_for_message_idle("m1", None).await.unwrap();

    let content = read_sandbox_file(&wb, "main.js").await.unwrap();
    assert!(content.contains("const x = 42;"));
    assert_eq!(
        wb.files().read("main.js").await.unwrap(),
        content.into_bytes()
    );
}

#[tokio::test]
async fn test_run_script_uses_named_terminal() {
    let (wb, _dir) = workbench().await;

    let out = wb.run_script("deploy", "echo deployed").await.unwrap();
    assert!(out.success());
    assert_eq!(out.output.trim(), "deployed");

    // Unknown artifact references are rejected up front.
    let err = wb
        .add_action(file_action("m1", "ghost", "a1", "x.txt", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownArtifact { .. }));
}
