use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use warm_workflow::{
    Coordinator, CoordinatorOptions, ProgressStore, Stage, StageContext, StageStatus,
    WorkflowError, WorkflowEvent, WorkflowProgress, WorkflowStage,
};

#[derive(Debug, Serialize)]
struct TestConfig {
    out: PathBuf,
}

type Calls = Arc<Mutex<Vec<String>>>;

struct Recording {
    calls: Calls,
    fail: bool,
}

#[async_trait]
impl Stage<TestConfig> for Recording {
    async fn execute(&self, ctx: &StageContext, _config: &TestConfig) -> anyhow::Result<()> {
        self.calls.lock().push(ctx.name.clone());
        if self.fail {
            anyhow::bail!("{} exploded", ctx.name);
        }
        Ok(())
    }

    fn output_files(&self, config: &TestConfig) -> Vec<(String, PathBuf)> {
        vec![("marker".to_string(), config.out.join("marker.json"))]
    }
}

fn stage(name: &str, calls: &Calls, fail: bool) -> WorkflowStage<TestConfig> {
    WorkflowStage::new(
        name,
        format!("{name} stage"),
        Recording {
            calls: calls.clone(),
            fail,
        },
    )
}

fn pipeline(names: &[&str], failing: &[&str], calls: &Calls) -> Vec<WorkflowStage<TestConfig>> {
    names
        .iter()
        .map(|n| stage(n, calls, failing.contains(n)))
        .collect()
}

fn options(dir: &TempDir) -> CoordinatorOptions {
    CoordinatorOptions {
        progress_path: dir.path().join(".workflow_progress.json"),
        ..CoordinatorOptions::default()
    }
}

fn config(dir: &TempDir) -> TestConfig {
    TestConfig {
        out: dir.path().to_path_buf(),
    }
}

const FIVE: [&str; 5] = ["analysis", "prewarm", "errors", "loadtest", "optimize"];

async fn seed_checkpoint(dir: &TempDir, completed: &[&str]) -> ProgressStore {
    let store = ProgressStore::in_dir(dir.path());
    let mut progress = WorkflowProgress::new(serde_json::Value::Null);
    for stage in completed {
        progress.mark_completed(stage);
    }
    store.save(&progress).await.unwrap();
    store
}

#[tokio::test]
async fn resume_runs_only_stages_from_resume_point() {
    let dir = TempDir::new().unwrap();
    let store = seed_checkpoint(&dir, &["analysis", "prewarm"]).await;
    let calls = Calls::default();

    let coordinator = Coordinator::new(
        pipeline(&FIVE, &[], &calls),
        CoordinatorOptions {
            resume_from: Some("loadtest".to_string()),
            ..options(&dir)
        },
    );
    let result = coordinator.run(&config(&dir)).await.unwrap();

    assert_eq!(*calls.lock(), vec!["loadtest", "optimize"]);
    assert_eq!(result.status_of("analysis"), Some(StageStatus::AlreadyCompleted));
    assert_eq!(result.status_of("prewarm"), Some(StageStatus::AlreadyCompleted));
    assert_eq!(result.status_of("errors"), Some(StageStatus::AwaitingResume));
    assert_eq!(result.status_of("loadtest"), Some(StageStatus::Passed));
    assert_eq!(result.status_of("optimize"), Some(StageStatus::Passed));
    assert!(result.success);
    assert!(!store.exists().await);
}

#[tokio::test]
async fn stage_awaiting_resume_is_not_recorded() {
    let dir = TempDir::new().unwrap();
    let store = seed_checkpoint(&dir, &["analysis", "prewarm"]).await;
    let calls = Calls::default();

    // The last stage fails so the run aborts and the checkpoint survives.
    let coordinator = Coordinator::new(
        pipeline(&FIVE, &["optimize"], &calls),
        CoordinatorOptions {
            resume_from: Some("loadtest".to_string()),
            continue_on_error: false,
            ..options(&dir)
        },
    );
    let err = coordinator.run(&config(&dir)).await.unwrap_err();
    assert_eq!(err.stage(), Some("optimize"));

    let progress = store.load().await.unwrap();
    assert_eq!(progress.completed_stages, vec!["analysis", "prewarm", "loadtest"]);
    assert_eq!(progress.current_stage, "optimize");
}

#[tokio::test]
async fn abort_stops_at_first_failure_and_keeps_checkpoint() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();

    let coordinator = Coordinator::new(
        pipeline(&["a", "b", "c"], &["b"], &calls),
        CoordinatorOptions {
            continue_on_error: false,
            ..options(&dir)
        },
    );
    let err = coordinator.run(&config(&dir)).await.unwrap_err();

    assert_eq!(*calls.lock(), vec!["a", "b"]);
    match &err {
        WorkflowError::Aborted { stage, source } => {
            assert_eq!(stage, "b");
            assert!(source.to_string().contains("b exploded"));
        }
        other => panic!("expected abort, got {other:?}"),
    }

    let progress = coordinator.store().load().await.unwrap();
    assert_eq!(progress.completed_stages, vec!["a"]);
    assert_eq!(progress.current_stage, "b");
}

#[tokio::test]
async fn continue_on_error_runs_everything_and_clears_checkpoint() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();

    let coordinator = Coordinator::new(pipeline(&["a", "b", "c"], &["b"], &calls), options(&dir));
    let result = coordinator.run(&config(&dir)).await.unwrap();

    assert_eq!(*calls.lock(), vec!["a", "b", "c"]);
    assert!(!result.success);
    assert_eq!(result.status_of("a"), Some(StageStatus::Passed));
    assert_eq!(result.status_of("b"), Some(StageStatus::Failed));
    assert_eq!(result.status_of("c"), Some(StageStatus::Passed));

    let failed: Vec<_> = result.failed_stages().map(|s| s.name.as_str()).collect();
    assert_eq!(failed, vec!["b"]);
    assert!(result.stages[1].error.as_deref().unwrap().contains("b exploded"));

    assert!(!coordinator.store().exists().await);
}

#[tokio::test]
async fn disabled_stage_is_skipped_without_progress() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();

    let mut stages = pipeline(&["a", "b", "c"], &["c"], &calls);
    stages[1].enabled = false;

    let coordinator = Coordinator::new(
        stages,
        CoordinatorOptions {
            continue_on_error: false,
            ..options(&dir)
        },
    );
    coordinator.run(&config(&dir)).await.unwrap_err();

    assert_eq!(*calls.lock(), vec!["a", "c"]);
    let progress = coordinator.store().load().await.unwrap();
    assert_eq!(progress.completed_stages, vec!["a"]);
}

#[tokio::test]
async fn unknown_resume_stage_is_config_error() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();

    let coordinator = Coordinator::new(
        pipeline(&["a", "b"], &[], &calls),
        CoordinatorOptions {
            resume_from: Some("nope".to_string()),
            ..options(&dir)
        },
    );
    let err = coordinator.run(&config(&dir)).await.unwrap_err();

    assert!(matches!(err, WorkflowError::Config(_)));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn corrupt_checkpoint_is_moved_aside() {
    let dir = TempDir::new().unwrap();
    let store = ProgressStore::in_dir(dir.path());
    tokio::fs::write(store.path(), b"{ truncated").await.unwrap();
    let calls = Calls::default();

    let coordinator = Coordinator::new(pipeline(&["a", "b"], &[], &calls), options(&dir));
    let result = coordinator.run(&config(&dir)).await.unwrap();
    assert!(result.success);
    assert_eq!(*calls.lock(), vec!["a", "b"]);

    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    let mut quarantined = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(".corrupt-") {
            quarantined.push(entry.path());
        }
    }
    assert_eq!(quarantined.len(), 1);
    assert_eq!(tokio::fs::read(&quarantined[0]).await.unwrap(), b"{ truncated");
}

#[tokio::test]
async fn cancelled_run_stops_before_next_stage() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();
    let token = CancellationToken::new();
    token.cancel();

    let coordinator =
        Coordinator::new(pipeline(&["a", "b"], &[], &calls), options(&dir)).with_cancellation(token);
    let err = coordinator.run(&config(&dir)).await.unwrap_err();

    assert!(matches!(err, WorkflowError::Cancelled { ref stage } if stage == "a"));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn output_files_and_events() {
    let dir = TempDir::new().unwrap();
    let calls = Calls::default();

    let coordinator = Coordinator::new(pipeline(&["a", "b"], &["b"], &calls), options(&dir));
    let mut events = coordinator.subscribe();
    let result = coordinator.run(&config(&dir)).await.unwrap();

    assert_eq!(
        result.output_files.get("marker"),
        Some(&dir.path().join("marker.json"))
    );

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(match event {
            WorkflowEvent::StageStarted { stage } => format!("start:{stage}"),
            WorkflowEvent::StagePassed { stage, .. } => format!("pass:{stage}"),
            WorkflowEvent::StageFailed { stage, .. } => format!("fail:{stage}"),
            WorkflowEvent::StageSkipped { stage, .. } => format!("skip:{stage}"),
            WorkflowEvent::Finished { success } => format!("done:{success}"),
        });
    }
    assert_eq!(
        seen,
        vec!["start:a", "pass:a", "start:b", "fail:b", "done:false"]
    );
}

#[tokio::test]
async fn unwritable_checkpoint_never_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    // A regular file where the checkpoint's parent directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let calls = Calls::default();

    let coordinator = Coordinator::new(
        pipeline(&FIVE, &[], &calls),
        CoordinatorOptions {
            progress_path: blocker.join(".workflow_progress.json"),
            continue_on_error: false,
            ..CoordinatorOptions::default()
        },
    );
    let result = coordinator.run(&config(&dir)).await.unwrap();

    assert!(result.success);
    assert_eq!(*calls.lock(), FIVE.to_vec());
    for name in FIVE {
        assert_eq!(result.status_of(name), Some(StageStatus::Passed), "{name}");
    }
    assert!(!coordinator.store().exists().await);
    assert!(blocker.is_file());
}
