//! Sequential, resumable stage runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::progress::{DEFAULT_PROGRESS_FILE, ProgressStore, WorkflowProgress};
use crate::stage::{StageContext, WorkflowStage};
use crate::{ProgressError, WorkflowError};

/// Run policy for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Stage to resume at. Earlier stages are not executed.
    pub resume_from: Option<String>,
    /// Keep going after a stage fails instead of aborting the run.
    pub continue_on_error: bool,
    /// Location of the checkpoint file.
    pub progress_path: PathBuf,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            resume_from: None,
            continue_on_error: true,
            progress_path: PathBuf::from(DEFAULT_PROGRESS_FILE),
        }
    }
}

/// How a stage was handled during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    /// Completed by an earlier run and skipped on resume.
    AlreadyCompleted,
    /// Before the resume point and never completed. Not executed, not recorded.
    AwaitingResume,
    Disabled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::AlreadyCompleted => "already completed",
            Self::AwaitingResume => "skipped, awaiting resume point",
            Self::Disabled => "disabled",
        }
    }

    /// Whether the stage body was invoked in this run.
    pub fn executed(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub duration: Duration,
    pub error: Option<String>,
}

impl StageReport {
    fn skipped(name: &str, status: StageStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            duration: Duration::ZERO,
            error: None,
        }
    }
}

/// Summary of a run that reached the end of the stage list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// False if any stage failed, even though the run itself completed.
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub stages: Vec<StageReport>,
    pub output_files: BTreeMap<String, PathBuf>,
}

impl WorkflowResult {
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
    }

    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.name == stage).map(|s| s.status)
    }
}

/// Progress notifications for UIs and logs.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    StageStarted {
        stage: String,
    },
    StagePassed {
        stage: String,
        duration_secs: f64,
    },
    StageFailed {
        stage: String,
        error: String,
    },
    StageSkipped {
        stage: String,
        status: StageStatus,
    },
    Finished {
        success: bool,
    },
}

/// Runs an ordered list of stages, one at a time, against one configuration.
pub struct Coordinator<C> {
    stages: Vec<WorkflowStage<C>>,
    options: CoordinatorOptions,
    store: ProgressStore,
    token: CancellationToken,
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl<C> Coordinator<C>
where
    C: Serialize + Send + Sync,
{
    pub fn new(stages: Vec<WorkflowStage<C>>, options: CoordinatorOptions) -> Self {
        let store = ProgressStore::new(options.progress_path.clone());
        let (event_tx, _) = broadcast::channel(64);
        Self {
            stages,
            options,
            store,
            token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Use `token` as the run token. Cancelling it stops the run before the
    /// next stage and is forwarded into the running one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Execute the workflow.
    ///
    /// Returns `Err(WorkflowError::Aborted)` when a stage fails and
    /// `continue_on_error` is off; the checkpoint is kept in that case. A run
    /// that reaches the end deletes the checkpoint, whatever the outcome of
    /// individual stages.
    pub async fn run(&self, config: &C) -> Result<WorkflowResult, WorkflowError> {
        let resume_from = self.options.resume_from.as_deref();
        if let Some(target) = resume_from
            && !self.stages.iter().any(|s| s.name == target)
        {
            return Err(WorkflowError::config(format!(
                "unknown resume stage '{target}', expected one of: {}",
                self.stage_names().join(", ")
            )));
        }

        let snapshot = serde_json::to_value(config)
            .map_err(|e| WorkflowError::config(format!("configuration is not serializable: {e}")))?;
        let mut progress = self.load_progress(snapshot).await;

        let started_at = Utc::now();
        let run_start = Instant::now();
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut gate_open = resume_from.is_none();

        info!(
            stages = self.stages.len(),
            resume_from = resume_from.unwrap_or("-"),
            continue_on_error = self.options.continue_on_error,
            "Starting workflow"
        );

        for stage in &self.stages {
            let name = stage.name.as_str();

            if !gate_open {
                if Some(name) == resume_from {
                    info!(stage = %name, "Reached resume point");
                    gate_open = true;
                } else if progress.is_completed(name) {
                    info!(stage = %name, "Stage already completed, skipping");
                    reports.push(self.skip(name, StageStatus::AlreadyCompleted));
                    continue;
                } else {
                    // Not recorded as completed: a later resume from an
                    // earlier point will run it again.
                    warn!(
                        stage = %name,
                        "Stage was never completed but lies before the resume point, skipping"
                    );
                    reports.push(self.skip(name, StageStatus::AwaitingResume));
                    continue;
                }
            }

            if !stage.enabled {
                info!(stage = %name, "Stage disabled, skipping");
                reports.push(self.skip(name, StageStatus::Disabled));
                continue;
            }

            if self.token.is_cancelled() {
                warn!(stage = %name, "Workflow cancelled, checkpoint kept for resume");
                return Err(WorkflowError::Cancelled {
                    stage: name.to_string(),
                });
            }

            progress.current_stage = name.to_string();
            progress.touch();
            self.checkpoint(&progress).await;

            info!(stage = %name, description = %stage.description, "Running stage");
            let _ = self.event_tx.send(WorkflowEvent::StageStarted {
                stage: name.to_string(),
            });

            let ctx = StageContext::new(name, self.token.child_token());
            let stage_start = Instant::now();
            let outcome = stage.stage.execute(&ctx, config).await;
            let duration = stage_start.elapsed();

            match outcome {
                Ok(()) => {
                    progress.mark_completed(name);
                    progress.output_files.extend(stage.stage.output_files(config));
                    progress.touch();
                    self.checkpoint(&progress).await;

                    info!(stage = %name, duration_secs = duration.as_secs_f64(), "Stage passed");
                    let _ = self.event_tx.send(WorkflowEvent::StagePassed {
                        stage: name.to_string(),
                        duration_secs: duration.as_secs_f64(),
                    });
                    reports.push(StageReport {
                        name: name.to_string(),
                        status: StageStatus::Passed,
                        duration,
                        error: None,
                    });
                }
                Err(e) => {
                    error!(stage = %name, error = %format!("{e:#}"), "Stage failed");
                    let _ = self.event_tx.send(WorkflowEvent::StageFailed {
                        stage: name.to_string(),
                        error: format!("{e:#}"),
                    });

                    if self.token.is_cancelled() {
                        return Err(WorkflowError::Cancelled {
                            stage: name.to_string(),
                        });
                    }
                    if !self.options.continue_on_error {
                        return Err(WorkflowError::Aborted {
                            stage: name.to_string(),
                            source: e,
                        });
                    }

                    reports.push(StageReport {
                        name: name.to_string(),
                        status: StageStatus::Failed,
                        duration,
                        error: Some(format!("{e:#}")),
                    });
                }
            }
        }

        let success = reports.iter().all(|r| r.status != StageStatus::Failed);
        let result = WorkflowResult {
            success,
            started_at,
            duration: run_start.elapsed(),
            stages: reports,
            output_files: progress.output_files,
        };

        if let Err(e) = self.store.delete().await {
            warn!(error = %e, "Failed to remove workflow checkpoint");
        }

        info!(
            success,
            duration_secs = result.duration.as_secs_f64(),
            "Workflow finished"
        );
        let _ = self.event_tx.send(WorkflowEvent::Finished { success });

        Ok(result)
    }

    fn skip(&self, name: &str, status: StageStatus) -> StageReport {
        let _ = self.event_tx.send(WorkflowEvent::StageSkipped {
            stage: name.to_string(),
            status,
        });
        StageReport::skipped(name, status)
    }

    async fn load_progress(&self, snapshot: serde_json::Value) -> WorkflowProgress {
        let mut progress = match self.store.load().await {
            Ok(progress) => {
                info!(
                    path = %self.store.path().display(),
                    completed = ?progress.completed_stages,
                    "Loaded workflow checkpoint"
                );
                progress
            }
            Err(ProgressError::NotFound(_)) => return WorkflowProgress::new(snapshot),
            Err(e @ ProgressError::Parse { .. }) => {
                match self.store.quarantine().await {
                    Ok(moved) => error!(
                        error = %e,
                        moved_to = %moved.display(),
                        "Workflow checkpoint is corrupt, starting fresh"
                    ),
                    Err(move_err) => error!(
                        error = %e,
                        move_error = %move_err,
                        "Workflow checkpoint is corrupt and could not be moved aside, starting fresh"
                    ),
                }
                return WorkflowProgress::new(snapshot);
            }
            Err(e) => {
                warn!(error = %e, "Could not read workflow checkpoint, starting fresh");
                return WorkflowProgress::new(snapshot);
            }
        };

        progress.configuration = snapshot;
        progress
    }

    async fn checkpoint(&self, progress: &WorkflowProgress) {
        if let Err(e) = self.store.save(progress).await {
            warn!(error = %e, stage = %progress.current_stage, "Failed to save workflow checkpoint");
        }
    }
}
