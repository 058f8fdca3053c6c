//! The contract between the coordinator and the work it sequences.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Name the stage is registered under.
    pub name: String,
    /// Cancelled when the run is interrupted. Stages should pass it on to
    /// any pool or subprocess they start.
    pub token: CancellationToken,
}

impl StageContext {
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }
}

/// A unit of the workflow.
///
/// Implementations must tolerate being re-run after a partial run, and must
/// name their output files deterministically so that [`Stage::output_files`]
/// stays accurate.
#[async_trait]
pub trait Stage<C>: Send + Sync {
    async fn execute(&self, ctx: &StageContext, config: &C) -> anyhow::Result<()>;

    /// Files this stage produces, keyed by a logical name.
    fn output_files(&self, _config: &C) -> Vec<(String, PathBuf)> {
        Vec::new()
    }
}

/// A named, optionally disabled stage in the ordered workflow list.
pub struct WorkflowStage<C> {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub stage: Arc<dyn Stage<C>>,
}

impl<C> WorkflowStage<C> {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        stage: impl Stage<C> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            enabled: true,
            stage: Arc::new(stage),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl<C> std::fmt::Debug for WorkflowStage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStage")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
