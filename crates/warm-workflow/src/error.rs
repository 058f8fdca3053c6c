use std::path::PathBuf;
use thiserror::Error;

/// Checkpoint persistence failures.
///
/// `NotFound` and `Parse` are kept apart so that a truncated checkpoint is
/// never mistaken for "no previous run".
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("no checkpoint at {}", .0.display())]
    NotFound(PathBuf),

    #[error("checkpoint {} is corrupt: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProgressError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Run-level failures returned by [`Coordinator::run`](crate::Coordinator::run).
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("invalid workflow configuration: {0}")]
    Config(String),

    /// A stage failed with `continue_on_error` disabled. The checkpoint is
    /// kept so the run can be resumed.
    #[error("workflow aborted at stage '{stage}': {source:#}")]
    Aborted {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("workflow cancelled at stage '{stage}'")]
    Cancelled { stage: String },
}

impl WorkflowError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Name of the stage the run stopped at, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Aborted { stage, .. } | Self::Cancelled { stage } => Some(stage),
            Self::Config(_) => None,
        }
    }
}
