//! # warm-workflow
//!
//! Runs a fixed, ordered list of named stages against one configuration value.
//!
//! Stages run strictly one after another. The [`Coordinator`] honours
//! per-stage enable flags, a single resume point and a continue-on-error
//! policy, and checkpoints its progress to disk through a [`ProgressStore`]
//! so an interrupted or aborted run can be resumed.

mod coordinator;
mod error;
mod progress;
mod stage;

pub use coordinator::{
    Coordinator, CoordinatorOptions, StageReport, StageStatus, WorkflowEvent, WorkflowResult,
};
pub use error::{ProgressError, WorkflowError};
pub use progress::{DEFAULT_PROGRESS_FILE, ProgressStore, WorkflowProgress};
pub use stage::{Stage, StageContext, WorkflowStage};
