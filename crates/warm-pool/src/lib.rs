//! # warm-pool
//!
//! A size-aware concurrent worker pool.
//!
//! Every task is classified once, by byte size, into one of three categories.
//! Each category has its own bounded FIFO queue and its own group of
//! long-lived workers:
//!
//! - [`SizeThresholds`] / [`classify`] map byte counts to a [`SizeCategory`]
//! - [`WorkerPoolConfig`] describes the sizing policy and normalizes it
//! - [`WorkerPool`] runs [`Task`]s and resolves each [`TaskHandle`]
//!
//! Submission never blocks: a full queue hands the task back through
//! [`SubmitError::QueueFull`] and the caller decides when to retry.

use thiserror::Error;

mod config;
mod pool;
mod size;
mod task;

pub use config::{DEFAULT_QUEUE_MULTIPLIER, MIN_QUEUE_SIZE, NormalizedPoolConfig, WorkerPoolConfig};
pub use pool::{PoolStats, SubmitError, WorkerPool};
pub use size::{SizeCategory, SizeThresholds, classify};
pub use task::{BoxError, Task, TaskContext, TaskError, TaskHandle, TaskOutcome};

/// Pool-level errors. Task failures are never reported here.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("worker pool has been shut down")]
    ShutDown,
}

impl PoolError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
