//! Units of work and their completion signals.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{SizeCategory, SizeThresholds};

/// Error type returned by work functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type WorkFn<O> = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<O, BoxError>> + Send>;

/// Why a task did not produce a value.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The work function returned an error.
    #[error("task failed: {0}")]
    Failed(#[source] BoxError),

    /// The work function failed after its deadline had passed.
    #[error("task timed out after {after:?}: {source}")]
    TimedOut {
        after: Duration,
        #[source]
        source: BoxError,
    },

    /// The work function panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The pool stopped before the task ran.
    #[error("task abandoned before execution")]
    Abandoned,
}

/// Context handed to a work function.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: String,
    pub category: SizeCategory,
    /// Cancelled when the deadline passes or the pool is torn down.
    pub token: CancellationToken,
    pub deadline: Instant,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A unit of dispatchable work.
///
/// The category is derived once from the thresholds at construction and
/// decides which queue receives the task.
pub struct Task<O> {
    id: String,
    size_bytes: u64,
    category: SizeCategory,
    work: WorkFn<O>,
}

impl<O: Send + 'static> Task<O> {
    /// Create a task whose payload is moved into `work` when it runs.
    pub fn new<P, F, Fut, E>(
        id: impl Into<String>,
        size_bytes: u64,
        thresholds: &SizeThresholds,
        payload: P,
        work: F,
    ) -> Self
    where
        P: Send + 'static,
        F: FnOnce(P, TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let work: WorkFn<O> = Box::new(move |ctx| {
            async move { work(payload, ctx).await.map_err(Into::into) }.boxed()
        });
        Self {
            id: id.into(),
            size_bytes,
            category: thresholds.classify(size_bytes),
            work,
        }
    }
}

impl<O> Task<O> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn category(&self) -> SizeCategory {
        self.category
    }

    pub(crate) fn into_work(self) -> WorkFn<O> {
        self.work
    }
}

impl<O> std::fmt::Debug for Task<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("size_bytes", &self.size_bytes)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Final report for one task, delivered through its [`TaskHandle`].
#[derive(Debug)]
pub struct TaskOutcome<O> {
    pub id: String,
    pub category: SizeCategory,
    pub result: Result<O, TaskError>,
    pub elapsed: Duration,
    /// Set when the work function ran past the worker timeout,
    /// whether or not it eventually succeeded.
    pub timed_out: bool,
}

impl<O> TaskOutcome<O> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub(crate) fn abandoned(id: String, category: SizeCategory) -> Self {
        Self {
            id,
            category,
            result: Err(TaskError::Abandoned),
            elapsed: Duration::ZERO,
            timed_out: false,
        }
    }
}

/// Completion signal for a submitted task.
///
/// The pool owns the sending half and always resolves it, so awaiting a
/// handle cannot hang on a work function that forgot to signal.
#[derive(Debug)]
pub struct TaskHandle<O> {
    id: String,
    category: SizeCategory,
    rx: oneshot::Receiver<TaskOutcome<O>>,
}

impl<O> TaskHandle<O> {
    pub(crate) fn new(
        id: String,
        category: SizeCategory,
        rx: oneshot::Receiver<TaskOutcome<O>>,
    ) -> Self {
        Self { id, category, rx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> SizeCategory {
        self.category
    }

    /// Wait for the task to finish.
    pub async fn wait(self) -> TaskOutcome<O> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without a report: the task was still queued when
            // the pool was torn down.
            Err(_) => TaskOutcome::abandoned(self.id, self.category),
        }
    }
}

pub(crate) struct QueuedTask<O> {
    pub(crate) task: Task<O>,
    pub(crate) done: oneshot::Sender<TaskOutcome<O>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_fixed_at_creation() {
        let thresholds = SizeThresholds::new(10, 100).unwrap();
        let task: Task<()> = Task::new("a", 50, &thresholds, (), |_, _| async {
            Ok::<_, BoxError>(())
        });
        assert_eq!(task.category(), SizeCategory::Medium);
        assert_eq!(task.size_bytes(), 50);
        assert_eq!(task.id(), "a");
    }

    #[tokio::test]
    async fn test_dropped_sender_resolves_as_abandoned() {
        let (tx, rx) = oneshot::channel::<TaskOutcome<()>>();
        let handle = TaskHandle::new("x".into(), SizeCategory::Large, rx);
        drop(tx);
        let outcome = handle.wait().await;
        assert!(matches!(outcome.result, Err(TaskError::Abandoned)));
        assert_eq!(outcome.category, SizeCategory::Large);
    }
}
