//! Worker pool with one bounded queue and one worker group per size category.
//!
//! Small, medium and large tasks never share a queue or a worker, so a burst of
//! large objects cannot starve small ones (and the reverse).

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NormalizedPoolConfig, WorkerPoolConfig};
use crate::task::{QueuedTask, Task, TaskContext, TaskError, TaskHandle, TaskOutcome};
use crate::{PoolError, SizeCategory};

/// Rejected submission. The task is handed back so the caller can retry it.
#[derive(Error)]
pub enum SubmitError<O> {
    #[error("{} queue is full", .0.category())]
    QueueFull(Task<O>),

    #[error("worker pool is shutting down")]
    ShuttingDown(Task<O>),
}

impl<O> SubmitError<O> {
    pub fn into_task(self) -> Task<O> {
        match self {
            Self::QueueFull(task) | Self::ShuttingDown(task) => task,
        }
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }
}

impl<O> std::fmt::Debug for SubmitError<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull(task) => f.debug_tuple("QueueFull").field(task).finish(),
            Self::ShuttingDown(task) => f.debug_tuple("ShuttingDown").field(task).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    active: AtomicUsize,
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub active: usize,
    pub queued_small: usize,
    pub queued_medium: usize,
    pub queued_large: usize,
}

/// A worker pool for size-categorized tasks.
pub struct WorkerPool<O> {
    config: NormalizedPoolConfig,
    /// Producer side of the three queues; `None` once shutdown begins.
    senders: Mutex<Option<Vec<flume::Sender<QueuedTask<O>>>>>,
    receivers: Vec<flume::Receiver<QueuedTask<O>>>,
    state: Mutex<PoolState>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
    counters: Arc<PoolCounters>,
}

impl<O: Send + 'static> WorkerPool<O> {
    /// Create a pool, normalizing the configuration.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        let config = config.normalize()?;
        let (senders, receivers): (Vec<_>, Vec<_>) = SizeCategory::ALL
            .iter()
            .map(|_| flume::bounded(config.queue_size))
            .unzip();

        Ok(Self {
            config,
            senders: Mutex::new(Some(senders)),
            receivers,
            state: Mutex::new(PoolState::Created),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(None),
            counters: Arc::new(PoolCounters::default()),
        })
    }

    /// Tie the pool to a parent token. Cancelling the parent cancels every
    /// in-flight task context; tasks still queued resolve as abandoned.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancellation_token = parent.child_token();
        self
    }

    /// Spawn the workers. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Running => return Err(PoolError::AlreadyStarted),
                PoolState::Stopped => return Err(PoolError::ShutDown),
                PoolState::Created => *state = PoolState::Running,
            }
        }

        info!(
            small = self.config.small_workers,
            medium = self.config.medium_workers,
            large = self.config.large_workers,
            queue_size = self.config.queue_size,
            "Starting worker pool"
        );

        let mut tasks = self.tasks.lock();
        let join_set = tasks.get_or_insert_with(JoinSet::new);

        for category in SizeCategory::ALL {
            for i in 0..self.config.workers_for(category) {
                let receiver = self.receivers[category.index()].clone();
                let token = self.cancellation_token.clone();
                let counters = self.counters.clone();
                let worker_timeout = self.config.worker_timeout;

                join_set.spawn(async move {
                    debug!(%category, worker = i, "Worker started");

                    // Runs until every sender is gone and the queue is empty.
                    // After cancellation queued tasks are resolved without
                    // running, so no handle is left waiting.
                    while let Ok(queued) = receiver.recv_async().await {
                        if token.is_cancelled() {
                            abandon(queued);
                            continue;
                        }
                        run_task(queued, &token, worker_timeout, &counters).await;
                    }

                    debug!(%category, worker = i, "Worker stopped");
                });
            }
        }

        Ok(())
    }

    /// Enqueue a task without blocking.
    ///
    /// A saturated queue rejects the task immediately with
    /// [`SubmitError::QueueFull`]; the queue is left untouched.
    pub fn submit(&self, task: Task<O>) -> Result<TaskHandle<O>, SubmitError<O>> {
        let senders = self.senders.lock();
        let Some(senders) = senders.as_ref() else {
            return Err(SubmitError::ShuttingDown(task));
        };

        let category = task.category();
        let (done, rx) = oneshot::channel();
        let handle = TaskHandle::new(task.id().to_string(), category, rx);

        match senders[category.index()].try_send(QueuedTask { task, done }) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
            Err(flume::TrySendError::Full(queued)) => {
                debug!(%category, task_id = queued.task.id(), "Queue full, rejecting task");
                Err(SubmitError::QueueFull(queued.task))
            }
            Err(flume::TrySendError::Disconnected(queued)) => {
                Err(SubmitError::ShuttingDown(queued.task))
            }
        }
    }

    /// Stop accepting tasks and drain what is queued or running.
    ///
    /// Waits at most `shutdown_timeout`; after that remaining tasks are
    /// cancelled and their handles resolve as abandoned. Calling this more
    /// than once, or before [`start`](Self::start), is fine.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), PoolState::Stopped);
        if previous == PoolState::Stopped {
            return;
        }

        info!(
            queued = self.total_queued(),
            active = self.counters.active.load(Ordering::Relaxed),
            "Shutting down worker pool"
        );

        // Without senders, workers exit as soon as their queue is empty.
        self.senders.lock().take();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    active = self.counters.active.load(Ordering::Relaxed),
                    queued = self.total_queued(),
                    "Shutdown timeout elapsed, cancelling remaining tasks"
                );
                self.cancellation_token.cancel();
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
            }
        }

        self.abandon_queued();
        self.cancellation_token.cancel();
        info!("Worker pool stopped");
    }

    fn abandon_queued(&self) {
        for receiver in &self.receivers {
            while let Ok(queued) = receiver.try_recv() {
                abandon(queued);
            }
        }
    }
}

fn abandon<O>(queued: QueuedTask<O>) {
    let QueuedTask { task, done } = queued;
    debug!(task_id = task.id(), category = %task.category(), "Abandoning queued task");
    let _ = done.send(TaskOutcome::abandoned(task.id().to_string(), task.category()));
}

impl<O> WorkerPool<O> {
    pub fn config(&self) -> &NormalizedPoolConfig {
        &self.config
    }

    /// Number of tasks waiting in a category's queue.
    pub fn queue_depth(&self, category: SizeCategory) -> usize {
        self.receivers[category.index()].len()
    }

    fn total_queued(&self) -> usize {
        self.receivers.iter().map(|r| r.len()).sum()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == PoolState::Running
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            queued_small: self.queue_depth(SizeCategory::Small),
            queued_medium: self.queue_depth(SizeCategory::Medium),
            queued_large: self.queue_depth(SizeCategory::Large),
        }
    }
}

impl<O> Drop for WorkerPool<O> {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn run_task<O>(
    queued: QueuedTask<O>,
    root: &CancellationToken,
    worker_timeout: Duration,
    counters: &PoolCounters,
) {
    let QueuedTask { task, done } = queued;
    let id = task.id().to_string();
    let category = task.category();

    let token = root.child_token();
    let started = Instant::now();
    let ctx = TaskContext {
        id: id.clone(),
        category,
        token: token.clone(),
        deadline: started + worker_timeout,
    };

    counters.active.fetch_add(1, Ordering::Relaxed);

    let work = AssertUnwindSafe((task.into_work())(ctx)).catch_unwind();
    tokio::pin!(work);

    let mut timed_out = false;
    let joined = tokio::select! {
        joined = &mut work => joined,
        _ = tokio::time::sleep(worker_timeout) => {
            timed_out = true;
            warn!(
                task_id = %id,
                %category,
                timeout = ?worker_timeout,
                "Task exceeded worker timeout, waiting for it to observe cancellation"
            );
            token.cancel();
            work.await
        }
    };

    counters.active.fetch_sub(1, Ordering::Relaxed);
    let elapsed = started.elapsed();

    let result = match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) if timed_out => Err(TaskError::TimedOut {
            after: worker_timeout,
            source,
        }),
        Ok(Err(source)) => Err(TaskError::Failed(source)),
        Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
    };

    if timed_out {
        counters.timed_out.fetch_add(1, Ordering::Relaxed);
    }
    match &result {
        Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
        Err(e) => {
            debug!(task_id = %id, %category, error = %e, "Task failed");
            counters.failed.fetch_add(1, Ordering::Relaxed)
        }
    };

    // The submitter may have stopped listening; that is not our problem.
    let _ = done.send(TaskOutcome {
        id,
        category,
        result,
        elapsed,
        timed_out,
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
