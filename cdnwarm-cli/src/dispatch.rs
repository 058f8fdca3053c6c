//! Feeding a batch of tasks through a [`WorkerPool`].
//!
//! Submission never blocks, so a batch larger than a queue is fed in rounds:
//! tasks rejected with `QueueFull` are kept in order and retried once some
//! in-flight work has finished.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warm_pool::{SizeCategory, SubmitError, Task, TaskOutcome, WorkerPool};

/// Pause before resubmitting when nothing is in flight to wait on.
const RESUBMIT_INTERVAL: Duration = Duration::from_millis(10);

/// How long submitted tasks may keep reporting after cancellation.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks that ran past the worker timeout, successful or not.
    pub timed_out: usize,
    /// Tasks never handed to the pool because of cancellation or shutdown.
    pub not_submitted: usize,
    /// Submitted tasks whose outcome was not awaited after cancellation.
    #[serde(default)]
    pub abandoned: usize,
}

/// Submit every task to a started `pool` and wait for all of them.
///
/// `on_outcome` is called once per finished task, on the calling task, in
/// completion order. Cancelling `token` stops further submissions; outcomes
/// of tasks already in the pool are collected for at most [`CANCEL_GRACE`]
/// and anything still outstanding after that is counted as abandoned.
pub async fn run_all<O, F>(
    pool: &WorkerPool<O>,
    tasks: Vec<Task<O>>,
    token: &CancellationToken,
    mut on_outcome: F,
) -> DispatchSummary
where
    O: Send + 'static,
    F: FnMut(TaskOutcome<O>),
{
    let mut summary = DispatchSummary::default();
    let mut pending: VecDeque<Task<O>> = tasks.into();
    let mut in_flight = FuturesUnordered::new();

    let mut record = |outcome: TaskOutcome<O>, summary: &mut DispatchSummary| {
        if outcome.timed_out {
            summary.timed_out += 1;
        }
        if outcome.is_success() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        on_outcome(outcome);
    };

    let mut give_up_at: Option<tokio::time::Instant> = None;

    loop {
        if token.is_cancelled() {
            if !pending.is_empty() {
                debug!(remaining = pending.len(), "Dispatch cancelled, dropping unsubmitted tasks");
                summary.not_submitted += pending.len();
                pending.clear();
            }
            give_up_at.get_or_insert_with(|| tokio::time::Instant::now() + CANCEL_GRACE);
        }

        if !pending.is_empty() {
            // Once a category's queue reports full, hold back the rest of that
            // category for this round so its tasks stay in order.
            let mut blocked: HashSet<SizeCategory> = HashSet::new();
            let mut deferred = VecDeque::new();

            while let Some(task) = pending.pop_front() {
                if blocked.contains(&task.category()) {
                    deferred.push_back(task);
                    continue;
                }
                match pool.submit(task) {
                    Ok(handle) => {
                        summary.submitted += 1;
                        in_flight.push(handle.wait());
                    }
                    Err(SubmitError::QueueFull(task)) => {
                        blocked.insert(task.category());
                        deferred.push_back(task);
                    }
                    Err(SubmitError::ShuttingDown(_)) => {
                        let dropped = 1 + pending.len() + deferred.len();
                        warn!(dropped, "Worker pool shut down during dispatch");
                        summary.not_submitted += dropped;
                        pending.clear();
                        deferred.clear();
                        break;
                    }
                }
            }
            pending = deferred;
        }

        if let Some(deadline) = give_up_at {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some(outcome) => record(outcome, &mut summary),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        outstanding = in_flight.len(),
                        "Tasks still running after cancellation, no longer waiting"
                    );
                    summary.abandoned += in_flight.len();
                    break;
                }
            }
        } else if pending.is_empty() {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some(outcome) => record(outcome, &mut summary),
                    None => break,
                },
                _ = token.cancelled() => {}
            }
        } else {
            tokio::select! {
                Some(outcome) = in_flight.next() => record(outcome, &mut summary),
                _ = tokio::time::sleep(RESUBMIT_INTERVAL) => {}
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use warm_pool::{BoxError, MIN_QUEUE_SIZE, SizeThresholds, WorkerPoolConfig};

    fn pool() -> WorkerPool<usize> {
        let config = WorkerPoolConfig::with_total_workers(3).with_category_workers(1, 1, 1);
        let pool = WorkerPool::new(config).unwrap();
        pool.start().unwrap();
        pool
    }

    fn tasks(n: usize) -> Vec<Task<usize>> {
        let thresholds = SizeThresholds::new(10, 100).unwrap();
        (0..n)
            .map(|i| {
                Task::new(format!("t{i}"), 1, &thresholds, i, |i, _| async move {
                    Ok::<_, BoxError>(i)
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_larger_than_queue_completes() {
        let pool = pool();
        let n = MIN_QUEUE_SIZE * 2 + 17;
        let token = CancellationToken::new();

        let mut seen = Vec::new();
        let summary = run_all(&pool, tasks(n), &token, |outcome| {
            seen.push(outcome.result.unwrap());
        })
        .await;

        assert_eq!(summary.submitted, n);
        assert_eq!(summary.succeeded, n);
        assert_eq!(summary.not_submitted, 0);
        seen.sort_unstable();
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let pool = pool();
        let thresholds = SizeThresholds::default();
        let batch = vec![
            Task::new("ok", 1, &thresholds, 1usize, |v, _| async move { Ok::<_, BoxError>(v) }),
            Task::new("bad", 1, &thresholds, 2usize, |_, _| async move {
                Err::<usize, _>("nope")
            }),
        ];
        let summary = run_all(&pool, batch, &CancellationToken::new(), |_| {}).await;
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_submits_nothing() {
        let pool = pool();
        let token = CancellationToken::new();
        token.cancel();

        let summary = run_all(&pool, tasks(5), &token, |_| {}).await;
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.not_submitted, 5);
        pool.shutdown().await;
    }

    fn waiting_tasks(n: usize) -> Vec<Task<usize>> {
        let thresholds = SizeThresholds::new(10, 100).unwrap();
        (0..n)
            .map(|i| {
                Task::new(format!("w{i}"), 1, &thresholds, i, |i, ctx| async move {
                    ctx.token.cancelled().await;
                    Ok::<_, BoxError>(i)
                })
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_with_queued_tasks_returns() {
        let token = CancellationToken::new();
        let config = WorkerPoolConfig::with_total_workers(3).with_category_workers(1, 1, 1);
        let pool: WorkerPool<usize> = WorkerPool::new(config).unwrap().with_cancellation(&token);
        pool.start().unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let mut outcomes = 0;
        let summary = tokio::time::timeout(
            Duration::from_secs(3),
            run_all(&pool, waiting_tasks(5), &token, |_| outcomes += 1),
        )
        .await
        .expect("dispatch must return after cancellation");

        assert_eq!(summary.submitted, 5);
        assert_eq!(outcomes, 5);
        // One task was running and saw the cancellation; the rest never ran.
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.abandoned, 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_stops_waiting_on_unbound_pool() {
        // The pool does not share the dispatch token, so its tasks never
        // observe the cancellation.
        let config = WorkerPoolConfig::with_total_workers(3)
            .with_category_workers(1, 1, 1)
            .with_shutdown_timeout(Duration::from_millis(50));
        let pool: WorkerPool<usize> = WorkerPool::new(config).unwrap();
        pool.start().unwrap();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let summary = tokio::time::timeout(
            CANCEL_GRACE + Duration::from_secs(2),
            run_all(&pool, waiting_tasks(3), &token, |_| {}),
        )
        .await
        .expect("dispatch must give up after the grace period");

        assert_eq!(summary.submitted, 3);
        assert_eq!(summary.abandoned, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_pool_counts_unsubmitted() {
        let pool = pool();
        pool.shutdown().await;

        let summary = run_all(&pool, tasks(4), &CancellationToken::new(), |_| {}).await;
        assert_eq!(summary.not_submitted, 4);
        assert_eq!(summary.submitted, 0);
    }
}
