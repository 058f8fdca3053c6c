//! Pool sizing policy and its normalization.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{PoolError, SizeCategory};

/// Smallest queue capacity a pool will ever use.
pub const MIN_QUEUE_SIZE: usize = 1000;

/// Default multiplier applied to the worker total when sizing queues.
pub const DEFAULT_QUEUE_MULTIPLIER: f64 = 3.0;

/// Share of the worker total given to each category when unset (percent).
const SMALL_SHARE: usize = 30;
const MEDIUM_SHARE: usize = 30;
const LARGE_SHARE: usize = 40;

/// Configuration for a worker pool, as supplied by the caller.
///
/// Per-category counts are signed so that values coming straight from the
/// command line can be validated: `0` means "derive from `total_workers`",
/// negative values are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Total worker budget used to derive unset per-category counts.
    pub total_workers: usize,
    pub small_workers: i64,
    pub medium_workers: i64,
    pub large_workers: i64,
    /// Explicit per-queue capacity. `0` derives it from the multiplier.
    pub queue_size: usize,
    pub queue_multiplier: f64,
    /// Deadline passed to each work function.
    ///
    /// Advisory: the task's token is cancelled when it elapses, but the
    /// worker keeps waiting until the work function returns.
    pub worker_timeout: Duration,
    /// Upper bound on how long [`shutdown`](crate::WorkerPool::shutdown) drains.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            total_workers: 10,
            small_workers: 0,
            medium_workers: 0,
            large_workers: 0,
            queue_size: 0,
            queue_multiplier: DEFAULT_QUEUE_MULTIPLIER,
            worker_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_total_workers(total_workers: usize) -> Self {
        Self {
            total_workers,
            ..Self::default()
        }
    }

    pub fn with_category_workers(mut self, small: i64, medium: i64, large: i64) -> Self {
        self.small_workers = small;
        self.medium_workers = medium;
        self.large_workers = large;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Validate and resolve this configuration into concrete numbers.
    pub fn normalize(&self) -> Result<NormalizedPoolConfig, PoolError> {
        let total = self.total_workers;
        let small = resolve_workers(SizeCategory::Small, self.small_workers, total, SMALL_SHARE)?;
        let medium = resolve_workers(SizeCategory::Medium, self.medium_workers, total, MEDIUM_SHARE)?;
        let large = resolve_workers(SizeCategory::Large, self.large_workers, total, LARGE_SHARE)?;

        if !self.queue_multiplier.is_finite() || self.queue_multiplier < 0.0 {
            return Err(PoolError::config(format!(
                "queue multiplier must be a non-negative number, got {}",
                self.queue_multiplier
            )));
        }
        if self.worker_timeout.is_zero() {
            return Err(PoolError::config("worker timeout must be greater than zero"));
        }

        let workers = small + medium + large;
        let requested = if self.queue_size > 0 {
            self.queue_size
        } else {
            (workers as f64 * self.queue_multiplier).ceil() as usize
        };

        Ok(NormalizedPoolConfig {
            small_workers: small,
            medium_workers: medium,
            large_workers: large,
            queue_size: requested.max(MIN_QUEUE_SIZE),
            worker_timeout: self.worker_timeout,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

fn resolve_workers(
    category: SizeCategory,
    explicit: i64,
    total: usize,
    share: usize,
) -> Result<usize, PoolError> {
    match explicit {
        n if n < 0 => Err(PoolError::config(format!(
            "{category} worker count must not be negative, got {n}"
        ))),
        0 => Ok((total * share / 100).max(1)),
        n => Ok(n as usize),
    }
}

/// Fully resolved pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPoolConfig {
    pub small_workers: usize,
    pub medium_workers: usize,
    pub large_workers: usize,
    /// Capacity of each of the three queues.
    pub queue_size: usize,
    pub worker_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl NormalizedPoolConfig {
    pub fn workers_for(&self, category: SizeCategory) -> usize {
        match category {
            SizeCategory::Small => self.small_workers,
            SizeCategory::Medium => self.medium_workers,
            SizeCategory::Large => self.large_workers,
        }
    }

    pub fn total_workers(&self) -> usize {
        self.small_workers + self.medium_workers + self.large_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_split_of_hundred() {
        let n = WorkerPoolConfig::with_total_workers(100).normalize().unwrap();
        assert_eq!(
            (n.small_workers, n.medium_workers, n.large_workers),
            (30, 30, 40)
        );
        assert_eq!(n.total_workers(), 100);
    }

    #[test]
    fn test_default_split_of_ten() {
        let n = WorkerPoolConfig::with_total_workers(10).normalize().unwrap();
        assert_eq!(
            (n.small_workers, n.medium_workers, n.large_workers),
            (3, 3, 4)
        );
    }

    #[test]
    fn test_tiny_total_floors_to_one() {
        let n = WorkerPoolConfig::with_total_workers(1).normalize().unwrap();
        assert_eq!(
            (n.small_workers, n.medium_workers, n.large_workers),
            (1, 1, 1)
        );
    }

    #[test]
    fn test_explicit_counts_override_total() {
        let n = WorkerPoolConfig::with_total_workers(10)
            .with_category_workers(20, 0, 7)
            .normalize()
            .unwrap();
        assert_eq!(
            (n.small_workers, n.medium_workers, n.large_workers),
            (20, 3, 7)
        );
    }

    #[test]
    fn test_negative_count_is_config_error() {
        let err = WorkerPoolConfig::with_total_workers(10)
            .with_category_workers(0, -1, 0)
            .normalize()
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
        assert!(err.to_string().contains("medium"));
    }

    #[test]
    fn test_queue_floor() {
        for total in [1, 10, 100, 333] {
            let n = WorkerPoolConfig::with_total_workers(total).normalize().unwrap();
            assert_eq!(n.queue_size, MIN_QUEUE_SIZE, "total={total}");
        }
    }

    #[test]
    fn test_queue_scales_above_floor() {
        let n = WorkerPoolConfig::with_total_workers(1000).normalize().unwrap();
        assert_eq!(n.queue_size, 3000);

        let n = WorkerPoolConfig::with_total_workers(10)
            .with_queue_size(5000)
            .normalize()
            .unwrap();
        assert_eq!(n.queue_size, 5000);

        let n = WorkerPoolConfig::with_total_workers(10)
            .with_queue_size(10)
            .normalize()
            .unwrap();
        assert_eq!(n.queue_size, MIN_QUEUE_SIZE);
    }

    #[test]
    fn test_invalid_multiplier() {
        let mut config = WorkerPoolConfig::default();
        config.queue_multiplier = f64::NAN;
        assert!(config.normalize().is_err());
        config.queue_multiplier = -1.0;
        assert!(config.normalize().is_err());
    }
}
