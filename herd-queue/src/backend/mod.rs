#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod reaper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

use crate::{
    QueueResult, JobId, JobRecord, JobState, JobEvent, QueueStats,
    types::{EnqueueRequest, WorkerId},
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Storage primitives for the queue. Every state change goes through one of
/// these atomic operations; nothing else mutates a job record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a waiting job. On error nothing was written.
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<JobId>;

    /// Atomically move the best eligible waiting job to active under `worker_id`.
    /// Concurrent callers never receive the same job.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lock_duration: Duration,
    ) -> QueueResult<Option<JobRecord>>;

    /// Heartbeat: push the lock expiry forward
    async fn extend_lock(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        lock_duration: Duration,
    ) -> QueueResult<()>;

    /// active -> completed, then apply the job's retention
    async fn mark_completed(&self, job_id: &JobId, worker_id: &WorkerId, result: Value) -> QueueResult<()>;

    /// active -> delayed when `retry_at` is set and attempts remain, else active -> failed.
    /// Returns the updated record.
    async fn mark_failed(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<JobRecord>;

    /// Promote delayed jobs whose backoff has elapsed. Returns how many moved.
    async fn sweep_delayed(&self) -> QueueResult<usize>;

    /// Return active jobs with expired locks to waiting, or fail them once they
    /// have stalled more than `max_stalled_count` times. Returns the updated records.
    async fn reclaim_stalled(&self, max_stalled_count: u32) -> QueueResult<Vec<JobRecord>>;

    /// Delete the oldest completed records of `queue` beyond the newest `keep`
    async fn prune_completed(&self, queue: &str, keep: usize) -> QueueResult<usize>;

    /// Get full job record
    async fn get(&self, job_id: &JobId) -> QueueResult<JobRecord>;

    /// Per-state counts for one queue
    async fn stats(&self, queue: &str) -> QueueResult<QueueStats>;

    /// Records of `queue` in `state`, oldest first
    async fn list(&self, queue: &str, state: JobState, limit: usize) -> QueueResult<Vec<JobRecord>>;

    /// Names of every queue that has held a job
    async fn queues(&self) -> QueueResult<Vec<String>>;

    /// Event stream for observability (boxed for stable Rust)
    fn event_stream(&self) -> BoxStream<JobEvent>;

    /// The store's notion of "now"; retry times are computed against it
    fn now(&self) -> DateTime<Utc>;
}

/// Convert a lock/backoff duration for timestamp arithmetic
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
