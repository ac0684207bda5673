use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    QueueResult, QueueError, JobId, JobRecord, JobState, JobEvent, JobPriority, QueueStats,
    backend::{chrono_duration, BoxStream, JobStore},
    types::{Clock, EnqueueRequest, JobDefaults, JobMessage, Retention, SystemClock, WorkerId},
};

type WaitingKey = (JobPriority, DateTime<Utc>, u64, JobId);
type DelayedKey = (DateTime<Utc>, u64, JobId);

/// Per-queue indexes
#[derive(Default)]
struct QueueIndex {
    /// Waiting jobs in dispatch order (priority, created_at, seq)
    waiting: BTreeSet<WaitingKey>,

    /// Completed jobs still on record, oldest first
    completed: VecDeque<JobId>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<String, QueueIndex>,
    delayed: BTreeSet<DelayedKey>,
    active: HashSet<JobId>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed {
            return Err(QueueError::StoreUnavailable("memory store is closed".to_string()));
        }
        Ok(())
    }

    fn record_mut(&mut self, job_id: &JobId) -> QueueResult<&mut JobRecord> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
    }

    fn index(&mut self, queue: &str) -> &mut QueueIndex {
        self.queues.entry(queue.to_string()).or_default()
    }

    /// Drop the oldest completed records of `queue` beyond `keep`
    fn prune(&mut self, queue: &str, keep: usize) -> Vec<JobId> {
        let mut pruned = Vec::new();
        let Some(index) = self.queues.get_mut(queue) else {
            return pruned;
        };
        while index.completed.len() > keep {
            if let Some(job_id) = index.completed.pop_front() {
                if matches!(self.jobs.get(&job_id), Some(record) if record.state == JobState::Completed) {
                    self.jobs.remove(&job_id);
                    pruned.push(job_id);
                }
            }
        }
        pruned
    }
}

/// In-memory job store. One write lock per operation makes every
/// transition, including claims, atomic.
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    defaults: JobDefaults,
    clock: Arc<dyn Clock>,

    /// Event broadcaster for observability
    pub(crate) event_broadcaster: broadcast::Sender<JobEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_defaults(JobDefaults::default())
    }

    /// Store that applies `defaults` to unset enqueue options
    pub fn with_defaults(defaults: JobDefaults) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            defaults,
            clock: Arc::new(SystemClock),
            event_broadcaster,
        }
    }

    /// Swap the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Simulate losing the backing store; every operation fails until [`reopen`](Self::reopen)
    pub fn close(&self) {
        self.inner.write().closed = true;
    }

    pub fn reopen(&self) {
        self.inner.write().closed = false;
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    fn emit_pruned(&self, queue: &str, pruned: Vec<JobId>, at: DateTime<Utc>) {
        for job_id in pruned {
            self.emit(JobEvent::Pruned { job_id, queue: queue.to_string(), at });
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<JobId> {
        let now = self.clock.now();
        let message = JobMessage::resolve(request, &self.defaults)?;
        let job_id = JobId::new();
        let queue = message.queue.clone();
        let job_type = message.job_type.clone();

        {
            let mut inner = self.inner.write();
            inner.ensure_open()?;

            let seq = inner.next_seq;
            inner.next_seq += 1;

            let record = JobRecord::new(job_id.clone(), message, seq, now);
            let key = (record.priority(), record.created_at, seq, job_id.clone());

            inner.jobs.insert(job_id.clone(), record);
            inner.index(&queue).waiting.insert(key);
        }

        debug!("Enqueued job {} ({}/{})", job_id, queue, job_type);
        self.emit(JobEvent::Enqueued { job_id: job_id.clone(), queue, job_type, at: now });

        Ok(job_id)
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lock_duration: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let now = self.clock.now();
        let locked_until = now + chrono_duration(lock_duration);

        let claimed = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;

            let Some(index) = inner.queues.get(queue) else {
                return Ok(None);
            };

            let next = index
                .waiting
                .iter()
                .find(|(_, _, _, job_id)| {
                    inner.jobs.get(job_id).is_some_and(|record| record.is_eligible(now))
                })
                .cloned();

            let Some(key) = next else {
                return Ok(None);
            };

            inner.index(queue).waiting.remove(&key);
            let job_id = key.3;
            let record = inner.record_mut(&job_id)?;
            record.claim(worker_id.clone(), locked_until, now)?;
            let claimed = record.clone();
            inner.active.insert(job_id);
            claimed
        };

        self.emit(JobEvent::Claimed {
            job_id: claimed.id.clone(),
            queue: queue.to_string(),
            worker_id: worker_id.clone(),
            locked_until,
            at: now,
        });

        Ok(Some(claimed))
    }

    async fn extend_lock(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        lock_duration: Duration,
    ) -> QueueResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        inner.ensure_open()?;
        inner
            .record_mut(job_id)?
            .extend_lock(worker_id, now + chrono_duration(lock_duration), now)
    }

    async fn mark_completed(&self, job_id: &JobId, worker_id: &WorkerId, result: Value) -> QueueResult<()> {
        let now = self.clock.now();

        let (queue, pruned) = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;

            let record = inner.record_mut(job_id)?;
            record.complete(worker_id, result, now)?;
            let queue = record.queue().to_string();
            let retention = record.message.retention;

            inner.active.remove(job_id);
            inner.index(&queue).completed.push_back(job_id.clone());

            let pruned = match retention {
                Retention::Keep => Vec::new(),
                Retention::Remove => {
                    inner.index(&queue).completed.retain(|id| id != job_id);
                    inner.jobs.remove(job_id);
                    vec![job_id.clone()]
                }
                Retention::KeepLast(keep) => inner.prune(&queue, keep),
            };
            (queue, pruned)
        };

        self.emit(JobEvent::Completed { job_id: job_id.clone(), queue: queue.clone(), at: now });
        self.emit_pruned(&queue, pruned, now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<JobRecord> {
        let now = self.clock.now();

        let updated = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;

            let record = inner.record_mut(job_id)?;
            match retry_at {
                Some(retry_at) if record.can_retry() => {
                    record.delay(worker_id, error.clone(), retry_at, now)?;
                }
                _ => record.fail(worker_id, error.clone(), now)?,
            }
            let updated = record.clone();

            inner.active.remove(job_id);
            if updated.state == JobState::Delayed {
                inner.delayed.insert((updated.next_run_at, updated.seq, job_id.clone()));
            }
            updated
        };

        let queue = updated.queue().to_string();
        match updated.state {
            JobState::Delayed => self.emit(JobEvent::Delayed {
                job_id: job_id.clone(),
                queue,
                attempts: updated.attempts,
                retry_at: updated.next_run_at,
                error,
                at: now,
            }),
            _ => self.emit(JobEvent::Failed { job_id: job_id.clone(), queue, error, at: now }),
        }

        Ok(updated)
    }

    async fn sweep_delayed(&self) -> QueueResult<usize> {
        let now = self.clock.now();

        let promoted = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;

            let due: Vec<DelayedKey> = inner
                .delayed
                .iter()
                .take_while(|(run_at, _, _)| *run_at <= now)
                .cloned()
                .collect();

            let mut promoted = Vec::with_capacity(due.len());
            for key in due {
                inner.delayed.remove(&key);
                let job_id = key.2;
                let Some(record) = inner.jobs.get_mut(&job_id) else {
                    continue;
                };
                if let Err(e) = record.promote(now) {
                    warn!("Skipping delayed job {}: {}", job_id, e);
                    continue;
                }
                let waiting_key = (record.priority(), record.created_at, record.seq, job_id.clone());
                let queue = record.queue().to_string();
                inner.index(&queue).waiting.insert(waiting_key);
                promoted.push((job_id, queue));
            }
            promoted
        };

        let count = promoted.len();
        for (job_id, queue) in promoted {
            self.emit(JobEvent::Promoted { job_id, queue, at: now });
        }
        if count > 0 {
            debug!("Promoted {} delayed jobs", count);
        }
        Ok(count)
    }

    async fn reclaim_stalled(&self, max_stalled_count: u32) -> QueueResult<Vec<JobRecord>> {
        let now = self.clock.now();

        let reclaimed = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;

            let expired: Vec<JobId> = inner
                .active
                .iter()
                .filter(|job_id| inner.jobs.get(*job_id).is_some_and(|record| record.lock_expired(now)))
                .cloned()
                .collect();

            let mut reclaimed = Vec::with_capacity(expired.len());
            for job_id in expired {
                inner.active.remove(&job_id);
                let record = inner.record_mut(&job_id)?;
                let state = record.reclaim(max_stalled_count, now)?;
                let updated = record.clone();
                if state == JobState::Waiting {
                    let key = (updated.priority(), updated.created_at, updated.seq, job_id.clone());
                    inner.index(updated.queue()).waiting.insert(key);
                }
                reclaimed.push(updated);
            }
            reclaimed
        };

        for record in &reclaimed {
            let queue = record.queue().to_string();
            self.emit(JobEvent::Stalled {
                job_id: record.id.clone(),
                queue: queue.clone(),
                stalled_count: record.stalled_count,
                at: now,
            });
            if record.state == JobState::Failed {
                self.emit(JobEvent::Failed {
                    job_id: record.id.clone(),
                    queue,
                    error: record.error.clone().unwrap_or_default(),
                    at: now,
                });
            }
        }

        Ok(reclaimed)
    }

    async fn prune_completed(&self, queue: &str, keep: usize) -> QueueResult<usize> {
        let now = self.clock.now();
        let pruned = {
            let mut inner = self.inner.write();
            inner.ensure_open()?;
            inner.prune(queue, keep)
        };
        let count = pruned.len();
        self.emit_pruned(queue, pruned, now);
        Ok(count)
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        let inner = self.inner.read();
        inner.ensure_open()?;
        inner
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let inner = self.inner.read();
        inner.ensure_open()?;

        let mut stats = QueueStats::default();
        for record in inner.jobs.values().filter(|record| record.queue() == queue) {
            stats.add(record.state, 1);
        }
        Ok(stats)
    }

    async fn list(&self, queue: &str, state: JobState, limit: usize) -> QueueResult<Vec<JobRecord>> {
        let inner = self.inner.read();
        inner.ensure_open()?;

        let mut records: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|record| record.queue() == queue && record.state == state)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.created_at, record.seq));
        records.truncate(limit);
        Ok(records)
    }

    async fn queues(&self) -> QueueResult<Vec<String>> {
        let inner = self.inner.read();
        inner.ensure_open()?;

        let mut queues: Vec<String> = inner.queues.keys().cloned().collect();
        queues.sort();
        Ok(queues)
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        let receiver = self.event_broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver)
            .filter_map(|result| result.ok());

        Box::pin(stream)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Test helpers for deterministic testing
impl MemoryStore {
    /// Force a lock to expire without waiting for the lock duration
    pub fn force_lock_expiry(&self, job_id: &JobId) -> QueueResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let record = inner.record_mut(job_id)?;
        if record.state == JobState::Active {
            record.locked_until = Some(now - chrono::Duration::seconds(1));
        }
        Ok(())
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            defaults: self.defaults.clone(),
            clock: self.clock.clone(),
            event_broadcaster: self.event_broadcaster.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnqueueOptions, ManualClock};
    use serde_json::json;

    const LOCK: Duration = Duration::from_secs(30);

    fn create_request(priority: i32) -> EnqueueRequest {
        EnqueueRequest::new("post-creation", "create-post", json!({"content": "hi"}))
            .with_options(EnqueueOptions::new().with_priority(priority))
    }

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = MemoryStore::new().with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn test_enqueue_claim() {
        let store = MemoryStore::new();
        let worker = WorkerId::from("w1");

        let job_id = store.enqueue(create_request(10)).await.unwrap();
        let record = store.get(&job_id).await.unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.attempts, 0);

        let claimed = store.claim_next("post-creation", &worker, LOCK).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.worker_id, Some(worker.clone()));

        assert!(store.claim_next("post-creation", &worker, LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_unknown_queue_is_empty() {
        let store = MemoryStore::new();
        let claimed = store.claim_next("nope", &WorkerId::from("w1"), LOCK).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_enqueue_without_side_effects() {
        let store = MemoryStore::new();
        store.close();

        let err = store.enqueue(create_request(1)).await.unwrap_err();
        assert!(err.is_unavailable());

        store.reopen();
        let stats = store.stats("post-creation").await.unwrap();
        assert_eq!(stats, QueueStats::default());
    }

    #[tokio::test]
    async fn test_mark_failed_delays_then_sweep_promotes() {
        let (store, clock) = store_with_clock();
        let worker = WorkerId::from("w1");

        let job_id = store.enqueue(create_request(10)).await.unwrap();
        store.claim_next("post-creation", &worker, LOCK).await.unwrap().unwrap();

        let retry_at = store.now() + chrono::Duration::seconds(1);
        let record = store.mark_failed(&job_id, &worker, "boom".into(), Some(retry_at)).await.unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert_eq!(record.attempts, 1);

        assert_eq!(store.sweep_delayed().await.unwrap(), 0);
        assert!(store.claim_next("post-creation", &worker, LOCK).await.unwrap().is_none());

        clock.advance_ms(1000);
        assert_eq!(store.sweep_delayed().await.unwrap(), 1);
        assert_eq!(store.get(&job_id).await.unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_remove_on_complete_prunes_record() {
        let store = MemoryStore::new();
        let worker = WorkerId::from("w1");
        let request = create_request(1).with_options(EnqueueOptions::new().remove_on_complete());

        let job_id = store.enqueue(request).await.unwrap();
        store.claim_next("post-creation", &worker, LOCK).await.unwrap().unwrap();
        store.mark_completed(&job_id, &worker, json!({"id": 1})).await.unwrap();

        assert!(matches!(store.get(&job_id).await, Err(QueueError::JobNotFound(_))));
        assert_eq!(store.stats("post-creation").await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn test_keep_last_retention() {
        let store = MemoryStore::new();
        let worker = WorkerId::from("w1");
        let options = EnqueueOptions::new().with_retention(Retention::KeepLast(2));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job_id = store.enqueue(create_request(1).with_options(options.clone())).await.unwrap();
            store.claim_next("post-creation", &worker, LOCK).await.unwrap().unwrap();
            store.mark_completed(&job_id, &worker, json!(null)).await.unwrap();
            ids.push(job_id);
        }

        assert!(store.get(&ids[0]).await.is_err());
        assert!(store.get(&ids[1]).await.is_ok());
        assert_eq!(store.stats("post-creation").await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_prune_never_touches_unfinished_jobs() {
        let store = MemoryStore::new();
        let worker = WorkerId::from("w1");

        let done = store.enqueue(create_request(1)).await.unwrap();
        store.claim_next("post-creation", &worker, LOCK).await.unwrap().unwrap();
        store.mark_completed(&done, &worker, json!(null)).await.unwrap();
        let pending = store.enqueue(create_request(1)).await.unwrap();

        assert_eq!(store.prune_completed("post-creation", 0).await.unwrap(), 1);
        assert!(store.get(&done).await.is_err());
        assert_eq!(store.get(&pending).await.unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_reclaim_expired_lock() {
        let store = MemoryStore::new();
        let first = WorkerId::from("w1");
        let second = WorkerId::from("w2");

        let job_id = store.enqueue(create_request(1)).await.unwrap();
        store.claim_next("post-creation", &first, LOCK).await.unwrap().unwrap();

        assert!(store.reclaim_stalled(2).await.unwrap().is_empty());

        store.force_lock_expiry(&job_id).unwrap();
        let reclaimed = store.reclaim_stalled(2).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].state, JobState::Waiting);

        let again = store.claim_next("post-creation", &second, LOCK).await.unwrap().unwrap();
        assert_eq!(again.id, job_id);

        // The original worker lost its lock
        let err = store.mark_completed(&job_id, &first, json!(null)).await.unwrap_err();
        assert!(matches!(err, QueueError::LockMismatch(_)));
        store.mark_completed(&job_id, &second, json!(null)).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_alive() {
        let (store, clock) = store_with_clock();
        let worker = WorkerId::from("w1");

        store.enqueue(create_request(1)).await.unwrap();
        let job = store.claim_next("post-creation", &worker, LOCK).await.unwrap().unwrap();

        clock.advance_ms(20_000);
        store.extend_lock(&job.id, &worker, LOCK).await.unwrap();
        clock.advance_ms(20_000);

        assert!(store.reclaim_stalled(2).await.unwrap().is_empty());
        assert_eq!(store.get(&job.id).await.unwrap().state, JobState::Active);
    }
}
