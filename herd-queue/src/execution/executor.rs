use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    QueueResult, QueueError, JobError, JobId, JobRecord, JobState,
    backend::JobStore,
    job::{HandlerRegistry, JobRun},
    observability::ObservabilityLayer,
    types::WorkerId,
};
use super::retry::{RetryDecision, RetryPolicy};

/// Callback for jobs that reach `failed`. Best effort: invoked once per
/// terminal failure observed by this process, never retried.
pub type FailureHook = Arc<dyn Fn(&JobRecord) + Send + Sync>;

/// Hook slot shared between the adapter and running workers; read when a job fails
pub type FailureHookSlot = Arc<RwLock<Option<FailureHook>>>;

/// Run the current failure hook, containing any panic it raises
pub(crate) fn notify_failed(slot: &FailureHookSlot, record: &JobRecord) {
    let Some(hook) = slot.read().clone() else {
        return;
    };
    if std::panic::catch_unwind(AssertUnwindSafe(|| hook(record))).is_err() {
        error!("Failure hook panicked for job {}", record.id);
    }
}

/// How one execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Retrying { attempts: u32 },
    Failed { attempts: u32 },
    /// The lock was reclaimed while the handler ran; its result was discarded
    LockLost,
}

/// Runs a single claimed job to a recorded outcome
pub struct JobExecutor<S: JobStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    lock_duration: Duration,
    renew_interval: Duration,
    on_failed: FailureHookSlot,
    observability: Option<ObservabilityLayer>,
}

impl<S: JobStore + ?Sized + 'static> JobExecutor<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, lock_duration: Duration) -> Self {
        Self {
            store,
            registry,
            policy: RetryPolicy::default(),
            lock_duration,
            renew_interval: lock_duration / 2,
            on_failed: FailureHookSlot::default(),
            observability: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Heartbeat period. Values that would let the lock lapse between beats
    /// fall back to half the lock duration.
    pub fn with_renew_interval(mut self, renew_interval: Duration) -> Self {
        if renew_interval.is_zero() || renew_interval >= self.lock_duration {
            warn!(
                "Lock renew interval {:?} must be below lock duration {:?}, using {:?}",
                renew_interval,
                self.lock_duration,
                self.lock_duration / 2
            );
            self.renew_interval = self.lock_duration / 2;
        } else {
            self.renew_interval = renew_interval;
        }
        self
    }

    pub fn with_failure_hook(mut self, hook: Option<FailureHook>) -> Self {
        self.on_failed = Arc::new(RwLock::new(hook));
        self
    }

    /// Follow a hook slot that may be filled or replaced while jobs run
    pub fn with_failure_hook_slot(mut self, slot: FailureHookSlot) -> Self {
        self.on_failed = slot;
        self
    }

    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = Some(observability);
        self
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Execute `record`, which `worker_id` has just claimed
    #[instrument(skip(self, record), fields(job_id = %record.id, queue = record.queue(), job_type = record.job_type()))]
    pub async fn execute(&self, record: JobRecord, worker_id: &WorkerId) -> QueueResult<ExecutionOutcome> {
        let run = JobRun::from_record(&record);
        debug!("Processing attempt {} of {}", run.attempt, record.max_attempts());

        let started = Instant::now();
        let result = match self.registry.get(record.queue(), record.job_type()) {
            Ok(handler) => {
                let (stop_tx, heartbeat) = self.start_heartbeat(record.id.clone(), worker_id.clone());
                let result = AssertUnwindSafe(handler.handle(run))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(JobError::Retryable(panic_message(panic))));
                let _ = stop_tx.send(());
                let _ = heartbeat.await;
                result
            }
            Err(e) => Err(JobError::Permanent(e.to_string())),
        };

        if let Some(observability) = &self.observability {
            observability.record_execution_time(record.job_type(), started.elapsed());
        }

        match result {
            Ok(output) => self.complete(&record, worker_id, output).await,
            Err(job_error) => self.fail(&record, worker_id, job_error).await,
        }
    }

    async fn complete(&self, record: &JobRecord, worker_id: &WorkerId, output: Value) -> QueueResult<ExecutionOutcome> {
        match self.store.mark_completed(&record.id, worker_id, output).await {
            Ok(()) => {
                info!("Job {} completed", record.id);
                Ok(ExecutionOutcome::Completed)
            }
            Err(e) if lock_lost(&e) => {
                warn!("Job {} finished after losing its lock: {}", record.id, e);
                Ok(ExecutionOutcome::LockLost)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, record: &JobRecord, worker_id: &WorkerId, job_error: JobError) -> QueueResult<ExecutionOutcome> {
        let retry_at = match self.policy.decide(record, &job_error, self.store.now()) {
            RetryDecision::Retry { at, .. } => Some(at),
            RetryDecision::Exhausted => None,
        };

        let updated = match self
            .store
            .mark_failed(&record.id, worker_id, job_error.to_string(), retry_at)
            .await
        {
            Ok(updated) => updated,
            Err(e) if lock_lost(&e) => {
                warn!("Job {} failed after losing its lock: {}", record.id, e);
                return Ok(ExecutionOutcome::LockLost);
            }
            Err(e) => return Err(e),
        };

        if updated.state == JobState::Failed {
            error!(
                "Job {} failed permanently after {} attempt(s): {}",
                updated.id, updated.attempts, job_error
            );
            notify_failed(&self.on_failed, &updated);
            Ok(ExecutionOutcome::Failed { attempts: updated.attempts })
        } else {
            warn!(
                "Job {} failed (attempt {}), retrying at {}: {}",
                updated.id, updated.attempts, updated.next_run_at, job_error
            );
            Ok(ExecutionOutcome::Retrying { attempts: updated.attempts })
        }
    }

    /// Extend the lock every `renew_interval` until told to stop or the lock is gone
    fn start_heartbeat(&self, job_id: JobId, worker_id: WorkerId) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let store = self.store.clone();
        let lock_duration = self.lock_duration;
        let renew_interval = self.renew_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match store.extend_lock(&job_id, &worker_id, lock_duration).await {
                            Ok(()) => debug!("Extended lock on job {}", job_id),
                            Err(e) if lock_lost(&e) => {
                                warn!("Stopped heartbeat for job {}: {}", job_id, e);
                                break;
                            }
                            Err(e) => warn!("Heartbeat for job {} failed: {}", job_id, e),
                        }
                    }
                }
            }
        });

        (stop_tx, handle)
    }
}

fn lock_lost(err: &QueueError) -> bool {
    matches!(
        err,
        QueueError::LockMismatch(_) | QueueError::InvalidTransition { .. } | QueueError::JobNotFound(_)
    )
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {}", detail)
}
