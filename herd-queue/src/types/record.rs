use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, JobMessage, JobPriority, WorkerId};
use crate::{QueueError, QueueResult};

/// Job state lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued and eligible once `next_run_at` has passed
    Waiting,

    /// Claimed by exactly one worker
    Active,

    /// Failed an attempt and waiting for its backoff to elapse
    Delayed,

    /// Handler succeeded (terminal)
    Completed,

    /// Retries exhausted or permanent error (terminal)
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Delayed,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if the job is in a terminal state (completed or failed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.name() == s)
            .ok_or_else(|| format!("Invalid job state: {}", s))
    }
}

/// Job record - mutable runtime state stored by the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier
    pub id: JobId,

    /// Immutable job message data
    pub message: JobMessage,

    /// Current job state
    pub state: JobState,

    /// Failed executions so far
    pub attempts: u32,

    /// Not dispatched before this instant
    pub next_run_at: DateTime<Utc>,

    /// Handler output, set on completion
    pub result: Option<Value>,

    /// Last error message (if any)
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Lock holder while active
    pub worker_id: Option<WorkerId>,

    /// When the current lock expires (if active)
    pub locked_until: Option<DateTime<Utc>>,

    /// How many times the job was reclaimed after its lock expired
    pub stalled_count: u32,

    /// Insertion sequence; FIFO tie-break for identical timestamps
    pub seq: u64,
}

impl JobRecord {
    /// Create a new waiting job record
    pub fn new(id: JobId, message: JobMessage, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            message,
            state: JobState::Waiting,
            attempts: 0,
            next_run_at: now,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            worker_id: None,
            locked_until: None,
            stalled_count: 0,
            seq,
        }
    }

    pub fn queue(&self) -> &str {
        &self.message.queue
    }

    pub fn job_type(&self) -> &str {
        &self.message.job_type
    }

    pub fn payload(&self) -> &Value {
        &self.message.payload
    }

    pub fn priority(&self) -> JobPriority {
        self.message.priority
    }

    pub fn max_attempts(&self) -> u32 {
        self.message.max_attempts
    }

    /// Whether another failure would still leave attempts in the budget
    pub fn can_retry(&self) -> bool {
        self.attempts + 1 < self.message.max_attempts
    }

    /// Waiting and past its `next_run_at`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.next_run_at <= now
    }

    /// Delayed and its backoff has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Delayed && self.next_run_at <= now
    }

    /// Check if the lock has expired
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.locked_until) {
            (JobState::Active, Some(locked_until)) => locked_until < now,
            _ => false,
        }
    }

    /// Ordering key among waiting jobs of the same queue
    pub fn dispatch_key(&self) -> (JobPriority, DateTime<Utc>, u64) {
        (self.message.priority, self.created_at, self.seq)
    }

    fn invalid(&self, to: JobState) -> QueueError {
        QueueError::InvalidTransition {
            job_id: self.id.clone(),
            from: self.state,
            to,
        }
    }

    fn ensure_holder(&self, worker_id: &WorkerId, to: JobState) -> QueueResult<()> {
        if self.state != JobState::Active {
            return Err(self.invalid(to));
        }
        if self.worker_id.as_ref() != Some(worker_id) {
            return Err(QueueError::LockMismatch(self.id.clone()));
        }
        Ok(())
    }

    fn release_lock(&mut self, now: DateTime<Utc>) {
        self.worker_id = None;
        self.locked_until = None;
        self.updated_at = now;
    }

    /// waiting -> active
    pub fn claim(&mut self, worker_id: WorkerId, locked_until: DateTime<Utc>, now: DateTime<Utc>) -> QueueResult<()> {
        if !self.is_eligible(now) {
            return Err(self.invalid(JobState::Active));
        }
        self.state = JobState::Active;
        self.worker_id = Some(worker_id);
        self.locked_until = Some(locked_until);
        self.updated_at = now;
        Ok(())
    }

    /// Heartbeat from the lock holder
    pub fn extend_lock(&mut self, worker_id: &WorkerId, locked_until: DateTime<Utc>, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure_holder(worker_id, JobState::Active)?;
        self.locked_until = Some(locked_until);
        self.updated_at = now;
        Ok(())
    }

    /// active -> completed
    pub fn complete(&mut self, worker_id: &WorkerId, result: Value, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure_holder(worker_id, JobState::Completed)?;
        self.state = JobState::Completed;
        self.result = Some(result);
        self.release_lock(now);
        Ok(())
    }

    /// active -> delayed, consuming one attempt
    pub fn delay(&mut self, worker_id: &WorkerId, error: String, retry_at: DateTime<Utc>, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure_holder(worker_id, JobState::Delayed)?;
        if !self.can_retry() {
            return Err(self.invalid(JobState::Delayed));
        }
        self.state = JobState::Delayed;
        self.attempts += 1;
        self.next_run_at = retry_at;
        self.error = Some(error);
        self.release_lock(now);
        Ok(())
    }

    /// active -> failed after a handler error
    pub fn fail(&mut self, worker_id: &WorkerId, error: String, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure_holder(worker_id, JobState::Failed)?;
        self.state = JobState::Failed;
        self.attempts = (self.attempts + 1).min(self.message.max_attempts);
        self.error = Some(error);
        self.release_lock(now);
        Ok(())
    }

    /// delayed -> waiting once the backoff has elapsed
    pub fn promote(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if !self.is_due(now) {
            return Err(self.invalid(JobState::Waiting));
        }
        self.state = JobState::Waiting;
        self.updated_at = now;
        Ok(())
    }

    /// Expired lock: active -> waiting, or active -> failed past the stall limit.
    /// Returns the new state.
    pub fn reclaim(&mut self, max_stalled_count: u32, now: DateTime<Utc>) -> QueueResult<JobState> {
        if !self.lock_expired(now) {
            return Err(self.invalid(JobState::Waiting));
        }
        self.stalled_count += 1;
        if self.stalled_count > max_stalled_count {
            self.state = JobState::Failed;
            self.error = Some("job stalled more than allowable limit".to_string());
        } else {
            self.state = JobState::Waiting;
            self.next_run_at = now;
        }
        self.release_lock(now);
        Ok(self.state)
    }
}
