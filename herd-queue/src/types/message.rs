use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Backoff, EnqueueOptions, JobDefaults, JobPriority, Retention};
use crate::{QueueError, QueueResult};

/// A unit of work as submitted by a producer, before defaults are applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    #[serde(default)]
    pub options: EnqueueOptions,
}

impl EnqueueRequest {
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }
}

/// Job message - immutable submission data with defaults resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Target queue name
    pub queue: String,

    /// Job type identifier for dispatch
    pub job_type: String,

    /// Handler input
    pub payload: Value,

    /// Job priority for ordering
    pub priority: JobPriority,

    /// Total execution attempts allowed
    pub max_attempts: u32,

    /// Delay strategy between attempts
    pub backoff: Backoff,

    /// Record retention once completed
    pub retention: Retention,
}

impl JobMessage {
    /// Resolve a request against store defaults. Rejects requests that could
    /// never be dispatched.
    pub fn resolve(request: EnqueueRequest, defaults: &JobDefaults) -> QueueResult<Self> {
        if request.queue.trim().is_empty() {
            return Err(QueueError::EnqueueFailure("queue name must not be empty".to_string()));
        }
        if request.job_type.trim().is_empty() {
            return Err(QueueError::EnqueueFailure("job type must not be empty".to_string()));
        }

        let max_attempts = request.options.max_attempts.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::EnqueueFailure("max_attempts must be at least 1".to_string()));
        }

        let backoff = defaults.backoff_for(&request.options);

        Ok(Self {
            priority: request.options.priority.unwrap_or(defaults.priority),
            retention: request.options.retention.unwrap_or(defaults.retention),
            max_attempts,
            backoff,
            queue: request.queue,
            job_type: request.job_type,
            payload: request.payload,
        })
    }
}
