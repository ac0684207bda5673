use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, WorkerId};

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job was enqueued
    Enqueued {
        job_id: JobId,
        queue: String,
        job_type: String,
        at: DateTime<Utc>,
    },

    /// Job was claimed by a worker
    Claimed {
        job_id: JobId,
        queue: String,
        worker_id: WorkerId,
        locked_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Attempt failed, retry scheduled
    Delayed {
        job_id: JobId,
        queue: String,
        attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Backoff elapsed, job is waiting again
    Promoted {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Completed {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    /// Job failed permanently
    Failed {
        job_id: JobId,
        queue: String,
        error: String,
        at: DateTime<Utc>,
    },

    /// Lock expired without a heartbeat; job returned to waiting
    Stalled {
        job_id: JobId,
        queue: String,
        stalled_count: u32,
        at: DateTime<Utc>,
    },

    /// Completed record removed by retention
    Pruned {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Claimed { .. } => "claimed",
            Self::Delayed { .. } => "delayed",
            Self::Promoted { .. } => "promoted",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
            Self::Pruned { .. } => "pruned",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Delayed { job_id, .. }
            | Self::Promoted { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. }
            | Self::Pruned { job_id, .. } => job_id,
        }
    }

    /// Get the queue from any event
    pub fn queue(&self) -> &str {
        match self {
            Self::Enqueued { queue, .. }
            | Self::Claimed { queue, .. }
            | Self::Delayed { queue, .. }
            | Self::Promoted { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Stalled { queue, .. }
            | Self::Pruned { queue, .. } => queue,
        }
    }
}
