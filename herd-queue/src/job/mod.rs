pub mod registry;

pub use registry::{HandlerRegistry, JobHandler, JobRun};

use crate::{EnqueueOptions, JobError, JobPriority};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

/// A typed job. The struct itself is the payload; it is stored as JSON and
/// decoded again before each attempt.
#[async_trait]
pub trait Job: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Shared dependencies handed to every execution
    type Context: Send + Sync + Clone + 'static;

    /// Stored as the job's result on completion
    type Output: Send + Sync + Serialize + 'static;

    /// Queue this job is routed to
    const QUEUE: &'static str;

    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    const PRIORITY: JobPriority = JobPriority::NORMAL;

    /// Total execution attempts, first run included
    const MAX_ATTEMPTS: u32 = 3;

    /// Run one attempt. `run.job_id` is stable across retries and stalls, so
    /// side effects keyed on it stay idempotent under redelivery.
    async fn execute(&self, ctx: Self::Context, run: &JobRun) -> Result<Self::Output, JobError>;

    /// Reject malformed payloads before they are enqueued
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Enqueue options derived from the associated constants
    fn options() -> EnqueueOptions {
        EnqueueOptions::new()
            .with_priority(Self::PRIORITY)
            .with_max_attempts(Self::MAX_ATTEMPTS)
    }
}
