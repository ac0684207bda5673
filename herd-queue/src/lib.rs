//! # herd-queue: durable background jobs with at-least-once delivery
//!
//! Producers enqueue a job and get its id back immediately; workers claim
//! jobs in priority order, run the registered handler under a renewable lock
//! and record the outcome. Failed attempts are retried with exponential
//! backoff until the attempt budget is spent, and jobs whose worker died are
//! reclaimed once their lock expires.
//!
//! ## Guarantees
//!
//! - A job is never claimed by two workers at the same time.
//! - Every accepted job ends `completed` or `failed` as long as workers run.
//! - Handlers may run more than once for the same job (stall recovery), so
//!   side effects should be keyed on [`JobRun::job_id`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use herd_queue::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendWelcome {
//!     user_id: String,
//! }
//!
//! #[async_trait]
//! impl Job for SendWelcome {
//!     type Context = ();
//!     type Output = ();
//!
//!     const QUEUE: &'static str = "emails";
//!     const JOB_TYPE: &'static str = "send-welcome";
//!
//!     async fn execute(&self, _ctx: (), run: &JobRun) -> Result<(), JobError> {
//!         println!("welcoming {} (job {})", self.user_id, run.job_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> QueueResult<()> {
//! let queue = QueueAdapter::with_config(MemoryStore::new(), QueueConfig::from_env());
//! queue.register_job::<SendWelcome>(())?;
//! let workers = queue.start()?;
//!
//! let job_id = queue.enqueue_job(&SendWelcome { user_id: "u1".into() }, None).await?;
//! println!("queued {}", job_id);
//!
//! workers.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod job;
pub mod backend;
pub mod execution;
pub mod adapter;
pub mod observability;

// Core API exports
pub use adapter::{QueueAdapter, WorkerHandle};
pub use config::QueueConfig;
pub use types::{
    JobId, WorkerId, JobPriority, JobState, JobMessage, JobRecord, JobEvent, QueueStats,
    Backoff, EnqueueOptions, EnqueueRequest, JobDefaults, Retention,
    Clock, SystemClock, ManualClock,
};
pub use error::{QueueError, QueueResult, JobError};
pub use job::{Job, JobHandler, JobRun, HandlerRegistry};
pub use backend::JobStore;
pub use backend::reaper::{Reaper, ReapReport};
pub use execution::{Dispatcher, ExecutionOutcome, FailureHook, FailureHookSlot, JobExecutor, RetryDecision, RetryPolicy};

// Observability exports
pub use observability::{ObservabilityLayer, LiveMetrics};

// Backend implementations
#[cfg(feature = "memory")]
pub use backend::memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use backend::sqlite::SqliteStore;

/// Everything needed to define jobs and run a queue
pub mod prelude {
    pub use crate::{
        QueueAdapter, QueueConfig, WorkerHandle, Job, JobRun, JobStore,
    };

    pub use crate::{
        JobId, JobPriority, JobState, JobRecord, QueueStats, EnqueueOptions, Backoff, Retention,
        JobError, QueueError, QueueResult,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;

    pub use crate::{ObservabilityLayer, LiveMetrics};

    pub use async_trait::async_trait;
}
