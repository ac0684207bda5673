use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{QueueResult, QueueError, Job, JobError, JobId, JobRecord};

/// One execution attempt as seen by a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,

    /// 1-based; the first execution is attempt 1
    pub attempt: u32,

    pub payload: Value,
}

impl JobRun {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id.clone(),
            queue: record.queue().to_string(),
            job_type: record.job_type().to_string(),
            attempt: record.attempts + 1,
            payload: record.payload().clone(),
        }
    }
}

/// Type-erased job handler for runtime dispatch
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Check a payload before it is enqueued
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Execute one attempt; the returned value becomes the job's result
    async fn handle(&self, run: JobRun) -> Result<Value, JobError>;
}

/// Adapter from a typed [`Job`] to [`JobHandler`]
struct TypedHandler<J: Job> {
    ctx: J::Context,
    _job: PhantomData<fn() -> J>,
}

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let job = J::deserialize(payload).map_err(|e| e.to_string())?;
        job.validate()
    }

    async fn handle(&self, run: JobRun) -> Result<Value, JobError> {
        let job: J = serde_json::from_value(run.payload.clone())?;
        let output = job.execute(self.ctx.clone(), &run).await?;

        serde_json::to_value(output)
            .map_err(|e| JobError::Permanent(format!("Failed to encode result: {}", e)))
    }
}

/// Closure handler registered through [`HandlerRegistry::register_fn`]
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRun) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn handle(&self, run: JobRun) -> Result<Value, JobError> {
        (self.f)(run).await
    }
}

/// Handlers keyed by `(queue, job_type)`
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed job with the context its executions receive
    pub fn register<J: Job>(&mut self, ctx: J::Context) -> QueueResult<()> {
        let handler = TypedHandler::<J> { ctx, _job: PhantomData };
        self.register_handler(J::QUEUE, J::JOB_TYPE, Arc::new(handler))
    }

    /// Register an async closure as the handler for `queue`/`job_type`
    pub fn register_fn<F, Fut>(&mut self, queue: &str, job_type: &str, f: F) -> QueueResult<()>
    where
        F: Fn(JobRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.register_handler(queue, job_type, Arc::new(FnHandler { f }))
    }

    pub fn register_handler(
        &mut self,
        queue: &str,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<()> {
        let key = (queue.to_string(), job_type.to_string());
        if self.handlers.contains_key(&key) {
            return Err(QueueError::HandlerAlreadyRegistered {
                queue: key.0,
                job_type: key.1,
            });
        }

        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, queue: &str, job_type: &str) -> QueueResult<Arc<dyn JobHandler>> {
        self.handlers
            .get(&(queue.to_string(), job_type.to_string()))
            .cloned()
            .ok_or_else(|| QueueError::HandlerNotRegistered {
                queue: queue.to_string(),
                job_type: job_type.to_string(),
            })
    }

    /// Lookup plus payload validation, as done before every enqueue
    pub fn validate(&self, queue: &str, job_type: &str, payload: &Value) -> QueueResult<()> {
        let handler = self.get(queue, job_type)?;
        handler
            .validate(payload)
            .map_err(|reason| QueueError::InvalidPayload {
                job_type: job_type.to_string(),
                reason,
            })
    }

    pub fn is_registered(&self, queue: &str, job_type: &str) -> bool {
        self.handlers.contains_key(&(queue.to_string(), job_type.to_string()))
    }

    /// Queues with at least one handler, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.handlers.keys().map(|(queue, _)| queue.clone()).collect();
        queues.sort();
        queues.dedup();
        queues
    }
}
