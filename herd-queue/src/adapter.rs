use std::future::Future;
use std::sync::Arc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::{
    QueueResult, QueueError, JobId, Job, JobError, JobRecord, JobState, QueueStats,
    backend::{reaper::Reaper, JobStore},
    config::QueueConfig,
    execution::{Dispatcher, FailureHookSlot, JobExecutor, QueueWakers, RetryPolicy},
    job::{HandlerRegistry, JobRun},
    observability::ObservabilityLayer,
    types::{EnqueueOptions, EnqueueRequest},
};

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    dispatchers: Vec<(oneshot::Sender<()>, JoinHandle<QueueResult<()>>)>,
    reaper: (oneshot::Sender<()>, JoinHandle<QueueResult<()>>),
    observer: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming, wait for in-flight jobs, then stop the reaper
    pub async fn shutdown(self) -> QueueResult<()> {
        let (dispatcher_stops, dispatcher_tasks): (Vec<_>, Vec<_>) = self.dispatchers.into_iter().unzip();
        for stop in dispatcher_stops {
            let _ = stop.send(());
        }

        let mut result = Ok(());
        for task in dispatcher_tasks {
            Self::join(task, &mut result).await;
        }

        // Stalls and delayed retries are still handled while dispatchers drain
        let (stop, task) = self.reaper;
        let _ = stop.send(());
        Self::join(task, &mut result).await;

        self.observer.abort();
        info!("Workers shut down");
        result
    }

    async fn join(task: JoinHandle<QueueResult<()>>, result: &mut QueueResult<()>) {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => *result = Err(e),
            Err(e) => *result = Err(QueueError::Internal(format!("Worker join error: {}", e))),
        }
    }
}

/// Producer and worker facade over a [`JobStore`]
pub struct QueueAdapter<S: JobStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<RwLock<HandlerRegistry>>,
    observability: ObservabilityLayer,
    on_failed: FailureHookSlot,
    wakers: QueueWakers,
    config: QueueConfig,
}

impl<S: JobStore + 'static> QueueAdapter<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: S, config: QueueConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }
}

impl<S: JobStore + ?Sized + 'static> QueueAdapter<S> {
    /// Share a store that other components also hold
    pub fn from_arc(store: Arc<S>, config: QueueConfig) -> Self {
        Self {
            store,
            registry: Arc::new(RwLock::new(HandlerRegistry::new())),
            observability: ObservabilityLayer::new(),
            on_failed: FailureHookSlot::default(),
            wakers: QueueWakers::default(),
            config,
        }
    }

    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    /// Register a typed job; executions receive a clone of `ctx`
    pub fn register_job<J: Job>(&self, ctx: J::Context) -> QueueResult<()> {
        self.registry.write().register::<J>(ctx)?;
        info!("Registered job type {}/{}", J::QUEUE, J::JOB_TYPE);
        Ok(())
    }

    /// Register an async closure for `queue`/`job_type`
    pub fn register_fn<F, Fut>(&self, queue: &str, job_type: &str, f: F) -> QueueResult<()>
    where
        F: Fn(JobRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.registry.write().register_fn(queue, job_type, f)?;
        info!("Registered job type {}/{}", queue, job_type);
        Ok(())
    }

    /// Called with the final record of every job that reaches `failed`.
    /// May be set or replaced while workers run. Best effort: a crash between the store write and the call loses it,
    /// so treat [`failed_jobs`](Self::failed_jobs) as the source of truth.
    pub fn on_failed(&self, hook: impl Fn(&JobRecord) + Send + Sync + 'static) {
        *self.on_failed.write() = Some(Arc::new(hook));
    }

    /// Persist a job and return its id without waiting for execution.
    ///
    /// The handler must already be registered and must accept the payload;
    /// otherwise nothing is written.
    #[instrument(skip(self, payload, options))]
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        self.registry.read().validate(queue, job_type, &payload)?;

        let request = EnqueueRequest::new(queue, job_type, payload)
            .with_options(self.apply_defaults(options));
        let job_id = self.store.enqueue(request).await?;

        if let Some(wake) = self.wakers.lock().get(queue) {
            wake.notify_one();
        }

        info!("Enqueued job {} on {}/{}", job_id, queue, job_type);
        Ok(job_id)
    }

    /// Enqueue a typed job. Unset options fall back to the job's constants.
    pub async fn enqueue_job<J: Job>(&self, job: &J, options: Option<EnqueueOptions>) -> QueueResult<JobId> {
        let defaults = J::options();
        let mut merged = options.unwrap_or_default();
        merged.priority = merged.priority.or(defaults.priority);
        merged.max_attempts = merged.max_attempts.or(defaults.max_attempts);

        let payload = serde_json::to_value(job)?;
        self.enqueue(J::QUEUE, J::JOB_TYPE, payload, merged).await
    }

    /// Per-state counts for `queue`
    pub async fn get_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.store.stats(queue).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.store.get(job_id).await
    }

    /// Dead-letter view: terminally failed jobs, oldest first
    pub async fn failed_jobs(&self, queue: &str, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.store.list(queue, JobState::Failed, limit).await
    }

    /// Spawn one dispatcher per registered queue plus the reaper.
    /// Handlers registered after this call are not picked up.
    pub fn start(&self) -> QueueResult<WorkerHandle> {
        let registry = Arc::new(self.registry.read().clone());
        let queues = registry.queues();
        if queues.is_empty() {
            warn!("Starting workers with no registered handlers");
        }

        let executor = Arc::new(
            JobExecutor::new(self.store.clone(), registry, self.config.lock_duration)
                .with_renew_interval(self.config.lock_renew_interval)
                .with_policy(RetryPolicy::new(self.config.max_backoff))
                .with_failure_hook_slot(self.on_failed.clone())
                .with_observability(self.observability.clone()),
        );

        let mut dispatchers = Vec::with_capacity(queues.len());

        for queue in queues {
            let wake = self
                .wakers
                .lock()
                .entry(queue.clone())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();

            let dispatcher = Dispatcher::new(queue.clone(), self.store.clone(), executor.clone())
                .with_concurrency(self.config.concurrency_for(&queue))
                .with_poll_interval(self.config.poll_interval)
                .with_drain_timeout(self.config.drain_timeout)
                .with_wake(wake);

            let (tx, rx) = oneshot::channel();
            dispatchers.push((tx, tokio::spawn(dispatcher.run(rx))));
        }

        let reaper = Reaper::new(self.store.clone())
            .with_intervals(self.config.sweep_interval, self.config.stalled_interval)
            .with_max_stalled_count(self.config.max_stalled_count)
            .with_max_completed(self.config.max_completed_per_queue)
            .with_failure_hook_slot(self.on_failed.clone())
            .with_wakers(self.wakers.clone());
        let (tx, rx) = oneshot::channel();
        let reaper = (tx, tokio::spawn(reaper.run(rx)));

        let observer = self.observability.attach(self.store.event_stream());

        info!("Started {} dispatcher(s) and the reaper", dispatchers.len());
        Ok(WorkerHandle { dispatchers, reaper, observer })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn apply_defaults(&self, mut options: EnqueueOptions) -> EnqueueOptions {
        let defaults = self.config.defaults();
        options.backoff = Some(defaults.backoff_for(&options));
        options.max_attempts.get_or_insert(defaults.max_attempts);
        options.retention.get_or_insert(defaults.retention);
        options
    }
}

impl<S: JobStore + ?Sized> Clone for QueueAdapter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            observability: self.observability.clone(),
            on_failed: self.on_failed.clone(),
            wakers: self.wakers.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::backend::memory::MemoryStore;
    use crate::types::Backoff;
    use crate::JobPriority;
    use serde_json::json;

    #[derive(Clone)]
    struct Greeter {
        greeting: String,
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct GreetJob {
        name: String,
    }

    #[async_trait]
    impl Job for GreetJob {
        type Context = Greeter;
        type Output = String;

        const QUEUE: &'static str = "greetings";
        const JOB_TYPE: &'static str = "greet";
        const PRIORITY: JobPriority = JobPriority::HIGH;
        const MAX_ATTEMPTS: u32 = 5;

        async fn execute(&self, ctx: Self::Context, _run: &JobRun) -> Result<Self::Output, JobError> {
            Ok(format!("{}, {}", ctx.greeting, self.name))
        }

        fn validate(&self) -> Result<(), String> {
            if self.name.is_empty() {
                return Err("name is required".to_string());
            }
            Ok(())
        }
    }

    fn adapter() -> QueueAdapter<MemoryStore> {
        let adapter = QueueAdapter::new(MemoryStore::new());
        adapter
            .register_job::<GreetJob>(Greeter { greeting: "Hello".into() })
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_enqueue_job_uses_job_constants() {
        let adapter = adapter();
        let job_id = adapter.enqueue_job(&GreetJob { name: "Ada".into() }, None).await.unwrap();

        let record = adapter.get_job(&job_id).await.unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.priority(), JobPriority::HIGH);
        assert_eq!(record.max_attempts(), 5);
        assert_eq!(record.message.backoff, Backoff::Exponential { delay: 1000 });
    }

    #[tokio::test]
    async fn test_enqueue_job_options_override_only_what_they_set() {
        let adapter = adapter();
        let options = EnqueueOptions::new().with_priority(JobPriority::LOW);
        let job_id = adapter
            .enqueue_job(&GreetJob { name: "Ada".into() }, Some(options))
            .await
            .unwrap();

        let record = adapter.get_job(&job_id).await.unwrap();
        assert_eq!(record.priority(), JobPriority::LOW);
        assert_eq!(record.max_attempts(), 5);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_handler_and_bad_payload() {
        let adapter = adapter();

        let err = adapter
            .enqueue("greetings", "wave", json!({}), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::HandlerNotRegistered { .. }));

        let err = adapter
            .enqueue_job(&GreetJob { name: String::new() }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { .. }));

        assert_eq!(adapter.get_stats("greetings").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_config_defaults_apply_to_unset_options() {
        let config = QueueConfig::default().with_backoff(Backoff::Fixed { delay: 50 });
        let adapter = QueueAdapter::with_config(MemoryStore::new(), config);
        adapter
            .register_fn("emails", "welcome", |run| async move { Ok(run.payload) })
            .unwrap();

        let job_id = adapter
            .enqueue("emails", "welcome", json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        let record = adapter.get_job(&job_id).await.unwrap();
        assert_eq!(record.message.backoff, Backoff::Fixed { delay: 50 });
        assert_eq!(record.max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_started_workers_process_jobs() {
        let adapter = adapter();
        let handle = adapter.start().unwrap();

        let job_id = adapter.enqueue_job(&GreetJob { name: "Grace".into() }, None).await.unwrap();

        let mut record = adapter.get_job(&job_id).await.unwrap();
        for _ in 0..100 {
            if record.state == JobState::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            record = adapter.get_job(&job_id).await.unwrap();
        }

        handle.shutdown().await.unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.result, Some(json!("Hello, Grace")));
    }
}
