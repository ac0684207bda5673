use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{QueueResult, QueueError, backend::JobStore, types::WorkerId};
use super::executor::JobExecutor;

/// Wake-up signals of the running dispatchers, keyed by queue
pub type QueueWakers = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

/// Claims jobs from one queue and runs up to `concurrency` of them at once
pub struct Dispatcher<S: JobStore + ?Sized> {
    queue: String,
    store: Arc<S>,
    executor: Arc<JobExecutor<S>>,
    concurrency: usize,
    poll_interval: Duration,
    drain_timeout: Duration,
    wake: Arc<Notify>,
}

impl<S: JobStore + ?Sized + 'static> Dispatcher<S> {
    pub fn new(queue: impl Into<String>, store: Arc<S>, executor: Arc<JobExecutor<S>>) -> Self {
        Self {
            queue: queue.into(),
            store,
            executor,
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Share a wake-up signal with producers so new jobs are picked up immediately
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Run until `shutdown` fires, then wait for in-flight jobs to finish
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> QueueResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        info!("Dispatcher started for queue {} (concurrency {})", self.queue, self.concurrency);

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(&self.queue, joined);
            }

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| QueueError::WorkerShutdown)?
                }
            };

            let worker_id = WorkerId::generate(&self.queue);
            match self
                .store
                .claim_next(&self.queue, &worker_id, self.executor.lock_duration())
                .await
            {
                Ok(Some(record)) => {
                    debug!("Claimed job {} as {}", record.id, worker_id);
                    let executor = self.executor.clone();
                    in_flight.spawn(async move {
                        let outcome = executor.execute(record, &worker_id).await;
                        drop(permit);
                        outcome
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!("Claim on queue {} failed: {}", self.queue, e);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        self.drain(in_flight).await;
        info!("Dispatcher stopped for queue {}", self.queue);
        Ok(())
    }

    async fn drain(&self, mut in_flight: JoinSet<QueueResult<super::ExecutionOutcome>>) {
        if in_flight.is_empty() {
            return;
        }
        info!("Draining {} in-flight job(s) on queue {}", in_flight.len(), self.queue);

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(&self.queue, joined);
            }
        })
        .await;

        if drained.is_err() {
            // Abandoned jobs keep their lock until it expires and the reaper reclaims them
            warn!(
                "Drain timed out on queue {}; abandoning {} job(s)",
                self.queue,
                in_flight.len()
            );
            in_flight.abort_all();
        }
    }
}

fn log_join(
    queue: &str,
    joined: Result<QueueResult<super::ExecutionOutcome>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(outcome)) => debug!("Job on queue {} finished: {:?}", queue, outcome),
        Ok(Err(e)) => error!("Could not record job outcome on queue {}: {}", queue, e),
        Err(e) => error!("Job task on queue {} aborted: {}", queue, e),
    }
}
