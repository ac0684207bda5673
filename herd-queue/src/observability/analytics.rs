use std::sync::Arc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{backend::BoxStream, JobEvent};
use super::LiveMetrics;

/// Feeds store events and worker timings into [`LiveMetrics`]
#[derive(Clone)]
pub struct ObservabilityLayer {
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Record one event
    pub fn observe(&self, event: &JobEvent) {
        debug!(
            event = event.event_name(),
            job_id = %event.job_id(),
            queue = event.queue(),
            "Job event"
        );
        self.metrics.record(event);
    }

    /// Consume a store event stream in the background until it ends
    pub fn attach(&self, mut events: BoxStream<JobEvent>) -> JoinHandle<()> {
        let layer = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                layer.observe(&event);
            }
        })
    }

    /// Record how long one handler run took
    pub fn record_execution_time(&self, job_type: &str, elapsed: std::time::Duration) {
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        self.metrics.record_execution_time(job_type, elapsed);
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
