use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    QueueResult, JobState,
    backend::JobStore,
    execution::{
        dispatcher::QueueWakers,
        executor::{notify_failed, FailureHook, FailureHookSlot},
    },
};

/// What one reaper pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub promoted: usize,
    pub requeued: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Background timers: promotes delayed jobs whose backoff has elapsed and
/// reclaims active jobs whose lock expired without a heartbeat.
pub struct Reaper<S: JobStore + ?Sized> {
    store: Arc<S>,
    sweep_interval: Duration,
    stalled_interval: Duration,
    max_stalled_count: u32,
    max_completed_per_queue: Option<usize>,
    on_failed: FailureHookSlot,
    wakers: QueueWakers,
}

impl<S: JobStore + ?Sized + 'static> Reaper<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            sweep_interval: Duration::from_secs(1),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 2,
            max_completed_per_queue: None,
            on_failed: FailureHookSlot::default(),
            wakers: QueueWakers::default(),
        }
    }

    pub fn with_intervals(mut self, sweep_interval: Duration, stalled_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval.max(Duration::from_millis(1));
        self.stalled_interval = stalled_interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_stalled_count(mut self, max_stalled_count: u32) -> Self {
        self.max_stalled_count = max_stalled_count;
        self
    }

    pub fn with_max_completed(mut self, keep: Option<usize>) -> Self {
        self.max_completed_per_queue = keep;
        self
    }

    pub fn with_failure_hook(mut self, hook: Option<FailureHook>) -> Self {
        self.on_failed = Arc::new(parking_lot::RwLock::new(hook));
        self
    }

    /// Follow a hook slot that may be filled or replaced while the reaper runs
    pub fn with_failure_hook_slot(mut self, slot: FailureHookSlot) -> Self {
        self.on_failed = slot;
        self
    }

    /// Dispatchers to wake when delayed jobs become claimable
    pub fn with_wakers(mut self, wakers: QueueWakers) -> Self {
        self.wakers = wakers;
        self
    }

    /// Run both timers until `shutdown` fires
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> QueueResult<()> {
        let mut sweep = interval(self.sweep_interval);
        let mut stalled = interval(self.stalled_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stalled.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first stall check happens one full interval after start
        stalled.tick().await;

        info!(
            "Starting reaper (sweep every {:?}, stall check every {:?})",
            self.sweep_interval, self.stalled_interval
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Error during delayed sweep: {}", e);
                    }
                }
                _ = stalled.tick() => {
                    if let Err(e) = self.reclaim().await {
                        warn!("Error during stall check: {}", e);
                    }
                }
            }
        }

        info!("Reaper stopped");
        Ok(())
    }

    /// Run one full cycle (for testing)
    pub async fn tick(&self) -> QueueResult<ReapReport> {
        let mut report = self.reclaim().await?;
        let swept = self.sweep().await?;
        report.promoted = swept.promoted;
        report.pruned = swept.pruned;
        Ok(report)
    }

    async fn sweep(&self) -> QueueResult<ReapReport> {
        let promoted = self.store.sweep_delayed().await?;
        if promoted > 0 {
            debug!("Promoted {} delayed job(s)", promoted);
            for wake in self.wakers.lock().values() {
                wake.notify_one();
            }
        }

        let mut pruned = 0;
        if let Some(keep) = self.max_completed_per_queue {
            for queue in self.store.queues().await? {
                pruned += self.store.prune_completed(&queue, keep).await?;
            }
        }

        Ok(ReapReport { promoted, pruned, ..ReapReport::default() })
    }

    async fn reclaim(&self) -> QueueResult<ReapReport> {
        let reclaimed = self.store.reclaim_stalled(self.max_stalled_count).await?;
        let mut report = ReapReport::default();

        for record in &reclaimed {
            match record.state {
                JobState::Failed => {
                    report.failed += 1;
                    warn!(
                        job_id = %record.id,
                        queue = record.queue(),
                        stalled_count = record.stalled_count,
                        "StallReclaim: job stalled more than allowable limit, failing it"
                    );
                    notify_failed(&self.on_failed, record);
                }
                _ => {
                    report.requeued += 1;
                    warn!(
                        job_id = %record.id,
                        queue = record.queue(),
                        stalled_count = record.stalled_count,
                        "StallReclaim: lock expired, job returned to waiting"
                    );
                }
            }
        }

        Ok(report)
    }
}
