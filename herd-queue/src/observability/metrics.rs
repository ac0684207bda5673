use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::JobEvent;

/// Live counters for queue activity, global and per queue
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_stalled: AtomicU64,

    queue_metrics: RwLock<HashMap<String, QueueMetrics>>,

    performance: RwLock<PerformanceMetrics>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_stalled: AtomicU64::new(0),
            queue_metrics: RwLock::new(HashMap::new()),
            performance: RwLock::new(PerformanceMetrics::new()),
        }
    }

    /// Count a store event
    pub fn record(&self, event: &JobEvent) {
        let counter = match event {
            JobEvent::Enqueued { .. } => &self.jobs_enqueued,
            JobEvent::Completed { .. } => &self.jobs_completed,
            JobEvent::Failed { .. } => &self.jobs_failed,
            JobEvent::Delayed { .. } => &self.jobs_retried,
            JobEvent::Stalled { .. } => &self.jobs_stalled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut queues = self.queue_metrics.write();
        let queue = queues.entry(event.queue().to_string()).or_default();
        match event {
            JobEvent::Enqueued { .. } => queue.enqueued += 1,
            JobEvent::Completed { .. } => queue.completed += 1,
            JobEvent::Failed { .. } => queue.failed += 1,
            JobEvent::Delayed { .. } => queue.retried += 1,
            JobEvent::Stalled { .. } => queue.stalled += 1,
            _ => {}
        }
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_stalled(&self) -> u64 {
        self.jobs_stalled.load(Ordering::Relaxed)
    }

    pub fn queue_metrics(&self, queue: &str) -> Option<QueueMetrics> {
        self.queue_metrics.read().get(queue).cloned()
    }

    /// Record how long one handler run took
    pub fn record_execution_time(&self, job_type: &str, duration: Duration) {
        self.performance.write().record_execution_time(job_type, duration);
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.performance.read().clone()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            global: GlobalMetrics {
                jobs_enqueued: self.jobs_enqueued(),
                jobs_completed: self.jobs_completed(),
                jobs_failed: self.jobs_failed(),
                jobs_retried: self.jobs_retried(),
                jobs_stalled: self.jobs_stalled(),
            },
            queues: self.queue_metrics.read().clone(),
            performance: self.performance_metrics(),
        }
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for a single queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
}

impl QueueMetrics {
    /// Completed share of finished jobs, in percent
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            100.0
        } else {
            (self.completed as f64 / finished as f64) * 100.0
        }
    }
}

/// Handler execution times per job type
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    execution_times: HashMap<String, Vec<Duration>>,
    last_updated: DateTime<Utc>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            execution_times: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn record_execution_time(&mut self, job_type: &str, duration: Duration) {
        let times = self.execution_times.entry(job_type.to_string()).or_default();
        times.push(duration);

        // Keep only last 1000 measurements per job type
        if times.len() > 1000 {
            times.remove(0);
        }

        self.last_updated = Utc::now();
    }

    pub fn average_execution_time(&self, job_type: &str) -> Option<Duration> {
        let times = self.execution_times.get(job_type)?;
        if times.is_empty() {
            return None;
        }

        let total_ms: i64 = times.iter().map(|d| d.num_milliseconds()).sum();
        Some(Duration::milliseconds(total_ms / times.len() as i64))
    }

    pub fn percentile_execution_time(&self, job_type: &str, percentile: f64) -> Option<Duration> {
        let times = self.execution_times.get(job_type)?;
        if times.is_empty() {
            return None;
        }

        let mut sorted = times.clone();
        sorted.sort();
        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted.get(index).cloned()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub queues: HashMap<String, QueueMetrics>,
    pub performance: PerformanceMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalMetrics {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_stalled: u64,
}

impl GlobalMetrics {
    pub fn success_rate(&self) -> f64 {
        let finished = self.jobs_completed + self.jobs_failed;
        if finished == 0 {
            100.0
        } else {
            (self.jobs_completed as f64 / finished as f64) * 100.0
        }
    }

    /// Retries per enqueued job, in percent
    pub fn retry_rate(&self) -> f64 {
        if self.jobs_enqueued == 0 {
            0.0
        } else {
            (self.jobs_retried as f64 / self.jobs_enqueued as f64) * 100.0
        }
    }

    /// Enqueued jobs not yet completed or failed
    pub fn jobs_in_progress(&self) -> u64 {
        self.jobs_enqueued.saturating_sub(self.jobs_completed + self.jobs_failed)
    }
}
