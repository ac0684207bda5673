use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::types::{Backoff, JobDefaults, JobPriority, Retention};

/// Runtime settings for dispatchers, workers and the reaper.
///
/// Defaults mirror the Bull settings the queue was modelled on: three
/// attempts, exponential backoff from one second, a 30 second lock and at
/// most two stalls before a job is failed.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs executed in parallel per queue
    pub concurrency: usize,
    /// Per-queue overrides of `concurrency`
    pub queue_concurrency: HashMap<String, usize>,
    /// Fallback wake-up when no enqueue notification arrives
    pub poll_interval: Duration,
    /// How long a claim is valid without a heartbeat
    pub lock_duration: Duration,
    /// Heartbeat period; must stay below `lock_duration`
    pub lock_renew_interval: Duration,
    /// How often delayed jobs are promoted
    pub sweep_interval: Duration,
    /// How often expired locks are reclaimed
    pub stalled_interval: Duration,
    /// Reclaims tolerated before a job is failed
    pub max_stalled_count: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound on any single retry delay
    pub max_backoff: Duration,
    pub retention: Retention,
    /// Cap on completed records kept per queue, enforced by the reaper
    pub max_completed_per_queue: Option<usize>,
    /// How long shutdown waits for in-flight jobs
    pub drain_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue_concurrency: HashMap::new(),
            poll_interval: Duration::from_secs(1),
            lock_duration: Duration::from_secs(30),
            lock_renew_interval: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(1),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 2,
            max_attempts: 3,
            backoff: Backoff::Exponential { delay: 1000 },
            max_backoff: Duration::from_secs(3600),
            retention: Retention::Keep,
            max_completed_per_queue: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Read `QUEUE_*` environment variables over the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let lock_ms = parse_or(&get, "QUEUE_LOCK_DURATION_MS", defaults.lock_duration.as_millis() as u64);
        let mut renew_ms = parse_or(&get, "QUEUE_LOCK_RENEW_MS", lock_ms / 2);
        if renew_ms == 0 || renew_ms >= lock_ms {
            warn!(
                "QUEUE_LOCK_RENEW_MS {} must be below QUEUE_LOCK_DURATION_MS {}, using {}",
                renew_ms,
                lock_ms,
                lock_ms / 2
            );
            renew_ms = lock_ms / 2;
        }
        let stalled_ms = parse_or(&get, "QUEUE_STALLED_INTERVAL_MS", lock_ms);
        let base_delay = parse_or(&get, "QUEUE_BACKOFF_DELAY_MS", defaults.backoff.base_delay().as_millis() as u64);

        let backoff = match get("QUEUE_BACKOFF_TYPE").as_deref() {
            Some("fixed") => Backoff::Fixed { delay: base_delay },
            Some("exponential") | None => Backoff::Exponential { delay: base_delay },
            Some(other) => {
                warn!("Unknown QUEUE_BACKOFF_TYPE {:?}, using exponential", other);
                Backoff::Exponential { delay: base_delay }
            }
        };

        let retention = match get("QUEUE_REMOVE_ON_COMPLETE").as_deref() {
            Some("true") => Retention::Remove,
            Some("false") | None => defaults.retention,
            Some(other) => match other.parse::<usize>() {
                Ok(keep) => Retention::KeepLast(keep),
                Err(_) => {
                    warn!("Invalid QUEUE_REMOVE_ON_COMPLETE {:?}, keeping completed jobs", other);
                    defaults.retention
                }
            },
        };

        Self {
            concurrency: parse_or(&get, "QUEUE_CONCURRENCY", defaults.concurrency).max(1),
            queue_concurrency: get("QUEUE_CONCURRENCY_OVERRIDES")
                .map(|raw| parse_overrides(&raw))
                .unwrap_or_default(),
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            lock_duration: Duration::from_millis(lock_ms),
            lock_renew_interval: Duration::from_millis(renew_ms.max(1)),
            sweep_interval: Duration::from_millis(parse_or(
                &get,
                "QUEUE_SWEEP_INTERVAL_MS",
                defaults.sweep_interval.as_millis() as u64,
            )),
            stalled_interval: Duration::from_millis(stalled_ms.max(1)),
            max_stalled_count: parse_or(&get, "QUEUE_MAX_STALLED_COUNT", defaults.max_stalled_count),
            max_attempts: parse_or(&get, "QUEUE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backoff,
            max_backoff: Duration::from_millis(parse_or(
                &get,
                "QUEUE_MAX_BACKOFF_MS",
                defaults.max_backoff.as_millis() as u64,
            )),
            retention,
            max_completed_per_queue: get("QUEUE_MAX_COMPLETED").and_then(|raw| raw.parse().ok()),
            drain_timeout: Duration::from_millis(parse_or(
                &get,
                "QUEUE_DRAIN_TIMEOUT_MS",
                defaults.drain_timeout.as_millis() as u64,
            )),
        }
    }

    /// Job defaults the store applies to unset enqueue options
    pub fn defaults(&self) -> JobDefaults {
        JobDefaults {
            priority: JobPriority::NORMAL,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            retention: self.retention,
        }
    }

    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .unwrap_or(self.concurrency)
            .max(1)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue_concurrency(mut self, queue: impl Into<String>, concurrency: usize) -> Self {
        self.queue_concurrency.insert(queue.into(), concurrency.max(1));
        self
    }

    /// Sets the lock duration; renewals run at half of it and stall checks at its full length
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self.lock_renew_interval = lock_duration / 2;
        self.stalled_interval = lock_duration;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

fn parse_or<T: FromStr + Copy>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value {:?} for {}, using default", raw, key);
            default
        }),
        None => default,
    }
}

/// `"post-creation=4,emails=2"`
fn parse_overrides(raw: &str) -> HashMap<String, usize> {
    raw.split(',')
        .filter_map(|entry| {
            let (queue, value) = entry.split_once('=')?;
            let concurrency = value.trim().parse().ok()?;
            Some((queue.trim().to_string(), concurrency))
        })
        .collect()
}
