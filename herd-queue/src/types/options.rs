use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::JobPriority;

/// Delay strategy between failed attempts. Delays are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// `delay * 2^(attempt - 1)`
    Exponential { delay: u64 },

    /// Same delay before every retry
    Fixed { delay: u64 },
}

impl Backoff {
    pub fn exponential(base_delay: Duration) -> Self {
        Self::Exponential { delay: base_delay.as_millis() as u64 }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay: delay.as_millis() as u64 }
    }

    /// Delay before the retry that follows failure number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Exponential { delay } => {
                let exponent = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                Duration::from_millis(delay.saturating_mul(factor))
            }
            Self::Fixed { delay } => Duration::from_millis(delay),
        }
    }

    /// The configured base delay
    pub fn base_delay(&self) -> Duration {
        match *self {
            Self::Exponential { delay } | Self::Fixed { delay } => Duration::from_millis(delay),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential { delay: 1000 }
    }
}

/// What to do with a job record once it reaches `completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Keep every completed record
    Keep,

    /// Delete the record as soon as it completes
    Remove,

    /// Keep only the most recent `n` completed records per queue
    KeepLast(usize),
}

impl Default for Retention {
    fn default() -> Self {
        Self::Keep
    }
}

/// Per-enqueue options. Unset fields fall back to the store's [`JobDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub priority: Option<JobPriority>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff: Option<Backoff>,
    pub retention: Option<Retention>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: impl Into<JobPriority>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = Some(base_delay_ms);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Shorthand for `Retention::Remove`
    pub fn remove_on_complete(self) -> Self {
        self.with_retention(Retention::Remove)
    }
}

/// Defaults applied to every enqueue that leaves an option unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
    pub priority: JobPriority,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: JobPriority::NORMAL,
            max_attempts: 3,
            backoff: Backoff::default(),
            retention: Retention::Keep,
        }
    }
}

impl JobDefaults {
    /// Resolve the effective backoff: an explicit strategy wins, then a bare
    /// base delay (exponential), then the default.
    pub fn backoff_for(&self, options: &EnqueueOptions) -> Backoff {
        match (options.backoff, options.base_delay_ms) {
            (Some(backoff), _) => backoff,
            (None, Some(delay)) => Backoff::Exponential { delay },
            (None, None) => self.backoff,
        }
    }
}
