use std::time::Duration;
use chrono::{DateTime, Utc};

use crate::{backend::chrono_duration, JobError, JobRecord};

/// What happens to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `delayed` until `at`
    Retry { at: DateTime<Utc>, delay: Duration },

    /// No budget left or the error was permanent
    Exhausted,
}

/// Decides between retry and terminal failure using the job's own backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_backoff: Duration) -> Self {
        Self { max_backoff }
    }

    /// `record` is the job as claimed, before this failure is counted
    pub fn decide(&self, record: &JobRecord, error: &JobError, now: DateTime<Utc>) -> RetryDecision {
        if !error.is_retryable() || !record.can_retry() {
            return RetryDecision::Exhausted;
        }

        let delay = self.delay_for(record, record.attempts + 1);
        RetryDecision::Retry {
            at: now + chrono_duration(delay),
            delay,
        }
    }

    /// Delay after failure number `failures`, capped at the maximum backoff
    pub fn delay_for(&self, record: &JobRecord, failures: u32) -> Duration {
        record.message.backoff.delay_for(failures).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnqueueOptions, EnqueueRequest, JobDefaults, JobMessage};
    use crate::JobId;
    use serde_json::json;

    fn record(attempts: u32, max_attempts: u32, base_delay_ms: u64) -> JobRecord {
        let options = EnqueueOptions::new()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(base_delay_ms);
        let request = EnqueueRequest::new("post-creation", "create-post", json!({})).with_options(options);
        let message = JobMessage::resolve(request, &JobDefaults::default()).unwrap();
        let mut record = JobRecord::new(JobId::new(), message, 0, Utc::now());
        record.attempts = attempts;
        record
    }

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let error = JobError::retryable("timeout");

        let first = policy.decide(&record(0, 3, 1000), &error, now);
        assert_eq!(
            first,
            RetryDecision::Retry { at: now + chrono::Duration::seconds(1), delay: Duration::from_secs(1) }
        );

        let second = policy.decide(&record(1, 3, 1000), &error, now);
        assert_eq!(
            second,
            RetryDecision::Retry { at: now + chrono::Duration::seconds(2), delay: Duration::from_secs(2) }
        );

        assert_eq!(policy.decide(&record(2, 3, 1000), &error, now), RetryDecision::Exhausted);
    }

    #[test]
    fn test_permanent_error_skips_budget() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&record(0, 3, 1000), &JobError::permanent("post not found"), Utc::now());
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&record(0, 1, 1000), &JobError::retryable("boom"), Utc::now());
        assert_eq!(decision, RetryDecision::Exhausted);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(5));
        let job = record(0, 20, 1000);
        assert_eq!(policy.delay_for(&job, 2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(&job, 10), Duration::from_secs(5));
    }
}
