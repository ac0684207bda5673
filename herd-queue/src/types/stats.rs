use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::JobState;

/// Per-queue counts. Best-effort snapshot, not transactionally consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    /// Outstanding work: waiting + active + delayed
    pub total: usize,
}

impl QueueStats {
    /// Build from per-state counts
    pub fn from_counts(counts: impl IntoIterator<Item = (JobState, usize)>) -> Self {
        let mut stats = Self::default();
        for (state, count) in counts {
            stats.add(state, count);
        }
        stats
    }

    /// Add `count` jobs in `state`
    pub fn add(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Active => self.active += count,
            JobState::Delayed => self.delayed += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
        }
        self.total = self.waiting + self.active + self.delayed;
    }

    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Delayed => self.delayed,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    /// Health-check payload in the shape operational callers expect
    pub fn to_json(&self, queue: &str) -> Value {
        json!({
            "queue": queue,
            "waiting": self.waiting,
            "active": self.active,
            "completed": self.completed,
            "failed": self.failed,
            "delayed": self.delayed,
            "total": self.total,
        })
    }
}
