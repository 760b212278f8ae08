//! Persistent work queues
//!
//! Named job queues with delayed delivery, exponential backoff retry,
//! and dead-letter semantics. The queue is the coordination primitive
//! between pipeline stages; delivery is at-least-once, so handlers are
//! idempotent (dedup happens downstream on `(source, external_id)` and
//! content hashes).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::types::JobId;

mod store;
mod worker;

pub use store::SqliteJobQueue;
pub use worker::{JobHandler, QueueWorker, RateLimit, WorkerHandle, WorkerOptions};

/// Queue fed by source adapters.
pub const QUEUE_INGESTION: &str = "ingestion";
/// Queue of per-event pipeline jobs.
pub const QUEUE_PROCESSING: &str = "processing";
/// Queue of embedding jobs (batched provider calls).
pub const QUEUE_EMBEDDING: &str = "embedding";
/// Queue of background agent tasks.
pub const QUEUE_AGENT_TASKS: &str = "agent-tasks";

/// State of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A job as stored in a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub state: JobState,
    pub priority: i32,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be handed to a worker.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Options for [`JobQueue::add`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Higher priority jobs are reserved first.
    pub priority: i32,
    /// Initial delay before the job becomes available.
    pub delay: Option<Duration>,
    /// Override of the queue-wide default attempt cap.
    pub max_attempts: Option<u32>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            max_attempts: None,
        }
    }
}

/// Exponential backoff schedule for retries: `base · 2^(attempts−1)`,
/// capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base: config.backoff_base,
            cap: config.backoff_cap,
        }
    }

    /// Delay before the next delivery after `attempts_made` failures.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }
}

/// Retention windows for terminal jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed_max_age: Duration,
    pub completed_max_count: u64,
    pub failed_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age: Duration::from_secs(24 * 3600),
            completed_max_count: 1000,
            failed_max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            completed_max_age: config.completed_retention,
            completed_max_count: config.completed_max_count,
            failed_max_age: config.failed_retention,
        }
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Jobs still ahead of the workers (backpressure signal).
    pub fn depth(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// Abstract job queue.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably enqueue a job; returns its id.
    async fn add(
        &self,
        queue: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, crate::types::QueueError>;

    /// Reserve the next available job (highest priority, then oldest
    /// availability), marking it active. Returns `None` when the queue
    /// has nothing eligible.
    async fn reserve(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, crate::types::QueueError>;

    /// Mark a reserved job completed.
    async fn complete(&self, id: JobId) -> Result<(), crate::types::QueueError>;

    /// Record a failed delivery: increments attempts, then either
    /// reschedules with backoff (`Delayed`) or dead-letters (`Failed`).
    /// Returns the resulting state.
    async fn retry_or_fail(
        &self,
        id: JobId,
        error: &str,
        backoff: BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<JobState, crate::types::QueueError>;

    /// Per-state counts for a queue.
    async fn counts(&self, queue: &str) -> Result<QueueCounts, crate::types::QueueError>;

    /// Dead-lettered jobs for inspection, newest first. They are never
    /// auto-requeued.
    async fn failed_jobs(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<QueueJob>, crate::types::QueueError>;

    /// Delete terminal jobs that fell out of their retention window.
    /// Returns the number of rows removed.
    async fn sweep(
        &self,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64, crate::types::QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        // 2·2^4 = 32s exceeds the cap
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn depth_excludes_terminal_states() {
        let counts = QueueCounts {
            waiting: 3,
            active: 1,
            delayed: 2,
            completed: 100,
            failed: 5,
        };
        assert_eq!(counts.depth(), 6);
    }
}
