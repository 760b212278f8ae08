//! SQLite-backed job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{BackoffPolicy, EnqueueOptions, JobState, QueueCounts, QueueJob, RetentionPolicy};
use crate::types::{JobId, QueueError};

/// Persistent queue store shared by all named queues.
pub struct SqliteJobQueue {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
    default_max_attempts: u32,
}

impl SqliteJobQueue {
    /// Open (or create) the queue store at the given path.
    pub fn open(path: &std::path::Path, default_max_attempts: u32) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Storage(format!("create dir: {e}")))?;
        }
        let conn =
            rusqlite::Connection::open(path).map_err(|e| QueueError::Storage(e.to_string()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            default_max_attempts,
        })
    }

    /// Open an in-memory queue (useful for tests).
    pub fn open_in_memory(default_max_attempts: u32) -> Result<Self, QueueError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            default_max_attempts,
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_jobs (
                job_id       TEXT PRIMARY KEY,
                queue        TEXT NOT NULL,
                payload      TEXT NOT NULL,
                state        TEXT NOT NULL DEFAULT 'waiting',
                priority     INTEGER NOT NULL DEFAULT 0,
                attempts     INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                available_at TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                last_error   TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_jobs_ready
                ON queue_jobs(queue, state, available_at);
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_updated
                ON queue_jobs(state, updated_at);",
        )
        .map_err(|e| QueueError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl super::JobQueue for SqliteJobQueue {
    async fn add(
        &self,
        queue: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let id = JobId::new();
        let payload = serde_json::to_string(&payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let now = Utc::now();
        let (state, available_at) = match opts.delay {
            Some(delay) => (
                JobState::Delayed,
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            ),
            None => (JobState::Waiting, now),
        };
        let max_attempts = opts.max_attempts.unwrap_or(self.default_max_attempts);

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue_jobs
                (job_id, queue, payload, state, priority, attempts, max_attempts,
                 available_at, created_at, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8, NULL)",
            rusqlite::params![
                id.to_string(),
                queue,
                payload,
                state.to_string(),
                opts.priority,
                max_attempts,
                available_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| QueueError::Storage(e.to_string()))?;
        Ok(id)
    }

    async fn reserve(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, QueueError> {
        let conn = self.conn.lock().await;

        // Selection and activation stay under one connection lock, so
        // two workers cannot reserve the same job.
        let candidate = {
            let mut stmt = conn
                .prepare(
                    "SELECT job_id FROM queue_jobs
                     WHERE queue = ?1
                       AND state IN ('waiting', 'delayed')
                       AND available_at <= ?2
                     ORDER BY priority DESC, available_at, job_id
                     LIMIT 1",
                )
                .map_err(|e| QueueError::Storage(e.to_string()))?;
            let result: Result<String, _> =
                stmt.query_row(rusqlite::params![queue, now.to_rfc3339()], |row| row.get(0));
            match result {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(QueueError::Storage(e.to_string())),
            }
        };

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE queue_jobs SET state = 'active', updated_at = ?1 WHERE job_id = ?2",
            rusqlite::params![now.to_rfc3339(), job_id],
        )
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT job_id, queue, payload, state, priority, attempts, max_attempts,
                        available_at, created_at, updated_at, last_error
                 FROM queue_jobs WHERE job_id = ?1",
            )
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        let job = stmt
            .query_row(rusqlite::params![job_id], row_to_job)
            .map_err(|e| QueueError::Storage(e.to_string()))??;
        Ok(Some(job))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE queue_jobs SET state = 'completed', updated_at = ?1 WHERE job_id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        if rows == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        id: JobId,
        error: &str,
        backoff: BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<JobState, QueueError> {
        let conn = self.conn.lock().await;

        let (attempts, max_attempts): (u32, u32) = conn
            .query_row(
                "SELECT attempts, max_attempts FROM queue_jobs WHERE job_id = ?1",
                rusqlite::params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => QueueError::NotFound(id),
                other => QueueError::Storage(other.to_string()),
            })?;

        let attempts_made = attempts + 1;
        let (state, available_at) = if attempts_made < max_attempts {
            let delay = backoff.delay_for(attempts_made);
            (
                JobState::Delayed,
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            )
        } else {
            (JobState::Failed, now)
        };

        conn.execute(
            "UPDATE queue_jobs
             SET state = ?1, attempts = ?2, available_at = ?3, updated_at = ?4, last_error = ?5
             WHERE job_id = ?6",
            rusqlite::params![
                state.to_string(),
                attempts_made,
                available_at.to_rfc3339(),
                now.to_rfc3339(),
                error,
                id.to_string(),
            ],
        )
        .map_err(|e| QueueError::Storage(e.to_string()))?;

        Ok(state)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM queue_jobs WHERE queue = ?1 GROUP BY state")
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![queue], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count))
            })
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, count) = row.map_err(|e| QueueError::Storage(e.to_string()))?;
            let count = count as u64;
            match state.parse() {
                Ok(JobState::Waiting) => counts.waiting = count,
                Ok(JobState::Active) => counts.active = count,
                Ok(JobState::Delayed) => counts.delayed = count,
                Ok(JobState::Completed) => counts.completed = count,
                Ok(JobState::Failed) => counts.failed = count,
                Err(e) => return Err(QueueError::Serialization(e)),
            }
        }
        Ok(counts)
    }

    async fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<QueueJob>, QueueError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, queue, payload, state, priority, attempts, max_attempts,
                        available_at, created_at, updated_at, last_error
                 FROM queue_jobs
                 WHERE queue = ?1 AND state = 'failed'
                 ORDER BY updated_at DESC
                 LIMIT ?2",
            )
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![queue, limit as i64], row_to_job)
            .map_err(|e| QueueError::Storage(e.to_string()))?;

        let mut jobs = Vec::new();
        for row_result in rows {
            let inner = row_result.map_err(|e| QueueError::Storage(e.to_string()))?;
            jobs.push(inner?);
        }
        Ok(jobs)
    }

    async fn sweep(&self, policy: RetentionPolicy, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let completed_cutoff = now
            - chrono::Duration::from_std(policy.completed_max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let failed_cutoff =
            now - chrono::Duration::from_std(policy.failed_max_age).unwrap_or_else(|_| chrono::Duration::zero());

        let conn = self.conn.lock().await;
        let mut deleted = 0u64;

        deleted += conn
            .execute(
                "DELETE FROM queue_jobs WHERE state = 'completed' AND updated_at < ?1",
                rusqlite::params![completed_cutoff.to_rfc3339()],
            )
            .map_err(|e| QueueError::Storage(e.to_string()))? as u64;

        // Per-queue cap on retained completed jobs, newest kept.
        deleted += conn
            .execute(
                "DELETE FROM queue_jobs
                 WHERE state = 'completed'
                   AND job_id NOT IN (
                       SELECT job_id FROM queue_jobs AS newer
                       WHERE newer.state = 'completed' AND newer.queue = queue_jobs.queue
                       ORDER BY newer.updated_at DESC
                       LIMIT ?1
                   )",
                rusqlite::params![policy.completed_max_count as i64],
            )
            .map_err(|e| QueueError::Storage(e.to_string()))? as u64;

        deleted += conn
            .execute(
                "DELETE FROM queue_jobs WHERE state = 'failed' AND updated_at < ?1",
                rusqlite::params![failed_cutoff.to_rfc3339()],
            )
            .map_err(|e| QueueError::Storage(e.to_string()))? as u64;

        Ok(deleted)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<QueueJob, QueueError>> {
    let id_str: String = row.get(0)?;
    let queue: String = row.get(1)?;
    let payload_str: String = row.get(2)?;
    let state_str: String = row.get(3)?;
    let priority: i32 = row.get(4)?;
    let attempts: u32 = row.get(5)?;
    let max_attempts: u32 = row.get(6)?;
    let available_str: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;

    Ok((|| -> Result<QueueJob, QueueError> {
        let id: JobId = id_str
            .parse()
            .map_err(|e: uuid::Error| QueueError::Serialization(e.to_string()))?;
        let payload = serde_json::from_str(&payload_str)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let state: JobState = state_str.parse().map_err(QueueError::Serialization)?;
        let parse_time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| QueueError::Serialization(e.to_string()))
        };

        Ok(QueueJob {
            id,
            queue,
            payload,
            state,
            priority,
            attempts,
            max_attempts,
            available_at: parse_time(&available_str)?,
            created_at: parse_time(&created_str)?,
            updated_at: parse_time(&updated_str)?,
            last_error,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use serde_json::json;
    use std::time::Duration;

    fn queue() -> SqliteJobQueue {
        SqliteJobQueue::open_in_memory(3).unwrap()
    }

    #[tokio::test]
    async fn add_and_reserve() {
        let q = queue();
        let id = q
            .add("processing", json!({"event_id": "abc"}), EnqueueOptions::default())
            .await
            .unwrap();

        let job = q.reserve("processing", Utc::now()).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.payload["event_id"], "abc");

        // Nothing else eligible while the job is active.
        assert!(q.reserve("processing", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_honors_priority_then_age() {
        let q = queue();
        q.add("processing", json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        q.add(
            "processing",
            json!({"n": 2}),
            EnqueueOptions {
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let first = q.reserve("processing", Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.payload["n"], 2);
        let second = q.reserve("processing", Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.payload["n"], 1);
    }

    #[tokio::test]
    async fn delayed_jobs_become_eligible() {
        let q = queue();
        q.add(
            "processing",
            json!({}),
            EnqueueOptions {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let now = Utc::now();
        assert!(q.reserve("processing", now).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(61);
        assert!(q.reserve("processing", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let q = queue();
        q.add("ingestion", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(q.reserve("processing", Utc::now()).await.unwrap().is_none());
        assert!(q.reserve("ingestion", Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retry_schedule_follows_backoff() {
        let q = queue();
        let id = q
            .add("processing", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let now = Utc::now();
        q.reserve("processing", now).await.unwrap().unwrap();

        let state = q
            .retry_or_fail(id, "provider unavailable", BackoffPolicy::default(), now)
            .await
            .unwrap();
        assert_eq!(state, JobState::Delayed);

        // Not yet eligible: first retry is 2s out.
        assert!(q.reserve("processing", now).await.unwrap().is_none());
        let job = q
            .reserve("processing", now + chrono::Duration::seconds(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("provider unavailable"));
    }

    #[tokio::test]
    async fn dead_letters_after_max_attempts() {
        let q = queue();
        let id = q
            .add("embedding", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let backoff = BackoffPolicy::default();

        let mut now = Utc::now();
        for attempt in 1..=3u32 {
            let job = q.reserve("embedding", now).await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt - 1);
            let state = q.retry_or_fail(id, "boom", backoff, now).await.unwrap();
            if attempt < 3 {
                assert_eq!(state, JobState::Delayed);
            } else {
                assert_eq!(state, JobState::Failed);
            }
            now += chrono::Duration::seconds(60);
        }

        // Dead-lettered jobs stay inspectable and are not requeued.
        assert!(q.reserve("embedding", now).await.unwrap().is_none());
        let failed = q.failed_jobs("embedding", 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
    }

    #[tokio::test]
    async fn counts_by_state() {
        let q = queue();
        q.add(
            "processing",
            json!({"n": 1}),
            EnqueueOptions {
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let id2 = q
            .add("processing", json!({"n": 2}), EnqueueOptions::default())
            .await
            .unwrap();
        q.reserve("processing", Utc::now()).await.unwrap();
        q.complete(id2).await.unwrap();

        let counts = q.counts("processing").await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 1);
    }

    #[tokio::test]
    async fn sweep_removes_old_terminal_jobs() {
        let q = queue();
        let id = q
            .add("processing", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        q.reserve("processing", Utc::now()).await.unwrap();
        q.complete(id).await.unwrap();

        let policy = RetentionPolicy::default();
        // Within retention: nothing removed.
        assert_eq!(q.sweep(policy, Utc::now()).await.unwrap(), 0);
        // Two days later the completed job falls out of the window.
        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(q.sweep(policy, later).await.unwrap(), 1);
        assert_eq!(q.counts("processing").await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn complete_unknown_job() {
        let q = queue();
        assert!(matches!(
            q.complete(JobId::new()).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
