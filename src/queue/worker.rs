//! Queue worker pool
//!
//! Pulls jobs from one named queue and runs them through a handler with
//! bounded concurrency and an optional rate limit. Handler errors are
//! reported back to the queue, which applies the backoff-retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BackoffPolicy, JobQueue, JobState, QueueJob};
use crate::types::MemoryError;

/// Handler invoked for each reserved job.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> Result<(), MemoryError>;
}

/// Rate limit: at most `max_jobs` handled per `interval`, across all
/// worker tasks of one `QueueWorker`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_jobs: u32,
    pub interval: Duration,
}

/// Worker tuning options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub rate_limit: Option<RateLimit>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            rate_limit: None,
        }
    }
}

struct RateWindow {
    window_start: tokio::time::Instant,
    count: u32,
}

/// A pool of worker tasks bound to one named queue.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    handler: Arc<dyn JobHandler>,
    backoff: BackoffPolicy,
    options: WorkerOptions,
}

/// Handle for a running worker pool; dropping it does not stop the
/// workers, call [`WorkerHandle::shutdown`].
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal all worker tasks to stop and wait for them to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        backoff: BackoffPolicy,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            backoff,
            options,
        }
    }

    /// Spawn the worker tasks.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rate = self.options.rate_limit.map(|limit| {
            (
                limit,
                Arc::new(Mutex::new(RateWindow {
                    window_start: tokio::time::Instant::now(),
                    count: 0,
                })),
            )
        });

        let mut tasks = Vec::with_capacity(self.options.concurrency.max(1));
        for worker_index in 0..self.options.concurrency.max(1) {
            let queue = self.queue.clone();
            let queue_name = self.queue_name.clone();
            let handler = self.handler.clone();
            let backoff = self.backoff;
            let poll_interval = self.options.poll_interval;
            let rate = rate.clone();
            let mut shutdown = shutdown_rx.clone();

            tasks.push(tokio::spawn(async move {
                tracing::debug!(queue = %queue_name, worker = worker_index, "queue worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }

                    if let Some((limit, window)) = &rate {
                        if !try_acquire(limit, window) {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                    }

                    let job = match queue.reserve(&queue_name, Utc::now()).await {
                        Ok(Some(job)) => job,
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(queue = %queue_name, error = %e, "reserve failed");
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                    };

                    let job_id = job.id;
                    match handler.handle(&job).await {
                        Ok(()) => {
                            if let Err(e) = queue.complete(job_id).await {
                                tracing::warn!(job = %job_id, error = %e, "complete failed");
                            }
                        }
                        Err(e) => {
                            let message = e.to_string();
                            tracing::warn!(
                                queue = %queue_name,
                                job = %job_id,
                                attempt = job.attempts + 1,
                                error = %message,
                                "job handler failed"
                            );
                            match queue.retry_or_fail(job_id, &message, backoff, Utc::now()).await {
                                Ok(JobState::Failed) => {
                                    tracing::error!(
                                        queue = %queue_name,
                                        job = %job_id,
                                        "job dead-lettered after max attempts"
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(job = %job_id, error = %e, "retry_or_fail failed");
                                }
                            }
                        }
                    }
                }
                tracing::debug!(queue = %queue_name, worker = worker_index, "queue worker stopped");
            }));
        }

        WorkerHandle { shutdown_tx, tasks }
    }
}

fn try_acquire(limit: &RateLimit, window: &Mutex<RateWindow>) -> bool {
    let mut state = window.lock();
    let now = tokio::time::Instant::now();
    if now.duration_since(state.window_start) >= limit.interval {
        state.window_start = now;
        state.count = 0;
    }
    if state.count < limit.max_jobs {
        state.count += 1;
        true
    } else {
        false
    }
}
