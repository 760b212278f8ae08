//! Ingestion worker
//!
//! Consumes normalized event drafts from the adapter channel, persists
//! them to the event log (deduplicating on `(source, external_id)`),
//! and enqueues one `processing` job per new row.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event_log::{EventLog, NewRawEvent};
use crate::pipeline::PipelineProcessor;
use crate::queue::{EnqueueOptions, JobQueue, QUEUE_PROCESSING};
use crate::types::{EventId, EventLogError, MemoryError};

pub struct IngestionWorker {
    event_log: Arc<dyn EventLog>,
    queue: Arc<dyn JobQueue>,
}

/// Handle for the running ingestion task; resolves when the adapter
/// channel closes or shutdown is requested.
pub struct IngestionHandle {
    task: JoinHandle<()>,
}

impl IngestionHandle {
    /// Wait for the worker to drain and stop. Close the feeding channel
    /// (drop all senders) to initiate shutdown.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl IngestionWorker {
    pub fn new(event_log: Arc<dyn EventLog>, queue: Arc<dyn JobQueue>) -> Self {
        Self { event_log, queue }
    }

    /// Ingest one draft. Returns the new event id, or `None` when the
    /// event was a duplicate and dropped.
    pub async fn ingest_one(&self, draft: NewRawEvent) -> Result<Option<EventId>, MemoryError> {
        if let Some(ref external_id) = draft.external_id {
            if self
                .event_log
                .find_by_external_id(&draft.source, external_id)
                .await?
                .is_some()
            {
                tracing::debug!(
                    source = %draft.source,
                    external_id = %external_id,
                    "dropping duplicate event"
                );
                return Ok(None);
            }
        }

        let source = draft.source.clone();
        let id = match self.event_log.insert(draft).await {
            Ok(id) => id,
            // Lost the race against a concurrent insert of the same
            // external id: same outcome as the lookup above.
            Err(EventLogError::Duplicate { existing }) => {
                tracing::debug!(source = %source, existing = %existing, "duplicate on insert");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.queue
            .add(
                QUEUE_PROCESSING,
                PipelineProcessor::job_payload(id),
                EnqueueOptions::default(),
            )
            .await?;

        tracing::debug!(event_id = %id, source = %source, "event staged for processing");
        Ok(Some(id))
    }

    /// Re-enqueue processing jobs for events left pending by a crash.
    pub async fn recover_pending(&self, limit: usize) -> Result<usize, MemoryError> {
        let pending = self.event_log.get_pending(limit).await?;
        let count = pending.len();
        for event in pending {
            self.queue
                .add(
                    QUEUE_PROCESSING,
                    PipelineProcessor::job_payload(event.id),
                    EnqueueOptions::default(),
                )
                .await?;
        }
        if count > 0 {
            tracing::info!(count, "re-enqueued pending events for recovery");
        }
        Ok(count)
    }

    /// Spawn the channel-draining task.
    pub fn spawn(self, mut receiver: mpsc::Receiver<NewRawEvent>) -> IngestionHandle {
        let task = tokio::spawn(async move {
            tracing::debug!("ingestion worker started");
            while let Some(draft) = receiver.recv().await {
                if let Err(e) = self.ingest_one(draft).await {
                    tracing::warn!(error = %e, "event ingestion failed");
                }
            }
            tracing::debug!("ingestion worker stopped");
        });
        IngestionHandle { task }
    }
}
