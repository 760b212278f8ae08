//! Multi-stage processing pipeline
//!
//! Enrichment → summarization → embedding → storage, driven as one
//! queue job per raw event. The stages are pure functions over typed
//! records; the durable checkpoints are the event's processing status
//! and the presence of a knowledge chunk, so redelivery after a crash
//! is safe at every point.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::event_log::{EventLog, RawEvent};
use crate::knowledge::{KnowledgeStore, NewKnowledgeChunk, StoreOutcome};
use crate::providers::LlmProvider;
use crate::queue::{JobHandler, QueueJob};
use crate::types::{EventId, MemoryError, ProcessingStatus};

pub mod embed;
pub mod enrich;
pub mod summarize;

pub use embed::{embed_summaries, embed_summary};
pub use enrich::{enrich, extract_keywords, extract_text};
pub use summarize::{summarization_prompt, summarize, truncate_at_word_boundary};

/// Entities extracted from an event's text and payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entities {
    pub users: Vec<String>,
    pub mentions: Vec<String>,
    pub links: Vec<String>,
    pub keywords: Vec<String>,
}

/// Output of the enrichment stage.
#[derive(Debug, Clone)]
pub struct EnrichedEvent {
    pub event: RawEvent,
    pub extracted_text: String,
    pub entities: Entities,
    pub importance: f32,
}

/// Output of the summarization stage.
#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub tokens_used: u32,
    /// True when the LLM call failed and truncation was used instead.
    pub fallback: bool,
}

/// Output of the embedding stage.
#[derive(Debug, Clone)]
pub struct EmbeddedSummary {
    pub embedding: Vec<f32>,
    pub embedding_model: String,
    pub content_hash: String,
}

/// Runs the full pipeline for the `processing` queue.
pub struct PipelineProcessor {
    event_log: Arc<dyn EventLog>,
    knowledge: Arc<dyn KnowledgeStore>,
    summarizer: Arc<dyn LlmProvider>,
    embedder: Arc<dyn LlmProvider>,
    embedding_model: String,
}

impl PipelineProcessor {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        knowledge: Arc<dyn KnowledgeStore>,
        summarizer: Arc<dyn LlmProvider>,
        embedder: Arc<dyn LlmProvider>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            event_log,
            knowledge,
            summarizer,
            embedder,
            embedding_model: embedding_model.into(),
        }
    }

    /// Payload carried by a `processing` job.
    pub fn job_payload(event_id: EventId) -> Value {
        json!({ "event_id": event_id.to_string() })
    }

    fn event_id_from_payload(payload: &Value) -> Option<EventId> {
        payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Run enrichment through storage for one event.
    ///
    /// Transient failures (embedding provider, storage) propagate to
    /// the queue for backoff retry; summarization failures fall back to
    /// truncation and never fail the job.
    pub async fn process_event(
        &self,
        event_id: EventId,
    ) -> Result<Option<StoreOutcome>, MemoryError> {
        let Some(event) = self.event_log.get(event_id).await? else {
            tracing::warn!(event_id = %event_id, "processing job for unknown event, dropping");
            return Ok(None);
        };
        if event.status == ProcessingStatus::Completed {
            // At-least-once delivery: a completed event means an earlier
            // delivery already got through.
            return Ok(None);
        }

        self.event_log
            .mark_status(event_id, ProcessingStatus::Processing, chrono::Utc::now())
            .await?;

        let enriched = enrich::enrich(&event);
        let summary = summarize::summarize(&self.summarizer, &enriched).await;
        let embedded =
            embed::embed_summary(&self.embedder, &summary.text, &self.embedding_model)
                .await
                .map_err(MemoryError::Provider)?;

        let chunk = NewKnowledgeChunk {
            content: summary.text,
            content_hash: embedded.content_hash,
            source_type: event.source.clone(),
            source_event_id: event.id,
            metadata: json!({
                "event_type": event.event_type,
                "entities": enriched.entities,
                "summary_fallback": summary.fallback,
                "summary_tokens": summary.tokens_used,
            }),
            importance: enriched.importance,
            embedding: embedded.embedding,
            embedding_model: embedded.embedding_model,
        };

        let outcome = self.knowledge.store(chunk).await?;
        if outcome.was_deduplicated() {
            tracing::debug!(
                event_id = %event_id,
                chunk_id = %outcome.id(),
                "summary content already stored, reusing chunk"
            );
        }

        self.event_log
            .mark_status(event_id, ProcessingStatus::Completed, chrono::Utc::now())
            .await?;

        tracing::info!(
            event_id = %event_id,
            chunk_id = %outcome.id(),
            source = %event.source,
            "event processed into knowledge chunk"
        );
        Ok(Some(outcome))
    }
}

#[async_trait::async_trait]
impl JobHandler for PipelineProcessor {
    async fn handle(&self, job: &QueueJob) -> Result<(), MemoryError> {
        let Some(event_id) = Self::event_id_from_payload(&job.payload) else {
            tracing::error!(job = %job.id, "processing job with malformed payload, dropping");
            return Ok(());
        };

        match self.process_event(event_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Last delivery about to dead-letter: record the terminal
                // state on the event so the pipeline invariant holds.
                if job.attempts + 1 >= job.max_attempts {
                    if let Err(mark_err) = self
                        .event_log
                        .mark_status(event_id, ProcessingStatus::Failed, chrono::Utc::now())
                        .await
                    {
                        tracing::warn!(
                            event_id = %event_id,
                            error = %mark_err,
                            "failed to mark event failed"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{NewRawEvent, SqliteEventLog};
    use crate::knowledge::{SearchOptions, SqliteKnowledgeStore};
    use crate::providers::MockProvider;
    use crate::types::Tier;
    use serde_json::json;

    const DIM: usize = 32;

    struct Fixture {
        event_log: Arc<SqliteEventLog>,
        knowledge: Arc<SqliteKnowledgeStore>,
        processor: PipelineProcessor,
    }

    fn fixture(provider: MockProvider) -> Fixture {
        let event_log = Arc::new(SqliteEventLog::open_in_memory().unwrap());
        let knowledge = Arc::new(SqliteKnowledgeStore::open_in_memory(DIM).unwrap());
        let provider: Arc<dyn LlmProvider> = Arc::new(provider);
        let processor = PipelineProcessor::new(
            event_log.clone(),
            knowledge.clone(),
            provider.clone(),
            provider,
            "mock-embed",
        );
        Fixture {
            event_log,
            knowledge,
            processor,
        }
    }

    async fn ingest(fixture: &Fixture, text: &str) -> EventId {
        fixture
            .event_log
            .insert(NewRawEvent::new("slack", "message", json!({"text": text})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_creates_hot_chunk() {
        let f = fixture(MockProvider::new(DIM).with_completions(vec!["JWT picked for API auth"]));
        let event_id = ingest(&f, "We need JWT for the API").await;

        let outcome = f.processor.process_event(event_id).await.unwrap().unwrap();
        assert!(!outcome.was_deduplicated());

        let chunk = f.knowledge.get_by_id(outcome.id()).await.unwrap().unwrap();
        assert_eq!(chunk.content, "JWT picked for API auth");
        assert_eq!(chunk.tier, Tier::Hot);
        assert_eq!(chunk.source_event_id, event_id);
        assert_eq!(chunk.metadata["summary_fallback"], false);

        let event = f.event_log.get(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, ProcessingStatus::Completed);
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn summarizer_failure_still_completes_with_truncation() {
        let f = fixture(MockProvider::new(DIM).failing_completions());
        let text = format!("incident report {}", "detail ".repeat(60));
        let event_id = ingest(&f, &text).await;

        let outcome = f.processor.process_event(event_id).await.unwrap().unwrap();
        let chunk = f.knowledge.get_by_id(outcome.id()).await.unwrap().unwrap();

        assert_eq!(chunk.content, truncate_at_word_boundary(&text, 200));
        assert!(chunk.content.ends_with("..."));
        assert_eq!(chunk.metadata["summary_fallback"], true);

        let event = f.event_log.get(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn identical_summaries_dedup_to_one_chunk() {
        let f = fixture(
            MockProvider::new(DIM).with_completions(vec!["same summary", "same summary"]),
        );
        let first = ingest(&f, "message one").await;
        let second = ingest(&f, "message two").await;

        let outcome_one = f.processor.process_event(first).await.unwrap().unwrap();
        let outcome_two = f.processor.process_event(second).await.unwrap().unwrap();

        assert_eq!(outcome_one.id(), outcome_two.id());
        assert!(outcome_two.was_deduplicated());
        assert_eq!(f.knowledge.stats().await.unwrap().total, 1);

        // Both events still complete.
        for id in [first, second] {
            let event = f.event_log.get(id).await.unwrap().unwrap();
            assert_eq!(event.status, ProcessingStatus::Completed);
        }
    }

    #[tokio::test]
    async fn embedding_failure_propagates_for_retry() {
        let f = fixture(MockProvider::new(DIM).failing_embeddings());
        let event_id = ingest(&f, "will not embed").await;

        let err = f.processor.process_event(event_id).await.unwrap_err();
        assert!(err.kind().is_retryable());

        // Event left in processing, ready for redelivery.
        let event = f.event_log.get(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn completed_events_are_skipped_on_redelivery() {
        let f = fixture(MockProvider::new(DIM).with_completions(vec!["summary"]));
        let event_id = ingest(&f, "deliver twice").await;

        f.processor.process_event(event_id).await.unwrap().unwrap();
        let second = f.processor.process_event(event_id).await.unwrap();
        assert!(second.is_none());
        assert_eq!(f.knowledge.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn handler_marks_event_failed_on_last_attempt() {
        use crate::queue::{EnqueueOptions, JobQueue, SqliteJobQueue};

        let f = fixture(MockProvider::new(DIM).failing_embeddings());
        let event_id = ingest(&f, "poisoned event").await;

        let queue = SqliteJobQueue::open_in_memory(3).unwrap();
        queue
            .add(
                crate::queue::QUEUE_PROCESSING,
                PipelineProcessor::job_payload(event_id),
                EnqueueOptions {
                    max_attempts: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job = queue
            .reserve(crate::queue::QUEUE_PROCESSING, chrono::Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert!(f.processor.handle(&job).await.is_err());

        let event = f.event_log.get(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn chunks_are_searchable_after_processing() {
        // Truncation fallback keeps the chunk content equal to the
        // event text, which pins the embedding geometry for the query.
        let f = fixture(MockProvider::new(DIM).failing_completions());

        let event_id = ingest(&f, "Use RS256 for JWT signing").await;
        f.processor.process_event(event_id).await.unwrap();

        let embedder: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(DIM));
        let query = embedder.embed("Use RS256 for JWT signing").await.unwrap();
        let hits = f
            .knowledge
            .search(
                &query,
                &SearchOptions {
                    min_similarity: 0.9,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity > 0.999);
    }
}
