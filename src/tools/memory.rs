//! Built-in memory tools: the agent's window into the knowledge store.
//!
//! Handlers delegate to the retrieval service and return plain JSON the
//! model can read back. Retrieval failures surface as tool errors; the
//! agent loop turns those into structured error results rather than
//! aborting.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::retrieval::{RetrievalOptions, RetrievalService, ScoredChunk};
use crate::types::ToolError;

use super::{ParameterKind, ToolContext, ToolHandler, ToolParameter, ToolRegistry, ToolSpec};

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 20;

/// Register `search_memory`, `get_recent_events`, and `find_similar`.
pub fn register_memory_tools(registry: &ToolRegistry, retrieval: Arc<RetrievalService>) {
    registry.register(ToolSpec {
        name: "search_memory".to_string(),
        description: "Semantic search over the team's collective memory. \
                      Returns the most relevant remembered chunks for a query."
            .to_string(),
        parameters: vec![
            ToolParameter::required("query", ParameterKind::String, "natural-language query"),
            ToolParameter::optional("limit", ParameterKind::Number, "max results (default 5)"),
        ],
        category: Some("memory".to_string()),
        handler: Arc::new(SearchMemoryTool {
            retrieval: retrieval.clone(),
        }),
    });

    registry.register(ToolSpec {
        name: "get_recent_events".to_string(),
        description: "Most recently remembered chunks from one source \
                      (slack, jira, git), newest first."
            .to_string(),
        parameters: vec![
            ToolParameter::required("source", ParameterKind::String, "source type"),
            ToolParameter::optional("limit", ParameterKind::Number, "max results (default 5)"),
        ],
        category: Some("memory".to_string()),
        handler: Arc::new(RecentEventsTool {
            retrieval: retrieval.clone(),
        }),
    });

    registry.register(ToolSpec {
        name: "find_similar".to_string(),
        description: "Chunks similar to a known chunk, by its stored \
                      embedding. The anchor chunk is excluded."
            .to_string(),
        parameters: vec![
            ToolParameter::required("chunk_id", ParameterKind::String, "anchor chunk id"),
            ToolParameter::optional("limit", ParameterKind::Number, "max results (default 5)"),
        ],
        category: Some("memory".to_string()),
        handler: Arc::new(FindSimilarTool { retrieval }),
    });
}

fn limit_from(input: &Value) -> usize {
    input
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, MAX_LIMIT)
}

fn scored_to_json(scored: &ScoredChunk) -> Value {
    json!({
        "id": scored.chunk.id.to_string(),
        "content": scored.chunk.content,
        "similarity": scored.similarity,
        "relevance": scored.relevance,
        "source_type": scored.chunk.source_type,
        "created_at": scored.chunk.created_at.to_rfc3339(),
    })
}

struct SearchMemoryTool {
    retrieval: Arc<RetrievalService>,
}

#[async_trait]
impl ToolHandler for SearchMemoryTool {
    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = input.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let limit = limit_from(input);

        let result = self
            .retrieval
            .search(
                query,
                &RetrievalOptions {
                    top_k: Some(limit),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool: "search_memory".to_string(),
                message: e.to_string(),
            })?;

        Ok(json!({
            "results": result.chunks.iter().map(scored_to_json).collect::<Vec<_>>(),
            "total": result.total_results,
        }))
    }
}

struct RecentEventsTool {
    retrieval: Arc<RetrievalService>,
}

#[async_trait]
impl ToolHandler for RecentEventsTool {
    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let source = input.get("source").and_then(|v| v.as_str()).unwrap_or_default();
        let limit = limit_from(input);

        let chunks = self
            .retrieval
            .get_recent(Some(source), limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool: "get_recent_events".to_string(),
                message: e.to_string(),
            })?;

        Ok(json!({
            "events": chunks
                .iter()
                .map(|chunk| {
                    json!({
                        "id": chunk.id.to_string(),
                        "content": chunk.content,
                        "source_type": chunk.source_type,
                        "created_at": chunk.created_at.to_rfc3339(),
                    })
                })
                .collect::<Vec<_>>(),
            "total": chunks.len(),
        }))
    }
}

struct FindSimilarTool {
    retrieval: Arc<RetrievalService>,
}

#[async_trait]
impl ToolHandler for FindSimilarTool {
    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let raw_id = input
            .get("chunk_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let chunk_id = raw_id
            .parse()
            .map_err(|_| ToolError::InvalidParameters {
                tool: "find_similar".to_string(),
                reason: format!("'{raw_id}' is not a chunk id"),
            })?;
        let limit = limit_from(input);

        let neighbors = self
            .retrieval
            .find_similar(chunk_id, limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool: "find_similar".to_string(),
                message: e.to_string(),
            })?;

        Ok(json!({
            "results": neighbors.iter().map(scored_to_json).collect::<Vec<_>>(),
            "total": neighbors.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::knowledge::{content_hash, KnowledgeStore, NewKnowledgeChunk, SqliteKnowledgeStore};
    use crate::providers::MockProvider;
    use crate::types::EventId;

    const DIM: usize = 4;

    async fn registry_with_memory() -> ToolRegistry {
        let store = Arc::new(SqliteKnowledgeStore::open_in_memory(DIM).unwrap());
        for (content, embedding) in [
            ("alice fixed the race condition", vec![1.0, 0.0, 0.0, 0.0]),
            ("payment service deploy notes", vec![0.9, 0.3, 0.0, 0.0]),
        ] {
            store
                .store(NewKnowledgeChunk {
                    content: content.to_string(),
                    content_hash: content_hash(content),
                    source_type: "slack".to_string(),
                    source_event_id: EventId::new(),
                    metadata: json!({}),
                    importance: 0.5,
                    embedding,
                    embedding_model: "mock".to_string(),
                })
                .await
                .unwrap();
        }

        let embedder = MockProvider::new(DIM)
            .with_embedding("race condition", vec![1.0, 0.05, 0.0, 0.0]);
        let retrieval = Arc::new(RetrievalService::new(
            store,
            Arc::new(embedder),
            None,
            RetrievalConfig::default(),
        ));

        let registry = ToolRegistry::new();
        register_memory_tools(&registry, retrieval);
        registry
    }

    #[tokio::test]
    async fn registers_all_three_tools() {
        let registry = registry_with_memory().await;
        let names: Vec<String> = registry.list().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["find_similar", "get_recent_events", "search_memory"]);
    }

    #[tokio::test]
    async fn search_memory_returns_scored_results() {
        let registry = registry_with_memory().await;
        let result = registry
            .execute(
                "search_memory",
                &json!({"query": "race condition"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();

        assert!(result["total"].as_u64().unwrap() >= 1);
        assert_eq!(
            result["results"][0]["content"],
            "alice fixed the race condition"
        );
        assert!(result["results"][0]["similarity"].as_f64().unwrap() > 0.9);
    }

    #[tokio::test]
    async fn recent_events_filters_by_source() {
        let registry = registry_with_memory().await;
        let result = registry
            .execute(
                "get_recent_events",
                &json!({"source": "slack", "limit": 1}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result["total"], 1);
        assert_eq!(result["events"][0]["source_type"], "slack");

        let empty = registry
            .execute(
                "get_recent_events",
                &json!({"source": "jira"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(empty["total"], 0);
    }

    #[tokio::test]
    async fn find_similar_rejects_bad_id() {
        let registry = registry_with_memory().await;
        let err = registry
            .execute(
                "find_similar",
                &json!({"chunk_id": "not-a-uuid"}),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn find_similar_returns_neighbors() {
        let registry = registry_with_memory().await;
        let search = registry
            .execute(
                "search_memory",
                &json!({"query": "race condition"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        let anchor_id = search["results"][0]["id"].as_str().unwrap();

        let similar = registry
            .execute(
                "find_similar",
                &json!({"chunk_id": anchor_id}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(similar["total"], 1);
        assert_eq!(similar["results"][0]["content"], "payment service deploy notes");
    }
}
