//! Retrieval service
//!
//! Embeds a natural-language query, searches the knowledge store,
//! blends similarity with importance into a relevance score, and
//! optionally reranks the head of the result list with an LLM. Rerank
//! failures are never fatal; the similarity ordering stands.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::OnceLock;

use crate::config::RetrievalConfig;
use crate::knowledge::{KnowledgeChunk, KnowledgeStore, SearchHit, SearchOptions};
use crate::providers::{CompletionOptions, LlmProvider};
use crate::types::{ChunkId, KnowledgeError, RetrievalError, Tier};

const RERANK_SNIPPET_CHARS: usize = 200;

/// A retrieved chunk with its similarity and blended relevance.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub similarity: f32,
    /// `similarity_weight·similarity + importance_weight·importance`.
    pub relevance: f32,
}

/// Result envelope for one retrieval call.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    pub query: String,
    pub total_results: usize,
    pub average_similarity: f32,
    pub retrieved_at: DateTime<Utc>,
}

/// Per-call overrides of the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub top_k: Option<usize>,
    pub min_similarity: Option<f32>,
    pub source_types: Option<Vec<String>>,
    pub tiers: Option<Vec<Tier>>,
}

pub struct RetrievalService {
    store: Arc<dyn KnowledgeStore>,
    embedder: Arc<dyn LlmProvider>,
    reranker: Option<Arc<dyn LlmProvider>>,
    config: RetrievalConfig,
}

impl RetrievalService {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: Arc<dyn LlmProvider>,
        reranker: Option<Arc<dyn LlmProvider>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            config,
        }
    }

    /// Semantic search over the knowledge store.
    pub async fn search(
        &self,
        query: &str,
        opts: &RetrievalOptions,
    ) -> Result<RetrievalResult, RetrievalError> {
        let query_vector = self
            .embedder
            .embed(query)
            .await
            .map_err(RetrievalError::Embedding)?;

        let search_opts = SearchOptions {
            source_types: opts.source_types.clone(),
            tiers: opts
                .tiers
                .clone()
                .unwrap_or_else(|| vec![Tier::Hot, Tier::Warm]),
            min_similarity: opts.min_similarity.unwrap_or(self.config.min_similarity),
            top_k: opts.top_k.unwrap_or(self.config.top_k),
            exclude_chunk: None,
        };
        let hits = self.store.search(&query_vector, &search_opts).await?;

        let mut scored = self.score(hits);
        if self.config.rerank {
            scored = self.rerank(query, scored).await;
        }

        Ok(self.envelope(query, scored))
    }

    fn score(&self, hits: Vec<SearchHit>) -> Vec<ScoredChunk> {
        hits.into_iter()
            .map(|hit| {
                let relevance = self.config.similarity_weight * hit.similarity
                    + self.config.importance_weight * hit.chunk.importance;
                ScoredChunk {
                    similarity: hit.similarity,
                    relevance,
                    chunk: hit.chunk,
                }
            })
            .collect()
    }

    fn envelope(&self, query: &str, chunks: Vec<ScoredChunk>) -> RetrievalResult {
        let total_results = chunks.len();
        let average_similarity = if chunks.is_empty() {
            0.0
        } else {
            chunks.iter().map(|c| c.similarity).sum::<f32>() / chunks.len() as f32
        };
        RetrievalResult {
            chunks,
            query: query.to_string(),
            total_results,
            average_similarity,
            retrieved_at: Utc::now(),
        }
    }

    /// Rerank the leading window with the LLM; positions beyond the
    /// window are appended unchanged. Any failure returns the input
    /// ordering.
    async fn rerank(&self, query: &str, chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let Some(ref reranker) = self.reranker else {
            return chunks;
        };
        let window = self.config.rerank_window.min(chunks.len());
        if window < 2 {
            return chunks;
        }

        let prompt = rerank_prompt(query, &chunks[..window]);
        let opts = CompletionOptions {
            max_tokens: 100,
            temperature: 0.0,
            stop_sequences: Vec::new(),
        };
        let response = match reranker.complete(&prompt, &opts).await {
            Ok(completion) => completion.text,
            Err(e) => {
                tracing::warn!(error = %e, "rerank call failed, keeping similarity order");
                return chunks;
            }
        };

        let order = parse_rerank_indices(&response, window);
        let mut head: Vec<Option<ScoredChunk>> = chunks
            .iter()
            .take(window)
            .cloned()
            .map(Some)
            .collect();
        let tail: Vec<ScoredChunk> = chunks.into_iter().skip(window).collect();

        let mut reordered = Vec::with_capacity(head.len() + tail.len());
        for index in &order {
            if let Some(chunk) = head[*index].take() {
                reordered.push(chunk);
            }
        }
        // Unmatched originals keep their relative order after the
        // reranked prefix.
        for slot in head.into_iter().flatten() {
            reordered.push(slot);
        }
        reordered.extend(tail);
        reordered
    }

    /// Fetch chunks by id, skipping unknown ids.
    pub async fn get_by_ids(
        &self,
        ids: &[ChunkId],
    ) -> Result<Vec<KnowledgeChunk>, RetrievalError> {
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(chunk) = self.store.get_by_id(*id).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// Most recent chunks, optionally for one source type.
    pub async fn get_recent(
        &self,
        source_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, RetrievalError> {
        Ok(self.store.get_by_source(source_type, limit).await?)
    }

    /// Neighbors of a known chunk by its stored embedding, the anchor
    /// itself excluded.
    pub async fn find_similar(
        &self,
        chunk_id: ChunkId,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let anchor = self
            .store
            .get_by_id(chunk_id)
            .await?
            .ok_or(KnowledgeError::NotFound(chunk_id))?;

        let opts = SearchOptions {
            min_similarity: self.config.min_similarity,
            top_k: limit,
            exclude_chunk: Some(chunk_id),
            ..Default::default()
        };
        let hits = self.store.search(&anchor.embedding, &opts).await?;
        Ok(self.score(hits))
    }
}

/// Build the rerank prompt: the query plus an enumerated list of
/// truncated snippets.
pub fn rerank_prompt(query: &str, chunks: &[ScoredChunk]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Order the following results by relevance to the query, most \
         relevant first. Respond with a comma-separated list of indices \
         and nothing else.\n\n",
    );
    prompt.push_str(&format!("Query: {query}\n\nResults:\n"));
    for (i, scored) in chunks.iter().enumerate() {
        let snippet: String = scored
            .chunk
            .content
            .chars()
            .take(RERANK_SNIPPET_CHARS)
            .collect();
        prompt.push_str(&format!("[{i}] {snippet}\n"));
    }
    prompt
}

/// Extract result indices from a rerank response: integers in order of
/// appearance, in-range, first occurrence wins.
pub fn parse_rerank_indices(response: &str, window: usize) -> Vec<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let digits = RE.get_or_init(|| Regex::new(r"\d+").unwrap());

    let mut seen = vec![false; window];
    let mut order = Vec::new();
    for m in digits.find_iter(response) {
        if let Ok(index) = m.as_str().parse::<usize>() {
            if index < window && !seen[index] {
                seen[index] = true;
                order.push(index);
            }
        }
    }
    order
}
