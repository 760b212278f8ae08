//! Token-budgeted context builder
//!
//! Assembles the prompt for the agent: system prompt, retrieved
//! knowledge, and bounded conversation history, greedily packed under a
//! token budget with a formatting reserve. Token counts use the
//! ⌈chars/4⌉ estimator throughout.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ContextConfig;
use crate::providers::{estimate_tokens, ChatMessage};
use crate::retrieval::{RetrievalOptions, RetrievalService, ScoredChunk};
use crate::types::ContextError;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a knowledgeable assistant with access to your \
     team's collective memory: past conversations, decisions, issues, and code changes. \
     Ground your answers in the provided context and say so when the context does not \
     cover the question.";

const CHUNK_SEPARATOR: &str = "\n---\n";

/// Per-call overrides of the configured budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    pub max_tokens: Option<usize>,
    pub system_prompt: Option<String>,
    pub include_history: bool,
    pub max_history: Option<usize>,
    pub relevance_threshold: Option<f32>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            system_prompt: None,
            include_history: true,
            max_history: None,
            relevance_threshold: None,
        }
    }
}

/// Metadata about one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub chunks_used: usize,
    pub total_tokens: usize,
    pub average_relevance: f32,
    /// Distinct source types of the included chunks.
    pub sources: Vec<String>,
}

/// An assembled, budget-conforming prompt.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub system_prompt: String,
    pub knowledge_context: String,
    pub conversation_history: Vec<ChatMessage>,
    pub metadata: ContextMetadata,
}

impl BuiltContext {
    /// System prompt with the knowledge context appended, as handed to
    /// the model.
    pub fn system_with_context(&self) -> String {
        if self.knowledge_context.is_empty() {
            return self.system_prompt.clone();
        }
        format!(
            "{}\n\nRelevant team memory:\n\n{}",
            self.system_prompt, self.knowledge_context
        )
    }
}

pub struct ContextBuilder {
    retrieval: Arc<RetrievalService>,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(retrieval: Arc<RetrievalService>, config: ContextConfig) -> Self {
        Self { retrieval, config }
    }

    /// Assemble a context for `query`.
    ///
    /// Budget order: the system prompt is reserved first, then the
    /// history, then chunks greedily in similarity-descending order
    /// until the next chunk would break the budget minus the
    /// formatting reserve.
    pub async fn build(
        &self,
        query: &str,
        history: &[ChatMessage],
        opts: &ContextOptions,
    ) -> Result<BuiltContext, ContextError> {
        let max_tokens = opts.max_tokens.unwrap_or(self.config.max_tokens);
        let system_prompt = opts
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let threshold = opts
            .relevance_threshold
            .unwrap_or(self.config.relevance_threshold);

        let mut remaining = max_tokens.saturating_sub(estimate_tokens(&system_prompt));

        let conversation_history: Vec<ChatMessage> = if opts.include_history {
            let max_history = opts.max_history.unwrap_or(self.config.max_history);
            let start = history.len().saturating_sub(max_history);
            let kept = &history[start..];
            for message in kept {
                remaining = remaining.saturating_sub(message.estimate_tokens());
            }
            kept.to_vec()
        } else {
            Vec::new()
        };

        let retrieved = self
            .retrieval
            .search(
                query,
                &RetrievalOptions {
                    top_k: Some(self.config.max_candidates),
                    min_similarity: Some(threshold),
                    ..Default::default()
                },
            )
            .await?;

        let reserve = self.config.format_reserve;
        let mut selected: Vec<&ScoredChunk> = Vec::new();
        let mut blocks: Vec<String> = Vec::new();
        let mut used_tokens = 0usize;

        for scored in &retrieved.chunks {
            let block = format_chunk(scored);
            let block_tokens = estimate_tokens(&block) + estimate_tokens(CHUNK_SEPARATOR);
            if used_tokens + block_tokens + reserve > remaining {
                break;
            }
            used_tokens += block_tokens;
            blocks.push(block);
            selected.push(scored);
        }

        let knowledge_context = blocks.join(CHUNK_SEPARATOR);
        let average_relevance = if selected.is_empty() {
            0.0
        } else {
            selected.iter().map(|c| c.relevance).sum::<f32>() / selected.len() as f32
        };
        let mut sources: Vec<String> = Vec::new();
        for scored in &selected {
            if !sources.contains(&scored.chunk.source_type) {
                sources.push(scored.chunk.source_type.clone());
            }
        }

        let total_tokens = estimate_tokens(&system_prompt)
            + conversation_history
                .iter()
                .map(|m| m.estimate_tokens())
                .sum::<usize>()
            + estimate_tokens(&knowledge_context);

        tracing::debug!(
            chunks_used = selected.len(),
            candidates = retrieved.chunks.len(),
            total_tokens,
            "context assembled"
        );

        Ok(BuiltContext {
            system_prompt,
            knowledge_context,
            conversation_history,
            metadata: ContextMetadata {
                chunks_used: selected.len(),
                total_tokens,
                average_relevance,
                sources,
            },
        })
    }
}

/// `[Source: <type> | Relevance: <pct>]`, blank line, content.
fn format_chunk(scored: &ScoredChunk) -> String {
    format!(
        "[Source: {} | Relevance: {}%]\n\n{}",
        scored.chunk.source_type,
        (scored.relevance * 100.0).round() as i64,
        scored.chunk.content
    )
}
