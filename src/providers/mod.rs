//! LLM provider abstraction
//!
//! A single trait exposes completion, chat, embedding, and token
//! counting across back-ends. Each implementation declares which
//! operations it supports; unsupported calls fail fast. The manager
//! holds named providers and resolves a usable one with fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProviderError;

mod anthropic;
mod chat;
mod manager;
mod mock;
mod openai;

pub use anthropic::AnthropicProvider;
pub use chat::{ChatMessage, ChatRole, ToolInvocation};
pub use manager::ProviderManager;
pub use mock::MockProvider;
pub use openai::{OpenAiEmbeddingSettings, OpenAiProvider};

/// Operations a provider may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOp {
    Complete,
    Chat,
    Embed,
    EmbedBatch,
    CountTokens,
}

impl std::fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderOp::Complete => "complete",
            ProviderOp::Chat => "chat",
            ProviderOp::Embed => "embed",
            ProviderOp::EmbedBatch => "embed_batch",
            ProviderOp::CountTokens => "count_tokens",
        };
        write!(f, "{s}")
    }
}

/// Options for single-prompt completion.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
            stop_sequences: Vec::new(),
        }
    }
}

/// Options for multi-turn chat.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
    /// Tool definitions offered to the model for function calling.
    pub tools: Vec<ToolDefinition>,
}

/// A tool definition passed to a chat call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: Value,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    MaxTokens,
    ContentFilter,
}

/// Result of a completion call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub model: String,
}

/// Result of a chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub model: String,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Estimate token count as ⌈chars/4⌉.
///
/// Used wherever a provider-specific counter is unavailable; sufficient
/// for budget enforcement, not billing.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Uniform interface over LLM back-ends.
///
/// Default method bodies reject the operation, so an implementation
/// only writes the operations it actually supports and reports them
/// via [`LlmProvider::supports`].
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and manager lookup.
    fn name(&self) -> &str;

    /// Whether this provider implements the given operation.
    fn supports(&self, op: ProviderOp) -> bool;

    /// Dimension of embeddings produced, when `Embed` is supported.
    fn embedding_dimension(&self) -> Option<usize> {
        None
    }

    async fn complete(
        &self,
        _prompt: &str,
        _opts: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        Err(self.unsupported(ProviderOp::Complete))
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        Err(self.unsupported(ProviderOp::Chat))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(self.unsupported(ProviderOp::Embed))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        // Naive fallback in terms of `embed`; batching back-ends override.
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Count tokens in `text`. Falls back to the ⌈chars/4⌉ heuristic.
    async fn count_tokens(&self, text: &str) -> Result<usize, ProviderError> {
        Ok(estimate_tokens(text))
    }

    /// Helper constructing the canonical `Unsupported` error.
    fn unsupported(&self, op: ProviderOp) -> ProviderError {
        ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation: op.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChatOnly;

    #[async_trait::async_trait]
    impl LlmProvider for ChatOnly {
        fn name(&self) -> &str {
            "chat-only"
        }

        fn supports(&self, op: ProviderOp) -> bool {
            matches!(op, ProviderOp::Chat | ProviderOp::CountTokens)
        }
    }

    #[tokio::test]
    async fn missing_operation_fails_fast() {
        let provider = ChatOnly;
        let err = provider.embed("text").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
        assert_eq!(
            err.to_string(),
            "Provider chat-only does not support embed"
        );
    }

    #[tokio::test]
    async fn count_tokens_heuristic() {
        let provider = ChatOnly;
        assert_eq!(provider.count_tokens("").await.unwrap(), 0);
        assert_eq!(provider.count_tokens("abcd").await.unwrap(), 1);
        assert_eq!(provider.count_tokens("abcde").await.unwrap(), 2);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens("12345678"), 2);
        assert_eq!(estimate_tokens("123456789"), 3);
    }
}
