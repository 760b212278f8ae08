//! Deterministic mock provider for tests and offline development.
//!
//! Embeddings are derived from the text bytes and L2-normalized, so
//! identical texts always map to identical vectors; tests that need
//! controlled geometry can pin exact vectors per text. Chat responses
//! are scripted, with an optional mode that echoes tool results back as
//! the final answer to exercise the full tool round-trip.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    ChatMessage, ChatOptions, ChatResponse, ChatRole, Completion, CompletionOptions, FinishReason,
    LlmProvider, ProviderOp, Usage,
};
use crate::types::ProviderError;

pub struct MockProvider {
    dimension: usize,
    chat_script: Mutex<VecDeque<ChatResponse>>,
    completion_script: Mutex<VecDeque<String>>,
    pinned_embeddings: Mutex<HashMap<String, Vec<f32>>>,
    echo_tool_results: bool,
    fail_completions: AtomicBool,
    fail_embeddings: AtomicBool,
}

impl MockProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chat_script: Mutex::new(VecDeque::new()),
            completion_script: Mutex::new(VecDeque::new()),
            pinned_embeddings: Mutex::new(HashMap::new()),
            echo_tool_results: false,
            fail_completions: AtomicBool::new(false),
            fail_embeddings: AtomicBool::new(false),
        }
    }

    /// Queue scripted chat responses, returned in order.
    pub fn with_chat_responses(self, responses: Vec<ChatResponse>) -> Self {
        *self.chat_script.lock() = responses.into();
        self
    }

    /// Queue scripted completion texts, returned in order.
    pub fn with_completions(self, completions: Vec<&str>) -> Self {
        *self.completion_script.lock() = completions.into_iter().map(String::from).collect();
        self
    }

    /// Pin the embedding returned for an exact text (normalized here).
    pub fn with_embedding(self, text: &str, vector: Vec<f32>) -> Self {
        self.pinned_embeddings
            .lock()
            .insert(text.to_string(), normalize(vector));
        self
    }

    /// When the script runs dry, answer with the content of the last
    /// tool result instead of a canned string.
    pub fn echoing_tool_results(mut self) -> Self {
        self.echo_tool_results = true;
        self
    }

    /// Make all subsequent completion calls fail upstream.
    pub fn failing_completions(self) -> Self {
        self.fail_completions.store(true, Ordering::SeqCst);
        self
    }

    /// Make all subsequent embedding calls fail upstream.
    pub fn failing_embeddings(self) -> Self {
        self.fail_embeddings.store(true, Ordering::SeqCst);
        self
    }

    /// Flip embedding failures at runtime (for retry tests).
    pub fn set_embeddings_failing(&self, failing: bool) {
        self.fail_embeddings.store(failing, Ordering::SeqCst);
    }

    /// Convenience: a plain text chat response.
    pub fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            model: "mock".to_string(),
        }
    }

    /// Convenience: a chat response requesting one tool call.
    pub fn tool_call_response(id: &str, tool: &str, input: serde_json::Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![super::ToolInvocation {
                id: id.to_string(),
                name: tool.to_string(),
                input,
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 8,
                total_tokens: 18,
            },
            model: "mock".to_string(),
        }
    }

    fn derive_embedding(&self, text: &str) -> Vec<f32> {
        if let Some(pinned) = self.pinned_embeddings.lock().get(text) {
            return pinned.clone();
        }

        // Deterministic byte-fold, normalized to unit length.
        let bytes = text.as_bytes();
        let mut embedding = vec![0.0f32; self.dimension];
        if bytes.is_empty() {
            embedding[0] = 1.0;
            return embedding;
        }
        for (i, value) in embedding.iter_mut().enumerate() {
            let byte = bytes[i % bytes.len()];
            *value = (byte as f32 / 255.0) * 2.0 - 1.0;
        }
        normalize(embedding)
    }
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in &mut vector {
            *value /= magnitude;
        }
    }
    vector
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, _op: ProviderOp) -> bool {
        true
    }

    fn embedding_dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn complete(
        &self,
        prompt: &str,
        _opts: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        if self.fail_completions.load(Ordering::SeqCst) {
            return Err(ProviderError::Upstream {
                message: "mock completion failure".to_string(),
            });
        }
        let text = self
            .completion_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| prompt.chars().take(200).collect());
        Ok(Completion {
            usage: Usage {
                prompt_tokens: super::estimate_tokens(prompt) as u32,
                completion_tokens: super::estimate_tokens(&text) as u32,
                total_tokens: 0,
            },
            model: "mock".to_string(),
            text,
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        if let Some(scripted) = self.chat_script.lock().pop_front() {
            return Ok(scripted);
        }
        if self.echo_tool_results {
            if let Some(result) = messages
                .iter()
                .rev()
                .find(|m| m.role == ChatRole::Tool)
            {
                return Ok(Self::text_response(&result.content));
            }
        }
        Ok(Self::text_response("done"))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(ProviderError::Upstream {
                message: "mock embedding failure".to_string(),
            });
        }
        Ok(self.derive_embedding(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn embeddings_are_deterministic_and_normalized() {
        let mock = MockProvider::new(64);
        let a = mock.embed("hello world").await.unwrap();
        let b = mock.embed("hello world").await.unwrap();
        assert_eq!(a, b);

        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn pinned_embeddings_win() {
        let mut unit = vec![0.0f32; 8];
        unit[0] = 2.0; // normalized on insert
        let mock = MockProvider::new(8).with_embedding("anchor", unit);
        let embedding = mock.embed("anchor").await.unwrap();
        assert!((embedding[0] - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn scripted_chat_then_default() {
        let mock = MockProvider::new(8).with_chat_responses(vec![
            MockProvider::tool_call_response("tc_1", "search_memory", json!({"query": "x"})),
        ]);

        let first = mock.chat(&[ChatMessage::user("q")], &ChatOptions::default()).await.unwrap();
        assert!(first.has_tool_calls());

        let second = mock.chat(&[ChatMessage::user("q")], &ChatOptions::default()).await.unwrap();
        assert_eq!(second.content, "done");
    }

    #[tokio::test]
    async fn echo_mode_returns_last_tool_result() {
        let mock = MockProvider::new(8).echoing_tool_results();
        let messages = vec![
            ChatMessage::user("who?"),
            ChatMessage::tool_result("tc_1", "search_memory", "@alice fixed it"),
        ];
        let resp = mock.chat(&messages, &ChatOptions::default()).await.unwrap();
        assert_eq!(resp.content, "@alice fixed it");
    }

    #[tokio::test]
    async fn failing_completions_surface_upstream() {
        let mock = MockProvider::new(8).failing_completions();
        let err = mock
            .complete("summarize this", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { .. }));
    }
}
