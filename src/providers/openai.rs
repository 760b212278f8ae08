//! OpenAI-compatible provider: chat completions plus embeddings.

use serde_json::{json, Value};
use std::time::Duration;

use super::{
    ChatMessage, ChatOptions, ChatResponse, ChatRole, Completion, CompletionOptions, FinishReason,
    LlmProvider, ProviderOp, ToolInvocation, Usage,
};
use crate::config::ProviderEndpointConfig;
use crate::types::ProviderError;

/// Embedding endpoint settings; omit to disable the embed operations.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingSettings {
    pub model: String,
    pub dimensions: usize,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding: Option<OpenAiEmbeddingSettings>,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        config: &ProviderEndpointConfig,
        embedding: Option<OpenAiEmbeddingSettings>,
    ) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::Unauthenticated {
                provider: "openai".to_string(),
            })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Upstream {
                message: format!("HTTP client error: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding,
            timeout: config.timeout,
        })
    }

    fn build_chat_body(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Value {
        let turns: Vec<Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                };
                let mut obj = serde_json::Map::new();
                obj.insert("role".into(), json!(role));
                if !m.content.is_empty() || m.role != ChatRole::Assistant {
                    obj.insert("content".into(), json!(m.content));
                }
                if !m.tool_calls.is_empty() {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": c.input.to_string(),
                                }
                            })
                        })
                        .collect();
                    obj.insert("tool_calls".into(), Value::Array(calls));
                }
                if let Some(ref id) = m.tool_call_id {
                    obj.insert("tool_call_id".into(), json!(id));
                }
                Value::Object(obj)
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": turns,
            "max_tokens": opts.max_tokens.max(1),
            "temperature": opts.temperature,
        });
        if !opts.stop_sequences.is_empty() {
            body["stop"] = json!(opts.stop_sequences);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn parse_chat_response(&self, resp: &Value) -> Result<ChatResponse, ProviderError> {
        let choice = resp
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| ProviderError::InvalidResponse("no choices".to_string()))?;
        let message = choice
            .get("message")
            .ok_or_else(|| ProviderError::InvalidResponse("no message in choice".to_string()))?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();

        let tool_calls = message
            .get("tool_calls")
            .and_then(|tc| tc.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc.get("id")?.as_str()?.to_string();
                        let func = tc.get("function")?;
                        let name = func.get("name")?.as_str()?.to_string();
                        let arguments = func.get("arguments")?.as_str()?;
                        let input = serde_json::from_str(arguments).unwrap_or(json!({}));
                        Some(ToolInvocation { id, name, input })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let finish_reason = match choice.get("finish_reason").and_then(|f| f.as_str()) {
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::MaxTokens,
            Some("content_filter") => FinishReason::ContentFilter,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };

        let usage = resp
            .get("usage")
            .map(|u| Usage {
                prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                completion_tokens: u
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            })
            .unwrap_or_default();

        let model = resp
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content,
            tool_calls,
            finish_reason,
            usage,
            model,
        })
    }

    async fn send(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Upstream {
                        message: format!("request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Unauthenticated {
                provider: "openai".to_string(),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                message: format!("openai returned {status}: {detail}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("JSON parse error: {e}")))
    }

    fn parse_embeddings(&self, resp: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
        let data = resp
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| ProviderError::InvalidResponse("missing data field".to_string()))?;

        // Sort by index; the API does not guarantee input order.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let embedding = item
                .get("embedding")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    ProviderError::InvalidResponse("missing embedding in item".to_string())
                })?
                .iter()
                .map(|v| {
                    v.as_f64().map(|f| f as f32).ok_or_else(|| {
                        ProviderError::InvalidResponse("non-numeric embedding value".to_string())
                    })
                })
                .collect::<Result<Vec<f32>, _>>()?;
            indexed.push((index, embedding));
        }
        indexed.sort_by_key(|(i, _)| *i);

        if indexed.len() != expected {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {expected} embeddings, got {}",
                indexed.len()
            )));
        }
        Ok(indexed.into_iter().map(|(_, e)| e).collect())
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports(&self, op: ProviderOp) -> bool {
        match op {
            ProviderOp::Complete | ProviderOp::Chat | ProviderOp::CountTokens => true,
            ProviderOp::Embed | ProviderOp::EmbedBatch => self.embedding.is_some(),
        }
    }

    fn embedding_dimension(&self) -> Option<usize> {
        self.embedding.as_ref().map(|e| e.dimensions)
    }

    async fn complete(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        let messages = [ChatMessage::user(prompt)];
        let chat_opts = ChatOptions {
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            stop_sequences: opts.stop_sequences.clone(),
            tools: Vec::new(),
        };
        let response = self.chat(&messages, &chat_opts).await?;
        Ok(Completion {
            text: response.content,
            usage: response.usage,
            model: response.model,
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        let body = self.build_chat_body(messages, opts);
        tracing::debug!(model = %self.model, messages = messages.len(), "openai chat call");
        let resp = self.send("/chat/completions", body).await?;
        self.parse_chat_response(&resp)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| ProviderError::InvalidResponse("empty embedding batch".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let settings = self
            .embedding
            .as_ref()
            .ok_or_else(|| self.unsupported(ProviderOp::EmbedBatch))?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": settings.model,
            "input": texts,
            "dimensions": settings.dimensions,
        });
        let resp = self.send("/embeddings", body).await?;
        self.parse_embeddings(&resp, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(
            &ProviderEndpointConfig {
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: Some("sk-test".to_string()),
                timeout: Duration::from_secs(5),
            },
            Some(OpenAiEmbeddingSettings {
                model: "text-embedding-3-small".to_string(),
                dimensions: 768,
            }),
        )
        .unwrap()
    }

    #[test]
    fn chat_body_serializes_tool_round_trip() {
        let p = provider();
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("q"),
            ChatMessage::assistant_tool_calls(
                "",
                vec![ToolInvocation {
                    id: "call_1".into(),
                    name: "search_memory".into(),
                    input: json!({"query": "jwt"}),
                }],
            ),
            ChatMessage::tool_result("call_1", "search_memory", "result"),
        ];
        let body = p.build_chat_body(&messages, &ChatOptions::default());

        let turns = body["messages"].as_array().unwrap();
        assert_eq!(turns[0]["role"], "system");
        assert_eq!(turns[2]["tool_calls"][0]["function"]["name"], "search_memory");
        assert_eq!(turns[3]["role"], "tool");
        assert_eq!(turns[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn parses_tool_call_arguments_as_json() {
        let p = provider();
        let resp = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "search_memory",
                            "arguments": "{\"query\": \"auth\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 8, "total_tokens": 18},
            "model": "gpt-4o"
        });

        let parsed = p.parse_chat_response(&resp).unwrap();
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.tool_calls[0].input["query"], "auth");
    }

    #[test]
    fn embeddings_sorted_by_index() {
        let p = provider();
        let resp = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let parsed = p.parse_embeddings(&resp, 2).unwrap();
        assert_eq!(parsed[0], vec![1.0, 0.0]);
        assert_eq!(parsed[1], vec![0.0, 1.0]);
    }

    #[test]
    fn embed_unsupported_without_settings() {
        let p = OpenAiProvider::new(
            &ProviderEndpointConfig {
                model: "gpt-4o".to_string(),
                base_url: "u".to_string(),
                api_key: Some("sk".to_string()),
                timeout: Duration::from_secs(5),
            },
            None,
        )
        .unwrap();
        assert!(!p.supports(ProviderOp::Embed));
    }
}
