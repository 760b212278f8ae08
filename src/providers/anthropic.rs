//! Anthropic Messages API provider.
//!
//! Supports completion and chat with native tool use. Anthropic has no
//! embeddings endpoint, so `embed` is unsupported; pair this provider
//! with an OpenAI embedder in the manager.

use serde_json::{json, Value};
use std::time::Duration;

use super::{
    ChatMessage, ChatOptions, ChatResponse, ChatRole, Completion, CompletionOptions, FinishReason,
    LlmProvider, ProviderOp, ToolInvocation, Usage,
};
use crate::config::ProviderEndpointConfig;
use crate::types::ProviderError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderEndpointConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::Unauthenticated {
                provider: "anthropic".to_string(),
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
            timeout: config.timeout,
        })
    }

    fn build_body(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Value {
        // Anthropic takes the system prompt as a top-level field.
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| match m.role {
                ChatRole::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.as_deref().unwrap_or(""),
                        "content": m.content,
                    }]
                }),
                ChatRole::Assistant if !m.tool_calls.is_empty() => {
                    let mut blocks = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": m.content}));
                    }
                    for call in &m.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.input,
                        }));
                    }
                    json!({"role": "assistant", "content": blocks})
                }
                ChatRole::Assistant => json!({"role": "assistant", "content": m.content}),
                _ => json!({"role": "user", "content": m.content}),
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": turns,
            "max_tokens": opts.max_tokens.max(1),
        });
        if opts.temperature > 0.0 {
            body["temperature"] = json!(opts.temperature);
        }
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        if !opts.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(opts.stop_sequences);
        }
        if !opts.tools.is_empty() {
            let tools: Vec<Value> = opts
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn parse_response(&self, resp: &Value) -> Result<ChatResponse, ProviderError> {
        let blocks = resp
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ProviderError::InvalidResponse("no content blocks".to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    if let (Some(id), Some(name)) = (
                        block.get("id").and_then(|v| v.as_str()),
                        block.get("name").and_then(|v| v.as_str()),
                    ) {
                        tool_calls.push(ToolInvocation {
                            id: id.to_string(),
                            name: name.to_string(),
                            input: block.get("input").cloned().unwrap_or(json!({})),
                        });
                    }
                }
                _ => {}
            }
        }

        let finish_reason = match resp.get("stop_reason").and_then(|s| s.as_str()) {
            Some("tool_use") => FinishReason::ToolCalls,
            Some("max_tokens") => FinishReason::MaxTokens,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };

        let usage = resp
            .get("usage")
            .map(|u| {
                let input = u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let output = u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                Usage {
                    prompt_tokens: input,
                    completion_tokens: output,
                    total_tokens: input + output,
                }
            })
            .unwrap_or_default();

        let model = resp
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content: text,
            tool_calls,
            finish_reason,
            usage,
            model,
        })
    }

    async fn send(&self, body: Value) -> Result<Value, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
                provider: "anthropic".to_string(),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                message: format!("anthropic returned {status}: {detail}"),
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("JSON parse error: {e}")))
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports(&self, op: ProviderOp) -> bool {
        matches!(
            op,
            ProviderOp::Complete | ProviderOp::Chat | ProviderOp::CountTokens
        )
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
        let body = self.build_body(messages, opts);
        tracing::debug!(model = %self.model, messages = messages.len(), "anthropic chat call");
        let resp = self.send(body).await?;
        self.parse_response(&resp)
    }
}
