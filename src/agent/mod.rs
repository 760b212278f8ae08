//! Tool-using agent loop
//!
//! Iterative exchange between the LLM and the tool registry: the model
//! either answers (terminal) or requests tool calls, each of which is
//! answered by exactly one tool-result message before the next LLM
//! call. Failed tools feed structured error objects back into the
//! transcript so the model can recover. The loop stops on a tool-free
//! response, the iteration cap, or the caller's deadline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AgentConfig;
use crate::context::{BuiltContext, ContextBuilder, ContextOptions};
use crate::providers::{ChatMessage, ChatOptions, ProviderManager};
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{AgentError, MemoryError};

/// Terminal answer when the model keeps requesting tools past the cap.
pub const ITERATION_LIMIT_MESSAGE: &str = "unable to complete request within iteration limit";

/// One observable step of an agent run. Tracing, not correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStep {
    Thinking {
        at: DateTime<Utc>,
        text: String,
    },
    ToolUse {
        at: DateTime<Utc>,
        tool: String,
        input: Value,
        result: Value,
    },
    Message {
        at: DateTime<Utc>,
        text: String,
    },
}

/// One agent request.
#[derive(Debug, Clone)]
pub struct AgentQuery {
    pub query: String,
    pub history: Vec<ChatMessage>,
    pub user_id: Option<String>,
    /// Whether to ground the system prompt in retrieved memory.
    pub include_memory_context: bool,
}

impl AgentQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            history: Vec::new(),
            user_id: None,
            include_memory_context: true,
        }
    }
}

/// The agent's answer with its transcript.
#[derive(Debug, Clone)]
pub struct AgentAnswer {
    pub response: String,
    pub steps: Vec<AgentStep>,
    /// Distinct tool names in first-use order.
    pub tools_used: Vec<String>,
    pub iterations: u32,
    pub success: bool,
    pub duration: Duration,
}

pub struct AgentService {
    providers: Arc<ProviderManager>,
    context_builder: Arc<ContextBuilder>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl AgentService {
    pub fn new(
        providers: Arc<ProviderManager>,
        context_builder: Arc<ContextBuilder>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            providers,
            context_builder,
            registry,
            config,
        }
    }

    /// Answer a query, grounding the model in retrieved memory and
    /// letting it call tools. On deadline exhaustion the best partial
    /// answer is returned with `success = false`.
    pub async fn query(&self, request: AgentQuery) -> Result<AgentAnswer, MemoryError> {
        let started = Instant::now();
        let steps: Arc<Mutex<Vec<AgentStep>>> = Arc::new(Mutex::new(Vec::new()));
        let tools_used: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let outcome = tokio::time::timeout(
            self.config.deadline,
            self.run_loop(&request, steps.clone(), tools_used.clone()),
        )
        .await;

        let duration = started.elapsed();
        match outcome {
            Ok(Ok((response, iterations, success))) => Ok(AgentAnswer {
                response,
                steps: steps.lock().clone(),
                tools_used: tools_used.lock().clone(),
                iterations,
                success,
                duration,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(deadline = ?self.config.deadline, "agent deadline exhausted");
                let recorded = steps.lock().clone();
                let partial = recorded
                    .iter()
                    .rev()
                    .find_map(|step| match step {
                        AgentStep::Message { text, .. } | AgentStep::Thinking { text, .. } => {
                            Some(text.clone())
                        }
                        _ => None,
                    })
                    .unwrap_or_default();
                Ok(AgentAnswer {
                    response: partial,
                    steps: recorded,
                    tools_used: tools_used.lock().clone(),
                    iterations: 0,
                    success: false,
                    duration,
                })
            }
        }
    }

    async fn run_loop(
        &self,
        request: &AgentQuery,
        steps: Arc<Mutex<Vec<AgentStep>>>,
        tools_used: Arc<Mutex<Vec<String>>>,
    ) -> Result<(String, u32, bool), MemoryError> {
        let provider = self
            .providers
            .default_provider()
            .map_err(AgentError::Provider)?;

        let system = if request.include_memory_context {
            let built: BuiltContext = self
                .context_builder
                .build(&request.query, &request.history, &ContextOptions::default())
                .await
                .map_err(AgentError::Context)?;
            tracing::debug!(
                chunks = built.metadata.chunks_used,
                "agent context grounded in memory"
            );
            built.system_with_context()
        } else {
            "You are a helpful assistant for an engineering team.".to_string()
        };

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::user(request.query.clone()));

        let chat_opts = ChatOptions {
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stop_sequences: Vec::new(),
            tools: self.registry.definitions(),
        };
        let tool_ctx = ToolContext {
            user_id: request.user_id.clone(),
            conversation_id: None,
        };

        for iteration in 1..=self.config.max_iterations {
            let response = provider
                .chat(&messages, &chat_opts)
                .await
                .map_err(AgentError::Provider)?;

            if !response.has_tool_calls() {
                steps.lock().push(AgentStep::Message {
                    at: Utc::now(),
                    text: response.content.clone(),
                });
                tracing::info!(iterations = iteration, "agent answered");
                return Ok((response.content, iteration, true));
            }

            if !response.content.is_empty() {
                steps.lock().push(AgentStep::Thinking {
                    at: Utc::now(),
                    text: response.content.clone(),
                });
            }

            messages.push(ChatMessage::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            // Every tool_use gets exactly one tool_result before the
            // next model call.
            for call in &response.tool_calls {
                {
                    let mut used = tools_used.lock();
                    if !used.contains(&call.name) {
                        used.push(call.name.clone());
                    }
                }

                let result = match self
                    .registry
                    .execute(&call.name, &call.input, &tool_ctx)
                    .await
                {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                        json!({ "success": false, "error": e.to_string() })
                    }
                };

                steps.lock().push(AgentStep::ToolUse {
                    at: Utc::now(),
                    tool: call.name.clone(),
                    input: call.input.clone(),
                    result: result.clone(),
                });
                messages.push(ChatMessage::tool_result(
                    &call.id,
                    &call.name,
                    result.to_string(),
                ));
            }
        }

        tracing::warn!(
            max_iterations = self.config.max_iterations,
            "agent hit iteration limit"
        );
        steps.lock().push(AgentStep::Message {
            at: Utc::now(),
            text: ITERATION_LIMIT_MESSAGE.to_string(),
        });
        Ok((
            ITERATION_LIMIT_MESSAGE.to_string(),
            self.config.max_iterations,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, RetrievalConfig};
    use crate::knowledge::{content_hash, KnowledgeStore, NewKnowledgeChunk, SqliteKnowledgeStore};
    use crate::providers::{
        ChatResponse, CompletionOptions, LlmProvider, MockProvider, ProviderOp,
    };
    use crate::retrieval::RetrievalService;
    use crate::tools::register_memory_tools;
    use crate::types::{EventId, ProviderError};

    const DIM: usize = 4;

    async fn service_with(chat_provider: MockProvider, agent_config: AgentConfig) -> AgentService {
        let store = Arc::new(SqliteKnowledgeStore::open_in_memory(DIM).unwrap());
        store
            .store(NewKnowledgeChunk {
                content: "@alice fixed the race condition in payment service".to_string(),
                content_hash: content_hash("@alice fixed the race condition in payment service"),
                source_type: "slack".to_string(),
                source_event_id: EventId::new(),
                metadata: json!({}),
                importance: 0.8,
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                embedding_model: "mock".to_string(),
            })
            .await
            .unwrap();

        let embedder = MockProvider::new(DIM)
            .with_embedding("Who fixed the race condition?", vec![1.0, 0.1, 0.0, 0.0])
            .with_embedding("race condition", vec![1.0, 0.05, 0.0, 0.0]);
        let retrieval = Arc::new(RetrievalService::new(
            store,
            Arc::new(embedder),
            None,
            RetrievalConfig::default(),
        ));

        let registry = Arc::new(crate::tools::ToolRegistry::new());
        register_memory_tools(&registry, retrieval.clone());

        let context_builder = Arc::new(ContextBuilder::new(retrieval, ContextConfig::default()));

        let providers = Arc::new(ProviderManager::new("mock"));
        providers.register(Arc::new(chat_provider));

        AgentService::new(providers, context_builder, registry, agent_config)
    }

    #[tokio::test]
    async fn tool_free_response_terminates_first_iteration() {
        let provider = MockProvider::new(DIM)
            .with_chat_responses(vec![MockProvider::text_response("All quiet.")]);
        let service = service_with(provider, AgentConfig::default()).await;

        let answer = service.query(AgentQuery::new("status?")).await.unwrap();
        assert!(answer.success);
        assert_eq!(answer.response, "All quiet.");
        assert_eq!(answer.iterations, 1);
        assert!(answer.tools_used.is_empty());
        assert!(matches!(answer.steps.as_slice(), [AgentStep::Message { .. }]));
    }

    #[tokio::test]
    async fn memory_tool_round_trip_reaches_answer() {
        // First turn requests search_memory; the echo mode then answers
        // with the tool result, proving the result flowed back.
        let provider = MockProvider::new(DIM)
            .with_chat_responses(vec![MockProvider::tool_call_response(
                "tc_1",
                "search_memory",
                json!({"query": "race condition"}),
            )])
            .echoing_tool_results();
        let service = service_with(provider, AgentConfig::default()).await;

        let answer = service
            .query(AgentQuery::new("Who fixed the race condition?"))
            .await
            .unwrap();

        assert!(answer.success);
        assert_eq!(answer.iterations, 2);
        assert_eq!(answer.tools_used, vec!["search_memory"]);
        assert!(
            answer.response.to_lowercase().contains("alice"),
            "answer should surface the remembered fix: {}",
            answer.response
        );

        // Transcript shape: tool use then the terminal message.
        assert!(matches!(
            answer.steps.as_slice(),
            [AgentStep::ToolUse { .. }, AgentStep::Message { .. }]
        ));
    }

    #[tokio::test]
    async fn failed_tool_calls_become_structured_errors() {
        let provider = MockProvider::new(DIM)
            .with_chat_responses(vec![MockProvider::tool_call_response(
                "tc_1",
                "no_such_tool",
                json!({}),
            )])
            .echoing_tool_results();
        let service = service_with(provider, AgentConfig::default()).await;

        let answer = service.query(AgentQuery::new("try a bad tool")).await.unwrap();
        assert!(answer.success, "loop recovers instead of aborting");

        let AgentStep::ToolUse { result, .. } = &answer.steps[0] else {
            panic!("expected a tool use step");
        };
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("no_such_tool"));
        // The error object was echoed back as the final answer.
        assert!(answer.response.contains("\"success\":false"));
    }

    #[tokio::test]
    async fn iteration_cap_yields_sentinel() {
        let call = || {
            MockProvider::tool_call_response(
                "tc",
                "search_memory",
                json!({"query": "race condition"}),
            )
        };
        let provider =
            MockProvider::new(DIM).with_chat_responses(vec![call(), call(), call(), call(), call()]);
        let config = AgentConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let service = service_with(provider, config).await;

        let answer = service.query(AgentQuery::new("loop forever")).await.unwrap();
        assert!(!answer.success);
        assert_eq!(answer.response, ITERATION_LIMIT_MESSAGE);
        assert_eq!(answer.iterations, 3);
        // Three tool uses plus the sentinel message.
        assert_eq!(answer.steps.len(), 4);
    }

    #[tokio::test]
    async fn deadline_returns_partial_with_failure() {
        struct SlowProvider;

        #[async_trait::async_trait]
        impl LlmProvider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            fn supports(&self, _op: ProviderOp) -> bool {
                true
            }
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _opts: &ChatOptions,
            ) -> Result<ChatResponse, ProviderError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                unreachable!()
            }
            async fn complete(
                &self,
                _prompt: &str,
                _opts: &CompletionOptions,
            ) -> Result<crate::providers::Completion, ProviderError> {
                unreachable!()
            }
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
                Ok(vec![1.0, 0.0, 0.0, 0.0])
            }
        }

        let store = Arc::new(SqliteKnowledgeStore::open_in_memory(DIM).unwrap());
        let retrieval = Arc::new(RetrievalService::new(
            store,
            Arc::new(MockProvider::new(DIM)),
            None,
            RetrievalConfig::default(),
        ));
        let registry = Arc::new(crate::tools::ToolRegistry::new());
        let context_builder = Arc::new(ContextBuilder::new(retrieval, ContextConfig::default()));
        let providers = Arc::new(ProviderManager::new("slow"));
        providers.register(Arc::new(SlowProvider));

        let service = AgentService::new(
            providers,
            context_builder,
            registry,
            AgentConfig {
                deadline: Duration::from_millis(100),
                ..Default::default()
            },
        );

        let answer = service.query(AgentQuery::new("too slow")).await.unwrap();
        assert!(!answer.success);
        assert!(answer.duration >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn provider_errors_surface_to_caller() {
        struct BrokenProvider;

        #[async_trait::async_trait]
        impl LlmProvider for BrokenProvider {
            fn name(&self) -> &str {
                "broken"
            }
            fn supports(&self, _op: ProviderOp) -> bool {
                true
            }
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _opts: &ChatOptions,
            ) -> Result<ChatResponse, ProviderError> {
                Err(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_secs(5)),
                })
            }
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
                Ok(vec![1.0, 0.0, 0.0, 0.0])
            }
        }

        let store = Arc::new(SqliteKnowledgeStore::open_in_memory(DIM).unwrap());
        let retrieval = Arc::new(RetrievalService::new(
            store,
            Arc::new(MockProvider::new(DIM)),
            None,
            RetrievalConfig::default(),
        ));
        let registry = Arc::new(crate::tools::ToolRegistry::new());
        let context_builder = Arc::new(ContextBuilder::new(retrieval, ContextConfig::default()));
        let providers = Arc::new(ProviderManager::new("broken"));
        providers.register(Arc::new(BrokenProvider));

        let service = AgentService::new(
            providers,
            context_builder,
            registry,
            AgentConfig::default(),
        );

        let err = service.query(AgentQuery::new("q")).await.unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::RateLimited);
    }
}
