//! hivemind: collective memory for engineering teams
//!
//! Source adapters feed raw events through persistent work queues into
//! an enrich → summarize → embed → store pipeline; a vector-indexed
//! knowledge store backs a retrieval service, a token-budgeted context
//! builder, and a tool-using agent loop over pluggable LLM providers.
//!
//! [`MemoryRuntime`] is the single composition root: it assembles the
//! component graph at startup and tears it down in reverse dependency
//! order. No component reaches for process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod adapters;
pub mod agent;
pub mod config;
pub mod context;
pub mod event_log;
pub mod ingest;
pub mod knowledge;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod retrieval;
pub mod tools;
pub mod types;

#[cfg(feature = "http-api")]
pub mod api;

// Re-export commonly used types
pub use agent::{AgentAnswer, AgentQuery, AgentService, AgentStep};
pub use config::Config;
pub use context::{BuiltContext, ContextBuilder, ContextOptions};
pub use event_log::{EventLog, NewRawEvent, RawEvent, SqliteEventLog};
pub use knowledge::{
    KnowledgeChunk, KnowledgeStats, KnowledgeStore, SearchOptions, SqliteKnowledgeStore,
};
pub use providers::{LlmProvider, MockProvider, ProviderManager};
pub use queue::{JobQueue, QueueCounts, SqliteJobQueue};
pub use retrieval::{RetrievalOptions, RetrievalResult, RetrievalService};
pub use tools::ToolRegistry;
pub use types::*;

use adapters::{AdapterHandle, AdapterState, AdapterSupervisor, ReconnectPolicy, SourceAdapter};
use ingest::{IngestionHandle, IngestionWorker};
use knowledge::{TierLifecycle, TierLifecycleHandle, TierPolicy};
use pipeline::PipelineProcessor;
use queue::{
    BackoffPolicy, QueueWorker, RetentionPolicy, WorkerHandle, WorkerOptions, QUEUE_PROCESSING,
};

/// Aggregated health snapshot for readiness probes and operators.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub queues: HashMap<String, QueueCounts>,
    pub knowledge: KnowledgeStats,
    pub adapters: Vec<(String, AdapterState)>,
}

struct RunningTasks {
    ingestion_tx: mpsc::Sender<NewRawEvent>,
    ingestion: IngestionHandle,
    workers: Vec<WorkerHandle>,
    lifecycle: TierLifecycleHandle,
    sweeper: SweeperHandle,
    adapters: Vec<(String, AdapterHandle)>,
}

/// The assembled memory system.
pub struct MemoryRuntime {
    config: Config,
    pub event_log: Arc<dyn EventLog>,
    pub queue: Arc<dyn JobQueue>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub providers: Arc<ProviderManager>,
    pub retrieval: Arc<RetrievalService>,
    pub context_builder: Arc<ContextBuilder>,
    pub tools: Arc<ToolRegistry>,
    pub agent: Arc<AgentService>,
    running: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl MemoryRuntime {
    /// Assemble the runtime, building providers from the configuration.
    pub fn new(config: Config) -> Result<Self, MemoryError> {
        let providers = build_providers(&config)?;
        Self::with_providers(config, providers)
    }

    /// Assemble the runtime around a prebuilt provider manager (used by
    /// tests and embedders with custom back-ends).
    pub fn with_providers(
        config: Config,
        providers: Arc<ProviderManager>,
    ) -> Result<Self, MemoryError> {
        config.validate().map_err(MemoryError::Config)?;

        let event_log: Arc<dyn EventLog> =
            Arc::new(SqliteEventLog::open(&config.database.path)?);
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::open(
            &config.database.path,
            config.queue.max_attempts,
        )?);
        let knowledge: Arc<dyn KnowledgeStore> = Arc::new(SqliteKnowledgeStore::open(
            &config.database.path,
            config.embedding.dimensions,
        )?);

        let embedder = providers.embedder().map_err(MemoryError::Provider)?;
        let reranker = if config.retrieval.rerank {
            providers.default_provider().ok()
        } else {
            None
        };
        let retrieval = Arc::new(RetrievalService::new(
            knowledge.clone(),
            embedder,
            reranker,
            config.retrieval.clone(),
        ));

        let context_builder = Arc::new(ContextBuilder::new(
            retrieval.clone(),
            config.context.clone(),
        ));

        let tools = Arc::new(ToolRegistry::new());
        tools::register_memory_tools(&tools, retrieval.clone());

        let agent = Arc::new(AgentService::new(
            providers.clone(),
            context_builder.clone(),
            tools.clone(),
            config.agent.clone(),
        ));

        Ok(Self {
            config,
            event_log,
            queue,
            knowledge,
            providers,
            retrieval,
            context_builder,
            tools,
            agent,
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Start the background machinery: pipeline workers, the ingestion
    /// worker, the tier lifecycle task, and the queue retention
    /// sweeper. Pending events from a previous run are re-enqueued.
    pub async fn start(&self) -> Result<(), MemoryError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let summarizer = self
            .providers
            .default_provider()
            .map_err(MemoryError::Provider)?;
        let embedder = self.providers.embedder().map_err(MemoryError::Provider)?;

        let processor = Arc::new(PipelineProcessor::new(
            self.event_log.clone(),
            self.knowledge.clone(),
            summarizer,
            embedder,
            self.config.embedding.model.clone(),
        ));

        let ingestion_worker = IngestionWorker::new(self.event_log.clone(), self.queue.clone());
        let recovered = ingestion_worker.recover_pending(1000).await?;
        if recovered > 0 {
            tracing::info!(recovered, "pending events recovered into the processing queue");
        }

        let (ingestion_tx, ingestion_rx) = mpsc::channel(256);
        let ingestion = ingestion_worker.spawn(ingestion_rx);

        let worker = QueueWorker::new(
            self.queue.clone(),
            QUEUE_PROCESSING,
            processor,
            BackoffPolicy::from_config(&self.config.queue),
            WorkerOptions {
                concurrency: self.config.queue.concurrency,
                poll_interval: self.config.queue.poll_interval,
                rate_limit: None,
            },
        );
        let workers = vec![worker.spawn()];

        let lifecycle = TierLifecycle::new(
            self.knowledge.clone(),
            TierPolicy::from(&self.config.chunk),
            self.config.chunk.sweep_interval,
        )
        .spawn();

        let sweeper = spawn_queue_sweeper(
            self.queue.clone(),
            RetentionPolicy::from_config(&self.config.queue),
            self.config.queue.sweep_interval,
        );

        *running = Some(RunningTasks {
            ingestion_tx,
            ingestion,
            workers,
            lifecycle,
            sweeper,
            adapters: Vec::new(),
        });
        tracing::info!("memory runtime started");
        Ok(())
    }

    /// Feed one event draft into the ingestion channel.
    pub async fn ingest(&self, event: NewRawEvent) -> Result<(), MemoryError> {
        // Clone the sender out of the lock; a full channel must not
        // block shutdown.
        let tx = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .ok_or_else(|| MemoryError::Internal("runtime not started".to_string()))?
                .ingestion_tx
                .clone()
        };
        tx.send(event)
            .await
            .map_err(|_| MemoryError::Queue(QueueError::ShuttingDown))
    }

    /// Attach a source adapter; its events flow into ingestion.
    pub async fn attach_adapter(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        self_identity: Option<String>,
    ) -> Result<(), MemoryError> {
        let mut running = self.running.lock().await;
        let tasks = running
            .as_mut()
            .ok_or_else(|| MemoryError::Internal("runtime not started".to_string()))?;

        let source = adapter.source().to_string();
        let supervisor = AdapterSupervisor::new(
            adapter,
            tasks.ingestion_tx.clone(),
            self_identity,
            ReconnectPolicy::default(),
        );
        tasks.adapters.push((source, supervisor.spawn()));
        Ok(())
    }

    /// Aggregated health for readiness probes.
    pub async fn health(&self) -> Result<RuntimeHealth, MemoryError> {
        let mut queues = HashMap::new();
        for name in [
            queue::QUEUE_INGESTION,
            queue::QUEUE_PROCESSING,
            queue::QUEUE_EMBEDDING,
            queue::QUEUE_AGENT_TASKS,
        ] {
            queues.insert(name.to_string(), self.queue.counts(name).await?);
        }
        let knowledge = self.knowledge.stats().await?;

        let running = self.running.lock().await;
        let adapters = running
            .as_ref()
            .map(|tasks| {
                tasks
                    .adapters
                    .iter()
                    .map(|(source, handle)| (source.clone(), handle.state()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(RuntimeHealth {
            queues,
            knowledge,
            adapters,
        })
    }

    /// Stop everything in reverse dependency order: adapters first (no
    /// new events), then ingestion drains, then the workers, then the
    /// background sweeps.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.running.lock().await.take() else {
            return;
        };
        tracing::info!("memory runtime shutting down");

        for (source, handle) in tasks.adapters {
            tracing::debug!(source = %source, "stopping adapter");
            handle.shutdown().await;
        }

        drop(tasks.ingestion_tx);
        tasks.ingestion.join().await;

        for worker in tasks.workers {
            worker.shutdown().await;
        }
        tasks.lifecycle.shutdown().await;
        tasks.sweeper.shutdown().await;
        tracing::info!("memory runtime stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Build the provider manager from configuration. Cloud providers are
/// registered when their keys are present; the deterministic mock fills
/// in whenever chat or embedding would otherwise be unavailable.
fn build_providers(config: &Config) -> Result<Arc<ProviderManager>, MemoryError> {
    let manager = ProviderManager::new(&config.llm.default_provider);

    if config.llm.anthropic.api_key.is_some() {
        match providers::AnthropicProvider::new(&config.llm.anthropic) {
            Ok(provider) => manager.register(Arc::new(provider)),
            Err(e) => tracing::warn!(error = %e, "anthropic provider unavailable"),
        }
    }
    if config.llm.openai.api_key.is_some() {
        let embedding = (config.embedding.provider == "openai").then(|| {
            providers::OpenAiEmbeddingSettings {
                model: config.embedding.model.clone(),
                dimensions: config.embedding.dimensions,
            }
        });
        match providers::OpenAiProvider::new(&config.llm.openai, embedding) {
            Ok(provider) => manager.register(Arc::new(provider)),
            Err(e) => tracing::warn!(error = %e, "openai provider unavailable"),
        }
    }

    if manager.default_provider().is_err() || manager.embedder().is_err() {
        tracing::warn!(
            "no configured provider covers chat and embedding; registering the mock provider"
        );
        manager.register(Arc::new(MockProvider::new(config.embedding.dimensions)));
    }

    Ok(Arc::new(manager))
}

struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

fn spawn_queue_sweeper(
    queue: Arc<dyn JobQueue>,
    policy: RetentionPolicy,
    interval: Duration,
) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            match queue.sweep(policy, chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "queue retention sweep"),
                Err(e) => tracing::warn!(error = %e, "queue retention sweep failed"),
            }
        }
    });
    SweeperHandle { shutdown_tx, task }
}
