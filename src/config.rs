//! Configuration management for the hivemind runtime
//!
//! Provides centralized configuration handling with TOML file loading,
//! environment variable overrides, validation, and secure defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub chunk: ChunkLifecycleConfig,
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

/// Database configuration
///
/// The event log, knowledge store, and queue share one SQLite file; the
/// connection-string fields of other back-ends collapse into a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Upper bound on concurrently open connections.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("hivemind").join("memory.db"),
            max_connections: 10,
        }
    }
}

/// Work queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker poll interval when a queue is empty.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Default worker concurrency per queue.
    pub concurrency: usize,
    /// Default maximum delivery attempts per job.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Cap on the retry backoff delay.
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
    /// Completed jobs older than this are swept.
    #[serde(with = "humantime_serde")]
    pub completed_retention: Duration,
    /// At most this many completed jobs are retained per queue.
    pub completed_max_count: u64,
    /// Failed jobs older than this are swept.
    #[serde(with = "humantime_serde")]
    pub failed_retention: Duration,
    /// Interval of the retention sweeper task.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            concurrency: 4,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(30),
            completed_retention: Duration::from_secs(24 * 3600),
            completed_max_count: 1000,
            failed_retention: Duration::from_secs(7 * 24 * 3600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Primary provider for chat and summarization: "anthropic",
    /// "openai", or "mock".
    pub default_provider: String,
    pub anthropic: ProviderEndpointConfig,
    pub openai: ProviderEndpointConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: "anthropic".to_string(),
            anthropic: ProviderEndpointConfig {
                model: "claude-sonnet-4-20250514".to_string(),
                base_url: "https://api.anthropic.com/v1".to_string(),
                api_key: None,
                timeout: Duration::from_secs(120),
            },
            openai: ProviderEndpointConfig {
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                timeout: Duration::from_secs(120),
            },
        }
    }
}

/// Per-provider endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    pub model: String,
    pub base_url: String,
    /// API key; resolved from the environment when absent.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Embedding back-end configuration; `dimensions` is global to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider: "openai" or "mock".
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 768,
            batch_size: 32,
        }
    }
}

/// Knowledge chunk lifecycle (tier demotion) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLifecycleConfig {
    /// Hot chunks older than this with low access are demoted to warm.
    #[serde(with = "humantime_serde")]
    pub hot_max_age: Duration,
    /// Warm chunks older than this with low access are demoted to cold.
    #[serde(with = "humantime_serde")]
    pub warm_max_age: Duration,
    /// "Low access" threshold: chunks with access_count below this are
    /// eligible for demotion.
    pub demote_below_access: u64,
    /// Interval of the lifecycle task.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ChunkLifecycleConfig {
    fn default() -> Self {
        Self {
            hot_max_age: Duration::from_secs(7 * 24 * 3600),
            warm_max_age: Duration::from_secs(30 * 24 * 3600),
            demote_below_access: 3,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Retrieval tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Minimum similarity for direct retrieval calls.
    pub min_similarity: f32,
    /// Minimum similarity when retrieving for agent context.
    pub agent_min_similarity: f32,
    /// Weight of vector similarity in the relevance score.
    pub similarity_weight: f32,
    /// Weight of chunk importance in the relevance score.
    pub importance_weight: f32,
    /// Whether to rerank the head of the result list with an LLM.
    pub rerank: bool,
    /// How many leading hits are submitted for reranking.
    pub rerank_window: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            min_similarity: 0.5,
            agent_min_similarity: 0.65,
            similarity_weight: 0.7,
            importance_weight: 0.3,
            rerank: false,
            rerank_window: 10,
        }
    }
}

/// Context builder budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub max_history: usize,
    /// Tokens reserved for chunk formatting overhead.
    pub format_reserve: usize,
    pub relevance_threshold: f32,
    /// Upper bound on candidate chunks fetched per build.
    pub max_candidates: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            max_history: 10,
            format_reserve: 500,
            relevance_threshold: 0.6,
            max_candidates: 30,
        }
    }
}

/// Agent loop limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Overall deadline for one agent query.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            temperature: 0.7,
            max_tokens: 2000,
            deadline: Duration::from_secs(120),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "hivemind=debug,info".
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// HTTP API configuration (feature `http-api`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("{}: {e}", path.display()),
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults plus environment overrides.
    ///
    /// Reads `.env` via dotenvy first, so local development works
    /// without exporting anything. Recognized variables:
    /// `HIVEMIND_DB_PATH`, `HIVEMIND_LOG_LEVEL`, `HIVEMIND_API_PORT`,
    /// `HIVEMIND_LLM_PROVIDER`, `HIVEMIND_EMBEDDING_PROVIDER`,
    /// `HIVEMIND_EMBEDDING_DIMENSIONS`, `ANTHROPIC_API_KEY`,
    /// `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Ok(path) = std::env::var("HIVEMIND_DB_PATH") {
            config.database.path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("HIVEMIND_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(port) = std::env::var("HIVEMIND_API_PORT") {
            config.api.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HIVEMIND_API_PORT".to_string(),
                reason: format!("not a port number: {port}"),
            })?;
        }
        if let Ok(provider) = std::env::var("HIVEMIND_LLM_PROVIDER") {
            config.llm.default_provider = provider;
        }
        if let Ok(provider) = std::env::var("HIVEMIND_EMBEDDING_PROVIDER") {
            config.embedding.provider = provider;
        }
        if let Ok(dims) = std::env::var("HIVEMIND_EMBEDDING_DIMENSIONS") {
            config.embedding.dimensions =
                dims.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "HIVEMIND_EMBEDDING_DIMENSIONS".to_string(),
                    reason: format!("not a dimension: {dims}"),
                })?;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.llm.anthropic.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm.openai.api_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "embedding.dimensions".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "embedding.batch_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let weight_sum = self.retrieval.similarity_weight + self.retrieval.importance_weight;
        if !(0.99..=1.01).contains(&weight_sum) {
            return Err(ConfigError::InvalidValue {
                key: "retrieval.similarity_weight".to_string(),
                reason: format!("weights must sum to 1.0, got {weight_sum}"),
            });
        }
        for (key, value) in [
            ("retrieval.min_similarity", self.retrieval.min_similarity),
            (
                "retrieval.agent_min_similarity",
                self.retrieval.agent_min_similarity,
            ),
            ("context.relevance_threshold", self.context.relevance_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("must be within [0, 1], got {value}"),
                });
            }
        }
        if self.context.max_tokens <= self.context.format_reserve {
            return Err(ConfigError::InvalidValue {
                key: "context.max_tokens".to_string(),
                reason: "must exceed context.format_reserve".to_string(),
            });
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.max_iterations".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
