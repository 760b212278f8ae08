//! Error types for the memory runtime
//!
//! Each subsystem defines its own `thiserror` enum; `MemoryError` fans
//! them in for callers that cross subsystem boundaries (the pipeline,
//! the agent service, the API layer). `ErrorKind` classifies any error
//! into the small set of kinds the queue and the HTTP layer act on.

use std::time::Duration;
use thiserror::Error;

use super::{ChunkId, EventId, JobId};

/// Classification of an error for retry and HTTP-mapping decisions.
///
/// Kinds, not source types: a provider timeout and a database timeout
/// are both `Timeout`; the queue retries `Transient`, `Upstream`,
/// `RateLimited`, and `Timeout`, while the API maps `Validation` and
/// `NotFound` to client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Duplicate,
    NotFound,
    Validation,
    Upstream,
    RateLimited,
    Unauthenticated,
    Unsupported,
    Timeout,
    Transient,
    Fatal,
}

impl ErrorKind {
    /// Whether the queue should retry a job that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Upstream | ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::Transient
        )
    }
}

/// Top-level error for the memory runtime
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Knowledge store error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Classify this error into an [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Config(_) => ErrorKind::Validation,
            MemoryError::EventLog(e) => e.kind(),
            MemoryError::Queue(e) => e.kind(),
            MemoryError::Adapter(e) => e.kind(),
            MemoryError::Knowledge(e) => e.kind(),
            MemoryError::Provider(e) => e.kind(),
            MemoryError::Retrieval(e) => e.kind(),
            MemoryError::Context(e) => e.kind(),
            MemoryError::Tool(e) => e.kind(),
            MemoryError::Agent(e) => e.kind(),
            MemoryError::Internal(_) => ErrorKind::Fatal,
        }
    }
}

/// Event log store errors
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("Duplicate event for (source, external_id); existing event {existing}")]
    Duplicate { existing: EventId },

    #[error("Event not found: {0}")]
    NotFound(EventId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EventLogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EventLogError::Duplicate { .. } => ErrorKind::Duplicate,
            EventLogError::NotFound(_) => ErrorKind::NotFound,
            EventLogError::Storage(_) => ErrorKind::Transient,
            EventLogError::Serialization(_) => ErrorKind::Fatal,
        }
    }
}

/// Work queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Queue worker is shutting down")]
    ShuttingDown,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::Storage(_) => ErrorKind::Transient,
            QueueError::Serialization(_) => ErrorKind::Fatal,
            QueueError::ShuttingDown => ErrorKind::Transient,
        }
    }
}

/// Source adapter errors
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Source error: {0}")]
    Source(String),

    #[error("Adapter is shutting down")]
    ShuttingDown,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::ConnectionFailed(_) => ErrorKind::Upstream,
            AdapterError::NotConnected => ErrorKind::Transient,
            AdapterError::Source(_) => ErrorKind::Upstream,
            AdapterError::ShuttingDown => ErrorKind::Transient,
        }
    }
}

/// Knowledge store errors
#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("Chunk not found: {0}")]
    NotFound(ChunkId),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl KnowledgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KnowledgeError::NotFound(_) => ErrorKind::NotFound,
            KnowledgeError::DimensionMismatch { .. } => ErrorKind::Validation,
            KnowledgeError::Storage(_) => ErrorKind::Transient,
            KnowledgeError::Serialization(_) => ErrorKind::Fatal,
        }
    }
}

/// LLM provider errors, normalized across back-ends
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Rate limited{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed for provider {provider}")]
    Unauthenticated { provider: String },

    #[error("Provider {provider} does not support {operation}")]
    Unsupported { provider: String, operation: String },

    #[error("Upstream provider error: {message}")]
    Upstream { message: String },

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("No provider available{}", preferred.as_ref().map(|p| format!(" (preferred: {p})")).unwrap_or_default())]
    NoProviderAvailable { preferred: Option<String> },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            ProviderError::Unsupported { .. } => ErrorKind::Unsupported,
            ProviderError::Upstream { .. } => ErrorKind::Upstream,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::InvalidResponse(_) => ErrorKind::Upstream,
            ProviderError::NoProviderAvailable { .. } => ErrorKind::Fatal,
        }
    }
}

/// Retrieval service errors
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Query embedding failed: {0}")]
    Embedding(#[source] ProviderError),

    #[error("Search failed: {0}")]
    Search(#[from] KnowledgeError),
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::Embedding(e) => e.kind(),
            RetrievalError::Search(e) => e.kind(),
        }
    }
}

/// Context builder errors
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Retrieval failed while building context: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Invalid context options: {0}")]
    InvalidOptions(String),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::Retrieval(e) => e.kind(),
            ContextError::InvalidOptions(_) => ErrorKind::Validation,
        }
    }
}

/// Tool registry and execution errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters for tool {tool}: {reason}")]
    InvalidParameters { tool: String, reason: String },

    #[error("Tool {tool} failed: {message}")]
    ExecutionFailed { tool: String, message: String },
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool(_) => ErrorKind::NotFound,
            ToolError::InvalidParameters { .. } => ErrorKind::Validation,
            ToolError::ExecutionFailed { .. } => ErrorKind::Upstream,
        }
    }
}

/// Agent loop errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Provider error in agent loop: {0}")]
    Provider(#[from] ProviderError),

    #[error("Context assembly failed: {0}")]
    Context(#[from] ContextError),

    #[error("Agent deadline of {0:?} exhausted")]
    DeadlineExhausted(Duration),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Provider(e) => e.kind(),
            AgentError::Context(e) => e.kind(),
            AgentError::DeadlineExhausted(_) => ErrorKind::Timeout,
        }
    }
}

/// Result alias used across the runtime
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_duplicate_kind() {
        let err = MemoryError::EventLog(EventLogError::Duplicate {
            existing: EventId::new(),
        });
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn provider_errors_classify() {
        let rate = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        };
        assert_eq!(rate.kind(), ErrorKind::RateLimited);
        assert!(rate.kind().is_retryable());

        let unsupported = ProviderError::Unsupported {
            provider: "mock".into(),
            operation: "embed".into(),
        };
        assert_eq!(unsupported.kind(), ErrorKind::Unsupported);
        assert!(!unsupported.kind().is_retryable());
    }

    #[test]
    fn transient_storage_is_retryable() {
        let err = MemoryError::Knowledge(KnowledgeError::Storage("disk full".into()));
        assert!(err.kind().is_retryable());
    }
}
