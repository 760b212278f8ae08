//! Vector-indexed knowledge store
//!
//! Owns the `knowledge_chunks` table: summarized, embedded units of
//! memory deduplicated by content hash, searchable by cosine
//! similarity, and aged through hot/warm/cold tiers by a background
//! lifecycle task. Chunks are never deleted in the hot path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::config::ChunkLifecycleConfig;
use crate::types::{ChunkId, EventId, KnowledgeError, Tier};

mod ivf;
mod lifecycle;
mod store;

pub use ivf::IvfIndex;
pub use lifecycle::{TierLifecycle, TierLifecycleHandle};
pub use store::SqliteKnowledgeStore;

/// SHA-256 of chunk content, lowercase hex. The store's dedup key.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// The atomic unit of searchable memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: ChunkId,
    pub content: String,
    pub content_hash: String,
    pub source_type: String,
    /// The raw event this chunk was derived from.
    pub source_event_id: EventId,
    pub metadata: Value,
    /// Heuristic salience in [0, 1].
    pub importance: f32,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
    pub tier: Tier,
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk about to be stored (no id or lifecycle fields yet).
#[derive(Debug, Clone)]
pub struct NewKnowledgeChunk {
    pub content: String,
    pub content_hash: String,
    pub source_type: String,
    pub source_event_id: EventId,
    pub metadata: Value,
    pub importance: f32,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
}

/// Result of a store call: either a fresh insert or the id of the
/// chunk that already carried this content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted(ChunkId),
    Existing(ChunkId),
}

impl StoreOutcome {
    pub fn id(&self) -> ChunkId {
        match self {
            StoreOutcome::Inserted(id) | StoreOutcome::Existing(id) => *id,
        }
    }

    pub fn was_deduplicated(&self) -> bool {
        matches!(self, StoreOutcome::Existing(_))
    }
}

/// Filters for a similarity search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Restrict to these source types; `None` means all.
    pub source_types: Option<Vec<String>>,
    /// Tiers searched; cold is opt-in.
    pub tiers: Vec<Tier>,
    pub min_similarity: f32,
    pub top_k: usize,
    /// Chunk excluded from results (anchor of a find-similar call).
    pub exclude_chunk: Option<ChunkId>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            source_types: None,
            tiers: vec![Tier::Hot, Tier::Warm],
            min_similarity: 0.7,
            top_k: 20,
            exclude_chunk: None,
        }
    }
}

/// A search result with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: KnowledgeChunk,
    pub similarity: f32,
}

/// Store-wide statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub total: u64,
    pub by_tier: HashMap<String, u64>,
    pub by_source: HashMap<String, u64>,
}

/// Concrete thresholds for tier demotion.
#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub hot_max_age: std::time::Duration,
    pub warm_max_age: std::time::Duration,
    /// Chunks with access_count below this are eligible for demotion.
    pub demote_below_access: u64,
}

impl From<&ChunkLifecycleConfig> for TierPolicy {
    fn from(config: &ChunkLifecycleConfig) -> Self {
        Self {
            hot_max_age: config.hot_max_age,
            warm_max_age: config.warm_max_age,
            demote_below_access: config.demote_below_access,
        }
    }
}

/// Counts of demotions performed by one lifecycle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierDemotions {
    pub hot_to_warm: u64,
    pub warm_to_cold: u64,
}

/// Abstract knowledge store.
#[async_trait::async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert a chunk with tier `hot` and zero access count.
    /// Idempotent on `content_hash`: an existing chunk is returned
    /// unmutated.
    async fn store(&self, chunk: NewKnowledgeChunk) -> Result<StoreOutcome, KnowledgeError>;

    /// Cosine similarity search, strictly descending; ties broken by
    /// newer `created_at`, then lexicographic id. Access stats for the
    /// returned ids are bumped in a single batched update.
    async fn search(
        &self,
        query: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, KnowledgeError>;

    async fn get_by_id(&self, id: ChunkId) -> Result<Option<KnowledgeChunk>, KnowledgeError>;

    /// Recent chunks, optionally restricted to one source type.
    async fn get_by_source(
        &self,
        source_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, KnowledgeError>;

    async fn stats(&self) -> Result<KnowledgeStats, KnowledgeError>;

    /// Demote aged, rarely accessed chunks one tier. Warm→cold runs
    /// before hot→warm so one sweep never demotes a chunk twice.
    async fn demote_tiers(
        &self,
        policy: TierPolicy,
        now: DateTime<Utc>,
    ) -> Result<TierDemotions, KnowledgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_hex() {
        let a = content_hash("We need JWT for the API");
        let b = content_hash("We need JWT for the API");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(a, content_hash("We need JWT for the API "));
    }

    #[test]
    fn default_search_excludes_cold() {
        let opts = SearchOptions::default();
        assert!(opts.tiers.contains(&Tier::Hot));
        assert!(opts.tiers.contains(&Tier::Warm));
        assert!(!opts.tiers.contains(&Tier::Cold));
        assert_eq!(opts.top_k, 20);
    }
}
