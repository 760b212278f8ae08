//! SQLite-backed knowledge store with an in-process IVF index.
//!
//! Rows are the durable truth; the index is rebuilt from the embedding
//! column on open and updated incrementally on insert. Embeddings are
//! stored as little-endian f32 blobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    IvfIndex, KnowledgeChunk, KnowledgeStats, KnowledgeStore, NewKnowledgeChunk, SearchHit,
    SearchOptions, StoreOutcome, TierDemotions, TierPolicy,
};
use crate::types::{ChunkId, KnowledgeError, Tier};

pub struct SqliteKnowledgeStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
    index: RwLock<IvfIndex>,
    dimensions: usize,
}

impl SqliteKnowledgeStore {
    /// Open (or create) the store at the given path and rebuild the
    /// vector index from the persisted embeddings.
    pub fn open(path: &std::path::Path, dimensions: usize) -> Result<Self, KnowledgeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KnowledgeError::Storage(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        Self::init_schema(&conn)?;
        let index = Self::load_index(&conn, dimensions)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            index: RwLock::new(index),
            dimensions,
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory(dimensions: usize) -> Result<Self, KnowledgeError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            index: RwLock::new(IvfIndex::new(dimensions)),
            dimensions,
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), KnowledgeError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS knowledge_chunks (
                chunk_id         TEXT PRIMARY KEY,
                content          TEXT NOT NULL,
                content_hash     TEXT NOT NULL UNIQUE,
                source_type      TEXT NOT NULL,
                source_event_id  TEXT NOT NULL,
                metadata         TEXT NOT NULL,
                importance       REAL NOT NULL DEFAULT 0.5,
                embedding        BLOB NOT NULL,
                embedding_model  TEXT NOT NULL,
                tier             TEXT NOT NULL DEFAULT 'hot',
                access_count     INTEGER NOT NULL DEFAULT 0,
                last_accessed_at TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_tier ON knowledge_chunks(tier);
            CREATE INDEX IF NOT EXISTS idx_chunks_source ON knowledge_chunks(source_type);
            CREATE INDEX IF NOT EXISTS idx_chunks_created ON knowledge_chunks(created_at DESC);",
        )
        .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        Ok(())
    }

    fn load_index(
        conn: &rusqlite::Connection,
        dimensions: usize,
    ) -> Result<IvfIndex, KnowledgeError> {
        let mut index = IvfIndex::new(dimensions);
        let mut stmt = conn
            .prepare("SELECT chunk_id, embedding FROM knowledge_chunks")
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        let mut skipped = 0usize;
        for row in rows {
            let (id_str, blob) = row.map_err(|e| KnowledgeError::Storage(e.to_string()))?;
            let id: ChunkId = id_str
                .parse()
                .map_err(|e: uuid::Error| KnowledgeError::Serialization(e.to_string()))?;
            let vector = blob_to_embedding(&blob);
            if vector.len() == dimensions {
                index.insert(id, &vector);
            } else {
                // Chunks embedded under a previous model stay stored but
                // out of the index until the operator migrates them.
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, "chunks with foreign embedding dimension left unindexed");
        }
        tracing::info!(indexed = index.len(), "vector index rebuilt");
        Ok(index)
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn store(&self, chunk: NewKnowledgeChunk) -> Result<StoreOutcome, KnowledgeError> {
        if chunk.embedding.len() != self.dimensions {
            return Err(KnowledgeError::DimensionMismatch {
                expected: self.dimensions,
                actual: chunk.embedding.len(),
            });
        }

        let conn = self.conn.lock().await;

        let existing: Option<String> = {
            let mut stmt = conn
                .prepare("SELECT chunk_id FROM knowledge_chunks WHERE content_hash = ?1")
                .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
            match stmt.query_row(rusqlite::params![chunk.content_hash], |row| row.get(0)) {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(KnowledgeError::Storage(e.to_string())),
            }
        };
        if let Some(id_str) = existing {
            let id = id_str
                .parse()
                .map_err(|e: uuid::Error| KnowledgeError::Serialization(e.to_string()))?;
            return Ok(StoreOutcome::Existing(id));
        }

        let id = ChunkId::new();
        let now = Utc::now();
        let metadata = serde_json::to_string(&chunk.metadata)
            .map_err(|e| KnowledgeError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO knowledge_chunks
                (chunk_id, content, content_hash, source_type, source_event_id,
                 metadata, importance, embedding, embedding_model, tier,
                 access_count, last_accessed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'hot', 0, NULL, ?10, ?10)",
            rusqlite::params![
                id.to_string(),
                chunk.content,
                chunk.content_hash,
                chunk.source_type,
                chunk.source_event_id.to_string(),
                metadata,
                chunk.importance.clamp(0.0, 1.0) as f64,
                embedding_to_blob(&chunk.embedding),
                chunk.embedding_model,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        self.index.write().insert(id, &chunk.embedding);
        tracing::debug!(chunk_id = %id, source = %chunk.source_type, "stored knowledge chunk");
        Ok(StoreOutcome::Inserted(id))
    }

    async fn search(
        &self,
        query: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, KnowledgeError> {
        if query.len() != self.dimensions {
            return Err(KnowledgeError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }

        // Over-fetch from the index so metadata filters rarely starve
        // the final top_k.
        let candidate_limit = (opts.top_k * 8).max(256);
        let candidates = self.index.read().search(query, candidate_limit);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;
        let placeholders: Vec<String> =
            (1..=candidates.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT chunk_id, content, content_hash, source_type, source_event_id,
                    metadata, importance, embedding, embedding_model, tier,
                    access_count, last_accessed_at, created_at, updated_at
             FROM knowledge_chunks WHERE chunk_id IN ({})",
            placeholders.join(", ")
        );
        let params: Vec<String> = candidates.iter().map(|(id, _)| id.to_string()).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_chunk)
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        let mut by_id = std::collections::HashMap::new();
        for row_result in rows {
            let chunk = row_result.map_err(|e| KnowledgeError::Storage(e.to_string()))??;
            by_id.insert(chunk.id, chunk);
        }

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|(id, similarity)| by_id.remove(&id).map(|chunk| SearchHit { chunk, similarity }))
            .filter(|hit| {
                if hit.similarity < opts.min_similarity {
                    return false;
                }
                if Some(hit.chunk.id) == opts.exclude_chunk {
                    return false;
                }
                if !opts.tiers.contains(&hit.chunk.tier) {
                    return false;
                }
                if let Some(ref sources) = opts.source_types {
                    if !sources.iter().any(|s| s == &hit.chunk.source_type) {
                        return false;
                    }
                }
                true
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
                .then_with(|| a.chunk.id.to_string().cmp(&b.chunk.id.to_string()))
        });
        hits.truncate(opts.top_k);

        if !hits.is_empty() {
            // One batched statement bounds write amplification.
            let now = Utc::now();
            let placeholders: Vec<String> =
                (2..=hits.len() + 1).map(|i| format!("?{i}")).collect();
            let update_sql = format!(
                "UPDATE knowledge_chunks
                 SET access_count = access_count + 1, last_accessed_at = ?1
                 WHERE chunk_id IN ({})",
                placeholders.join(", ")
            );
            let mut update_params: Vec<String> = vec![now.to_rfc3339()];
            update_params.extend(hits.iter().map(|h| h.chunk.id.to_string()));
            conn.execute(&update_sql, rusqlite::params_from_iter(update_params.iter()))
                .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

            for hit in &mut hits {
                hit.chunk.access_count += 1;
                hit.chunk.last_accessed_at = Some(now);
            }
        }

        Ok(hits)
    }

    async fn get_by_id(&self, id: ChunkId) -> Result<Option<KnowledgeChunk>, KnowledgeError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, content, content_hash, source_type, source_event_id,
                        metadata, importance, embedding, embedding_model, tier,
                        access_count, last_accessed_at, created_at, updated_at
                 FROM knowledge_chunks WHERE chunk_id = ?1",
            )
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        match stmt.query_row(rusqlite::params![id.to_string()], row_to_chunk) {
            Ok(inner) => Ok(Some(inner?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(KnowledgeError::Storage(e.to_string())),
        }
    }

    async fn get_by_source(
        &self,
        source_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, KnowledgeError> {
        let conn = self.conn.lock().await;
        let (sql, params): (String, Vec<String>) = match source_type {
            Some(source) => (
                "SELECT chunk_id, content, content_hash, source_type, source_event_id,
                        metadata, importance, embedding, embedding_model, tier,
                        access_count, last_accessed_at, created_at, updated_at
                 FROM knowledge_chunks WHERE source_type = ?1
                 ORDER BY created_at DESC LIMIT ?2"
                    .to_string(),
                vec![source.to_string(), limit.to_string()],
            ),
            None => (
                "SELECT chunk_id, content, content_hash, source_type, source_event_id,
                        metadata, importance, embedding, embedding_model, tier,
                        access_count, last_accessed_at, created_at, updated_at
                 FROM knowledge_chunks
                 ORDER BY created_at DESC LIMIT ?1"
                    .to_string(),
                vec![limit.to_string()],
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_chunk)
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        let mut chunks = Vec::new();
        for row_result in rows {
            chunks.push(row_result.map_err(|e| KnowledgeError::Storage(e.to_string()))??);
        }
        Ok(chunks)
    }

    async fn stats(&self) -> Result<KnowledgeStats, KnowledgeError> {
        let conn = self.conn.lock().await;
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM knowledge_chunks", [], |row| row.get(0))
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;

        let mut stats = KnowledgeStats {
            total: total as u64,
            ..Default::default()
        };

        let mut stmt = conn
            .prepare("SELECT tier, COUNT(*) FROM knowledge_chunks GROUP BY tier")
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        for row in rows {
            let (tier, count) = row.map_err(|e| KnowledgeError::Storage(e.to_string()))?;
            stats.by_tier.insert(tier, count as u64);
        }

        let mut stmt = conn
            .prepare("SELECT source_type, COUNT(*) FROM knowledge_chunks GROUP BY source_type")
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| KnowledgeError::Storage(e.to_string()))?;
        for row in rows {
            let (source, count) = row.map_err(|e| KnowledgeError::Storage(e.to_string()))?;
            stats.by_source.insert(source, count as u64);
        }

        Ok(stats)
    }

    async fn demote_tiers(
        &self,
        policy: TierPolicy,
        now: DateTime<Utc>,
    ) -> Result<TierDemotions, KnowledgeError> {
        let hot_cutoff =
            now - chrono::Duration::from_std(policy.hot_max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let warm_cutoff =
            now - chrono::Duration::from_std(policy.warm_max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let now_str = now.to_rfc3339();

        let conn = self.conn.lock().await;

        // Warm→cold first so a chunk demoted from hot in this sweep is
        // not immediately demoted again.
        let warm_to_cold = conn
            .execute(
                "UPDATE knowledge_chunks
                 SET tier = 'cold', updated_at = ?1
                 WHERE tier = 'warm' AND created_at < ?2 AND access_count < ?3",
                rusqlite::params![
                    now_str,
                    warm_cutoff.to_rfc3339(),
                    policy.demote_below_access as i64
                ],
            )
            .map_err(|e| KnowledgeError::Storage(e.to_string()))? as u64;

        let hot_to_warm = conn
            .execute(
                "UPDATE knowledge_chunks
                 SET tier = 'warm', updated_at = ?1
                 WHERE tier = 'hot' AND created_at < ?2 AND access_count < ?3",
                rusqlite::params![
                    now_str,
                    hot_cutoff.to_rfc3339(),
                    policy.demote_below_access as i64
                ],
            )
            .map_err(|e| KnowledgeError::Storage(e.to_string()))? as u64;

        if hot_to_warm + warm_to_cold > 0 {
            tracing::info!(hot_to_warm, warm_to_cold, "tier lifecycle demotions applied");
        }
        Ok(TierDemotions {
            hot_to_warm,
            warm_to_cold,
        })
    }
}

fn row_to_chunk(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<KnowledgeChunk, KnowledgeError>> {
    let id_str: String = row.get(0)?;
    let content: String = row.get(1)?;
    let content_hash: String = row.get(2)?;
    let source_type: String = row.get(3)?;
    let source_event_str: String = row.get(4)?;
    let metadata_str: String = row.get(5)?;
    let importance: f64 = row.get(6)?;
    let embedding_blob: Vec<u8> = row.get(7)?;
    let embedding_model: String = row.get(8)?;
    let tier_str: String = row.get(9)?;
    let access_count: i64 = row.get(10)?;
    let last_accessed_str: Option<String> = row.get(11)?;
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;

    Ok((|| -> Result<KnowledgeChunk, KnowledgeError> {
        let id: ChunkId = id_str
            .parse()
            .map_err(|e: uuid::Error| KnowledgeError::Serialization(e.to_string()))?;
        let source_event_id = source_event_str
            .parse()
            .map_err(|e: uuid::Error| KnowledgeError::Serialization(e.to_string()))?;
        let metadata = serde_json::from_str(&metadata_str)
            .map_err(|e| KnowledgeError::Serialization(e.to_string()))?;
        let tier: Tier = tier_str.parse().map_err(KnowledgeError::Serialization)?;
        let parse_time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| KnowledgeError::Serialization(e.to_string()))
        };
        let last_accessed_at = last_accessed_str.as_deref().map(parse_time).transpose()?;

        Ok(KnowledgeChunk {
            id,
            content,
            content_hash,
            source_type,
            source_event_id,
            metadata,
            importance: importance as f32,
            embedding: blob_to_embedding(&embedding_blob),
            embedding_model,
            tier,
            access_count: access_count as u64,
            last_accessed_at,
            created_at: parse_time(&created_str)?,
            updated_at: parse_time(&updated_str)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::content_hash;
    use crate::types::EventId;
    use serde_json::json;

    fn chunk_with(content: &str, embedding: Vec<f32>) -> NewKnowledgeChunk {
        NewKnowledgeChunk {
            content: content.to_string(),
            content_hash: content_hash(content),
            source_type: "slack".to_string(),
            source_event_id: EventId::new(),
            metadata: json!({}),
            importance: 0.5,
            embedding,
            embedding_model: "mock".to_string(),
        }
    }

    fn axis(dim: usize, index: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[index] = 1.0;
        v
    }

    #[tokio::test]
    async fn store_and_get() {
        let store = SqliteKnowledgeStore::open_in_memory(4).unwrap();
        let outcome = store
            .store(chunk_with("JWT chosen for auth", axis(4, 0)))
            .await
            .unwrap();
        assert!(!outcome.was_deduplicated());

        let chunk = store.get_by_id(outcome.id()).await.unwrap().unwrap();
        assert_eq!(chunk.content, "JWT chosen for auth");
        assert_eq!(chunk.tier, Tier::Hot);
        assert_eq!(chunk.access_count, 0);
        assert_eq!(chunk.embedding, axis(4, 0));
    }

    #[tokio::test]
    async fn content_hash_dedup_returns_existing() {
        let store = SqliteKnowledgeStore::open_in_memory(4).unwrap();
        let first = store
            .store(chunk_with("duplicate content", axis(4, 0)))
            .await
            .unwrap();
        let second = store
            .store(chunk_with("duplicate content", axis(4, 1)))
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert!(second.was_deduplicated());
        assert_eq!(store.stats().await.unwrap().total, 1);

        // The original row is unmutated.
        let chunk = store.get_by_id(first.id()).await.unwrap().unwrap();
        assert_eq!(chunk.embedding, axis(4, 0));
    }

    #[tokio::test]
    async fn rejects_wrong_dimension() {
        let store = SqliteKnowledgeStore::open_in_memory(4).unwrap();
        let err = store
            .store(chunk_with("short vector", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KnowledgeError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn importance_is_clamped() {
        let store = SqliteKnowledgeStore::open_in_memory(4).unwrap();
        let mut chunk = chunk_with("overweighted", axis(4, 0));
        chunk.importance = 3.5;
        let id = store.store(chunk).await.unwrap().id();
        let stored = store.get_by_id(id).await.unwrap().unwrap();
        assert!((stored.importance - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn search_orders_and_filters() {
        let store = SqliteKnowledgeStore::open_in_memory(3).unwrap();
        let near = store
            .store(chunk_with("near", vec![1.0, 0.05, 0.0]))
            .await
            .unwrap()
            .id();
        let mid = store
            .store(chunk_with("mid", vec![1.0, 0.5, 0.0]))
            .await
            .unwrap()
            .id();
        store
            .store(chunk_with("orthogonal", vec![0.0, 0.0, 1.0]))
            .await
            .unwrap();

        let opts = SearchOptions {
            min_similarity: 0.7,
            ..Default::default()
        };
        let hits = store.search(&[1.0, 0.0, 0.0], &opts).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, near);
        assert_eq!(hits[1].chunk.id, mid);
        assert!(hits[0].similarity > hits[1].similarity);
        for hit in &hits {
            assert!(hit.similarity >= 0.7);
        }
    }

    #[tokio::test]
    async fn search_bumps_access_stats_in_batch() {
        let store = SqliteKnowledgeStore::open_in_memory(2).unwrap();
        let id = store
            .store(chunk_with("accessed", vec![1.0, 0.0]))
            .await
            .unwrap()
            .id();

        let opts = SearchOptions {
            min_similarity: 0.0,
            ..Default::default()
        };
        let hits = store.search(&[1.0, 0.0], &opts).await.unwrap();
        assert_eq!(hits[0].chunk.access_count, 1);

        store.search(&[1.0, 0.0], &opts).await.unwrap();
        let chunk = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(chunk.access_count, 2);
        assert!(chunk.last_accessed_at.is_some());
    }

    #[tokio::test]
    async fn search_filters_by_source_and_excludes_anchor() {
        let store = SqliteKnowledgeStore::open_in_memory(2).unwrap();
        let anchor = store
            .store(chunk_with("anchor", vec![1.0, 0.0]))
            .await
            .unwrap()
            .id();
        let mut jira = chunk_with("jira neighbor", vec![0.95, 0.05]);
        jira.source_type = "jira".to_string();
        let jira_id = store.store(jira).await.unwrap().id();

        let opts = SearchOptions {
            min_similarity: 0.0,
            exclude_chunk: Some(anchor),
            source_types: Some(vec!["jira".to_string()]),
            ..Default::default()
        };
        let hits = store.search(&[1.0, 0.0], &opts).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, jira_id);
    }

    #[tokio::test]
    async fn tier_demotion_policy() {
        let store = SqliteKnowledgeStore::open_in_memory(2).unwrap();
        store
            .store(chunk_with("fresh", vec![1.0, 0.0]))
            .await
            .unwrap();

        let policy = TierPolicy {
            hot_max_age: std::time::Duration::from_secs(7 * 24 * 3600),
            warm_max_age: std::time::Duration::from_secs(30 * 24 * 3600),
            demote_below_access: 3,
        };

        // Nothing old enough yet.
        let none = store.demote_tiers(policy, Utc::now()).await.unwrap();
        assert_eq!(none, TierDemotions::default());

        // Eight days on: hot → warm, but not straight to cold.
        let eight_days = Utc::now() + chrono::Duration::days(8);
        let first = store.demote_tiers(policy, eight_days).await.unwrap();
        assert_eq!(first.hot_to_warm, 1);
        assert_eq!(first.warm_to_cold, 0);

        // Thirty-one days on: warm → cold.
        let month = Utc::now() + chrono::Duration::days(31);
        let second = store.demote_tiers(policy, month).await.unwrap();
        assert_eq!(second.warm_to_cold, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.by_tier.get("cold"), Some(&1));
    }

    #[tokio::test]
    async fn frequently_accessed_chunks_stay_hot() {
        let store = SqliteKnowledgeStore::open_in_memory(2).unwrap();
        store
            .store(chunk_with("popular", vec![1.0, 0.0]))
            .await
            .unwrap();

        // Three searches push access_count to the threshold.
        let opts = SearchOptions {
            min_similarity: 0.0,
            ..Default::default()
        };
        for _ in 0..3 {
            store.search(&[1.0, 0.0], &opts).await.unwrap();
        }

        let policy = TierPolicy {
            hot_max_age: std::time::Duration::from_secs(7 * 24 * 3600),
            warm_max_age: std::time::Duration::from_secs(30 * 24 * 3600),
            demote_below_access: 3,
        };
        let eight_days = Utc::now() + chrono::Duration::days(8);
        let demotions = store.demote_tiers(policy, eight_days).await.unwrap();
        assert_eq!(demotions.hot_to_warm, 0);
    }

    #[tokio::test]
    async fn get_by_source_newest_first() {
        let store = SqliteKnowledgeStore::open_in_memory(2).unwrap();
        store
            .store(chunk_with("slack one", vec![1.0, 0.0]))
            .await
            .unwrap();
        let mut git = chunk_with("git one", vec![0.0, 1.0]);
        git.source_type = "git".to_string();
        store.store(git).await.unwrap();

        let all = store.get_by_source(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let git_only = store.get_by_source(Some("git"), 10).await.unwrap();
        assert_eq!(git_only.len(), 1);
        assert_eq!(git_only[0].content, "git one");
    }

    #[tokio::test]
    async fn index_rebuilds_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knowledge.db");

        {
            let store = SqliteKnowledgeStore::open(&path, 2).unwrap();
            store
                .store(chunk_with("persisted", vec![1.0, 0.0]))
                .await
                .unwrap();
        }

        let reopened = SqliteKnowledgeStore::open(&path, 2).unwrap();
        let opts = SearchOptions {
            min_similarity: 0.5,
            ..Default::default()
        };
        let hits = reopened.search(&[1.0, 0.0], &opts).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.content, "persisted");
    }
}
