//! Durable raw-event log
//!
//! Append-mostly store of every externally observed occurrence. Rows are
//! deduplicated on `(source, external_id)` when the source supplies a
//! stable id; processing status is the pipeline's durable checkpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventId, EventLogError, ProcessingStatus};

/// One externally observed occurrence, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: EventId,
    /// Source tag, e.g. "slack", "jira", "git".
    pub source: String,
    /// Source-specific event type, e.g. "message", "issue_updated".
    pub event_type: String,
    /// Stable id assigned by the source, when it has one.
    pub external_id: Option<String>,
    /// Opaque source-native payload.
    pub payload: Value,
    /// Free-form metadata captured at observation time.
    pub metadata: Value,
    pub ingested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: ProcessingStatus,
}

/// A normalized event draft as emitted by a source adapter, before it
/// has an id or a processing status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawEvent {
    pub source: String,
    pub event_type: String,
    pub external_id: Option<String>,
    pub payload: Value,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl NewRawEvent {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            external_id: None,
            payload,
            metadata: Value::Object(serde_json::Map::new()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Abstract event log store.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Insert a new event with status `pending`.
    ///
    /// Fails with [`EventLogError::Duplicate`] when `(source,
    /// external_id)` already exists; callers treat that as success.
    async fn insert(&self, event: NewRawEvent) -> Result<EventId, EventLogError>;

    /// Retrieve an event by id.
    async fn get(&self, id: EventId) -> Result<Option<RawEvent>, EventLogError>;

    /// Look up an event by its source-assigned id.
    async fn find_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<RawEvent>, EventLogError>;

    /// Idempotent status transition. Terminal statuses record `at` as
    /// the processing time; repeating a call with the same arguments is
    /// a no-op.
    async fn mark_status(
        &self,
        id: EventId,
        status: ProcessingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), EventLogError>;

    /// Scan pending events, oldest first, for crash recovery.
    async fn get_pending(&self, limit: usize) -> Result<Vec<RawEvent>, EventLogError>;
}

/// SQLite-backed event log.
pub struct SqliteEventLog {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteEventLog {
    /// Open (or create) the log at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, EventLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EventLogError::Storage(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EventLogError::Storage(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory log (useful for tests).
    pub fn open_in_memory() -> Result<Self, EventLogError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| EventLogError::Storage(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), EventLogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS raw_events (
                event_id     TEXT PRIMARY KEY,
                source       TEXT NOT NULL,
                event_type   TEXT NOT NULL,
                external_id  TEXT,
                payload      TEXT NOT NULL,
                metadata     TEXT NOT NULL,
                ingested_at  TEXT NOT NULL,
                processed_at TEXT,
                status       TEXT NOT NULL DEFAULT 'pending'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_events_source_external
                ON raw_events(source, external_id)
                WHERE external_id IS NOT NULL;

            CREATE INDEX IF NOT EXISTS idx_raw_events_status ON raw_events(status);
            CREATE INDEX IF NOT EXISTS idx_raw_events_ingested ON raw_events(ingested_at);",
        )
        .map_err(|e| EventLogError::Storage(e.to_string()))?;
        Ok(())
    }

    fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn insert(&self, event: NewRawEvent) -> Result<EventId, EventLogError> {
        let id = EventId::new();
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| EventLogError::Serialization(e.to_string()))?;
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| EventLogError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO raw_events
                (event_id, source, event_type, external_id, payload, metadata,
                 ingested_at, processed_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 'pending')",
            rusqlite::params![
                id.to_string(),
                event.source,
                event.event_type,
                event.external_id,
                payload,
                metadata,
                event.timestamp.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(id),
            Err(e) if Self::is_unique_violation(&e) => {
                let external_id = event.external_id.as_deref().unwrap_or_default();
                let existing: String = conn
                    .query_row(
                        "SELECT event_id FROM raw_events
                         WHERE source = ?1 AND external_id = ?2",
                        rusqlite::params![event.source, external_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| EventLogError::Storage(e.to_string()))?;
                let existing = existing
                    .parse()
                    .map_err(|e: uuid::Error| EventLogError::Serialization(e.to_string()))?;
                Err(EventLogError::Duplicate { existing })
            }
            Err(e) => Err(EventLogError::Storage(e.to_string())),
        }
    }

    async fn get(&self, id: EventId) -> Result<Option<RawEvent>, EventLogError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, source, event_type, external_id, payload, metadata,
                        ingested_at, processed_at, status
                 FROM raw_events WHERE event_id = ?1",
            )
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![id.to_string()], row_to_event)
            .optional()
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        match result {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn find_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<RawEvent>, EventLogError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, source, event_type, external_id, payload, metadata,
                        ingested_at, processed_at, status
                 FROM raw_events WHERE source = ?1 AND external_id = ?2",
            )
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![source, external_id], row_to_event)
            .optional()
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        match result {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn mark_status(
        &self,
        id: EventId,
        status: ProcessingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), EventLogError> {
        let processed_at = match status {
            ProcessingStatus::Completed | ProcessingStatus::Failed => Some(at.to_rfc3339()),
            ProcessingStatus::Pending | ProcessingStatus::Processing => None,
        };

        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE raw_events SET status = ?1, processed_at = ?2 WHERE event_id = ?3",
                rusqlite::params![status.to_string(), processed_at, id.to_string()],
            )
            .map_err(|e| EventLogError::Storage(e.to_string()))?;
        if rows == 0 {
            return Err(EventLogError::NotFound(id));
        }
        Ok(())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<RawEvent>, EventLogError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, source, event_type, external_id, payload, metadata,
                        ingested_at, processed_at, status
                 FROM raw_events
                 WHERE status = 'pending'
                 ORDER BY ingested_at
                 LIMIT ?1",
            )
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![limit as i64], row_to_event)
            .map_err(|e| EventLogError::Storage(e.to_string()))?;

        let mut events = Vec::new();
        for row_result in rows {
            let inner = row_result.map_err(|e| EventLogError::Storage(e.to_string()))?;
            events.push(inner?);
        }
        Ok(events)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RawEvent, EventLogError>> {
    let id_str: String = row.get(0)?;
    let source: String = row.get(1)?;
    let event_type: String = row.get(2)?;
    let external_id: Option<String> = row.get(3)?;
    let payload_str: String = row.get(4)?;
    let metadata_str: String = row.get(5)?;
    let ingested_str: String = row.get(6)?;
    let processed_str: Option<String> = row.get(7)?;
    let status_str: String = row.get(8)?;

    Ok((|| -> Result<RawEvent, EventLogError> {
        let id: EventId = id_str
            .parse()
            .map_err(|e: uuid::Error| EventLogError::Serialization(e.to_string()))?;
        let payload = serde_json::from_str(&payload_str)
            .map_err(|e| EventLogError::Serialization(e.to_string()))?;
        let metadata = serde_json::from_str(&metadata_str)
            .map_err(|e| EventLogError::Serialization(e.to_string()))?;
        let ingested_at = DateTime::parse_from_rfc3339(&ingested_str)
            .map_err(|e| EventLogError::Serialization(e.to_string()))?
            .with_timezone(&Utc);
        let processed_at = processed_str
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| EventLogError::Serialization(e.to_string()))
            })
            .transpose()?;
        let status: ProcessingStatus = status_str
            .parse()
            .map_err(EventLogError::Serialization)?;

        Ok(RawEvent {
            id,
            source,
            event_type,
            external_id,
            payload,
            metadata,
            ingested_at,
            processed_at,
            status,
        })
    })())
}

/// Extension trait so we can use `optional()` on rusqlite queries.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slack_event(external_id: &str) -> NewRawEvent {
        NewRawEvent::new("slack", "message", json!({"text": "hello team"}))
            .with_external_id(external_id)
    }

    #[tokio::test]
    async fn insert_and_get() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        let id = log.insert(slack_event("1700000000.000100")).await.unwrap();

        let event = log.get(id).await.unwrap().unwrap();
        assert_eq!(event.source, "slack");
        assert_eq!(event.status, ProcessingStatus::Pending);
        assert_eq!(event.external_id.as_deref(), Some("1700000000.000100"));
        assert!(event.processed_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_external_id_rejected() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        let first = log.insert(slack_event("ts-1")).await.unwrap();

        let err = log.insert(slack_event("ts-1")).await.unwrap_err();
        match err {
            EventLogError::Duplicate { existing } => assert_eq!(existing, first),
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_external_id_different_source_allowed() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        log.insert(slack_event("shared-1")).await.unwrap();

        let jira = NewRawEvent::new("jira", "issue_updated", json!({"title": "Bug"}))
            .with_external_id("shared-1");
        assert!(log.insert(jira).await.is_ok());
    }

    #[tokio::test]
    async fn events_without_external_id_never_collide() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        let payload = json!({"text": "same payload"});
        log.insert(NewRawEvent::new("slack", "message", payload.clone()))
            .await
            .unwrap();
        log.insert(NewRawEvent::new("slack", "message", payload))
            .await
            .unwrap();

        let pending = log.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn mark_status_is_idempotent() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        let id = log.insert(slack_event("ts-2")).await.unwrap();

        let at = Utc::now();
        log.mark_status(id, ProcessingStatus::Completed, at)
            .await
            .unwrap();
        let first = log.get(id).await.unwrap().unwrap();

        log.mark_status(id, ProcessingStatus::Completed, at)
            .await
            .unwrap();
        let second = log.get(id).await.unwrap().unwrap();

        assert_eq!(first.status, ProcessingStatus::Completed);
        assert_eq!(first.processed_at, second.processed_at);
    }

    #[tokio::test]
    async fn mark_status_unknown_event() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        let err = log
            .mark_status(EventId::new(), ProcessingStatus::Completed, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_pending_respects_limit_and_order() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        for i in 0..5 {
            let mut event = slack_event(&format!("ts-{i}"));
            event.timestamp = Utc::now() + chrono::Duration::milliseconds(i);
            log.insert(event).await.unwrap();
        }

        let pending = log.get_pending(3).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].external_id.as_deref(), Some("ts-0"));

        // Completed events drop out of the pending scan.
        log.mark_status(pending[0].id, ProcessingStatus::Completed, Utc::now())
            .await
            .unwrap();
        let remaining = log.get_pending(10).await.unwrap();
        assert_eq!(remaining.len(), 4);
    }
}
