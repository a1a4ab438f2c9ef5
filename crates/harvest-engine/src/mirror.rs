//! Downstream copies the sync engine pushes to. Every write is an
//! idempotent upsert, so re-pushing a batch after a failure is harmless.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{Record, RecordKey, Status, StatusTransition};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serializing payload for mirror: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("mirror unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SecondaryMirror: Send + Sync {
    /// Destination id the sync cursor is stored under.
    fn id(&self) -> &str;

    /// Keyed by `(partition, sequence_id)`.
    async fn upsert_record(&self, record: &Record) -> Result<(), MirrorError>;

    /// Keyed by `(partition, sequence_id, changed_at, to_status)`.
    async fn upsert_transition(&self, transition: &StatusTransition) -> Result<(), MirrorError>;
}

const MIRROR_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS mirror_records (
        partition INTEGER NOT NULL,
        sequence_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        reference TEXT,
        title TEXT,
        outcome_recorded INTEGER NOT NULL,
        first_seen_at TEXT NOT NULL,
        last_checked_at TEXT NOT NULL,
        last_changed_at TEXT NOT NULL,
        modified_at TEXT NOT NULL,
        scrape_count INTEGER NOT NULL,
        archived INTEGER NOT NULL,
        archived_at TEXT,
        PRIMARY KEY (partition, sequence_id)
    )",
    "CREATE TABLE IF NOT EXISTS mirror_status_transitions (
        partition INTEGER NOT NULL,
        sequence_id INTEGER NOT NULL,
        from_status TEXT NOT NULL,
        to_status TEXT NOT NULL,
        changed_at TEXT NOT NULL,
        anomalous INTEGER NOT NULL,
        reactivated INTEGER NOT NULL,
        PRIMARY KEY (partition, sequence_id, changed_at, to_status)
    )",
];

/// Mirror in a SQLite-compatible database reachable through sqlx.
#[derive(Debug, Clone)]
pub struct SqliteMirror {
    id: String,
    pool: SqlitePool,
}

/// The columns of a mirrored row that tests and operators compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredRecord {
    pub key: RecordKey,
    pub status: String,
    pub scrape_count: u64,
    pub archived: bool,
    pub modified_at: String,
}

impl SqliteMirror {
    pub async fn connect(id: impl Into<String>, url: &str) -> Result<Self, MirrorError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Self::from_pool(id, pool).await
    }

    pub async fn in_memory(id: impl Into<String>) -> Result<Self, MirrorError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(id, pool).await
    }

    pub async fn from_pool(id: impl Into<String>, pool: SqlitePool) -> Result<Self, MirrorError> {
        for statement in MIRROR_SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            id: id.into(),
            pool,
        })
    }

    pub async fn fetch_record(&self, key: &RecordKey) -> Result<Option<MirroredRecord>, MirrorError> {
        let row = sqlx::query(
            "SELECT status, scrape_count, archived, modified_at FROM mirror_records
             WHERE partition = ? AND sequence_id = ?",
        )
        .bind(key.partition.0 as i64)
        .bind(key.sequence_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<MirroredRecord, MirrorError> {
            Ok(MirroredRecord {
                key: *key,
                status: row.try_get("status")?,
                scrape_count: row.try_get::<i64, _>("scrape_count")? as u64,
                archived: row.try_get::<i64, _>("archived")? != 0,
                modified_at: row.try_get("modified_at")?,
            })
        })
        .transpose()
    }

    pub async fn record_count(&self) -> Result<u64, MirrorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mirror_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn transition_count(&self) -> Result<u64, MirrorError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mirror_status_transitions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[async_trait]
impl SecondaryMirror for SqliteMirror {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upsert_record(&self, record: &Record) -> Result<(), MirrorError> {
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(
            "INSERT INTO mirror_records (partition, sequence_id, status, payload, reference, title,
                outcome_recorded, first_seen_at, last_checked_at, last_changed_at, modified_at,
                scrape_count, archived, archived_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (partition, sequence_id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                reference = excluded.reference,
                title = excluded.title,
                outcome_recorded = excluded.outcome_recorded,
                first_seen_at = excluded.first_seen_at,
                last_checked_at = excluded.last_checked_at,
                last_changed_at = excluded.last_changed_at,
                modified_at = excluded.modified_at,
                scrape_count = excluded.scrape_count,
                archived = excluded.archived,
                archived_at = excluded.archived_at",
        )
        .bind(record.key.partition.0 as i64)
        .bind(record.key.sequence_id as i64)
        .bind(record.status.as_str())
        .bind(payload)
        .bind(&record.reference)
        .bind(&record.title)
        .bind(record.outcome_recorded as i64)
        .bind(rfc3339(record.first_seen_at))
        .bind(rfc3339(record.last_checked_at))
        .bind(rfc3339(record.last_changed_at))
        .bind(rfc3339(record.modified_at))
        .bind(record.scrape_count as i64)
        .bind(record.archived as i64)
        .bind(record.archived_at.map(rfc3339))
        .execute(&self.pool)
        .await?;
        debug!(mirror = %self.id, record = %record.key, "record mirrored");
        Ok(())
    }

    async fn upsert_transition(&self, transition: &StatusTransition) -> Result<(), MirrorError> {
        sqlx::query(
            "INSERT INTO mirror_status_transitions (partition, sequence_id, from_status, to_status,
                changed_at, anomalous, reactivated)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (partition, sequence_id, changed_at, to_status) DO UPDATE SET
                from_status = excluded.from_status,
                anomalous = excluded.anomalous,
                reactivated = excluded.reactivated",
        )
        .bind(transition.key.partition.0 as i64)
        .bind(transition.key.sequence_id as i64)
        .bind(transition.from_status.as_str())
        .bind(transition.to_status.as_str())
        .bind(rfc3339(transition.changed_at))
        .bind(transition.anomalous as i64)
        .bind(transition.reactivated as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryMirrorState {
    records: BTreeMap<RecordKey, Record>,
    transitions: BTreeMap<(RecordKey, DateTime<Utc>, Status), StatusTransition>,
    upserts: usize,
    fail_after: Option<usize>,
}

impl MemoryMirrorState {
    fn admit(&mut self) -> Result<(), MirrorError> {
        if self.fail_after.is_some_and(|limit| self.upserts >= limit) {
            return Err(MirrorError::Unavailable(format!(
                "injected failure after {} upserts",
                self.upserts
            )));
        }
        self.upserts += 1;
        Ok(())
    }
}

/// In-process mirror with optional injected failure.
#[derive(Debug)]
pub struct MemoryMirror {
    id: String,
    state: Mutex<MemoryMirrorState>,
}

impl MemoryMirror {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(MemoryMirrorState::default()),
        }
    }

    /// Accept `limit` upserts, then reject every later one until `heal`.
    pub fn failing_after(id: impl Into<String>, limit: usize) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(MemoryMirrorState {
                fail_after: Some(limit),
                ..Default::default()
            }),
        }
    }

    pub async fn heal(&self) {
        self.state.lock().await.fail_after = None;
    }

    pub async fn record(&self, key: &RecordKey) -> Option<Record> {
        self.state.lock().await.records.get(key).cloned()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn transitions(&self) -> Vec<StatusTransition> {
        self.state.lock().await.transitions.values().cloned().collect()
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upserts
    }
}

#[async_trait]
impl SecondaryMirror for MemoryMirror {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upsert_record(&self, record: &Record) -> Result<(), MirrorError> {
        let mut state = self.state.lock().await;
        state.admit()?;
        state.records.insert(record.key, record.clone());
        Ok(())
    }

    async fn upsert_transition(&self, transition: &StatusTransition) -> Result<(), MirrorError> {
        let mut state = self.state.lock().await;
        state.admit()?;
        state.transitions.insert(
            (transition.key, transition.changed_at, transition.to_status),
            transition.clone(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::{interpret_payload, Partition};
    use serde_json::json;

    fn record(status: &str) -> Record {
        let payload = json!({"opportunity": {"statusCode": status}});
        let summary = interpret_payload(&payload).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 2, 2, 0, 0, 0).unwrap();
        Record::first_seen(RecordKey::new(Partition(2025), 3), summary, payload, at)
    }

    #[tokio::test]
    async fn sqlite_upserts_are_idempotent() {
        let mirror = SqliteMirror::in_memory("cloud").await.unwrap();
        let mut r = record("OPEN");
        mirror.upsert_record(&r).await.unwrap();
        mirror.upsert_record(&r).await.unwrap();
        assert_eq!(mirror.record_count().await.unwrap(), 1);

        r.status = Status::Closed;
        r.scrape_count = 2;
        mirror.upsert_record(&r).await.unwrap();
        let row = mirror.fetch_record(&r.key).await.unwrap().unwrap();
        assert_eq!(row.status, "CLOSED");
        assert_eq!(row.scrape_count, 2);

        let t = StatusTransition {
            key: r.key,
            from_status: Status::Open,
            to_status: Status::Closed,
            changed_at: r.modified_at,
            anomalous: false,
            reactivated: false,
        };
        mirror.upsert_transition(&t).await.unwrap();
        mirror.upsert_transition(&t).await.unwrap();
        assert_eq!(mirror.transition_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_mirror_fails_after_limit_until_healed() {
        let mirror = MemoryMirror::failing_after("flaky", 1);
        let r = record("OPEN");
        mirror.upsert_record(&r).await.unwrap();
        assert!(matches!(
            mirror.upsert_record(&r).await,
            Err(MirrorError::Unavailable(_))
        ));
        mirror.heal().await;
        mirror.upsert_record(&r).await.unwrap();
        assert_eq!(mirror.records().await.len(), 1);
    }
}
