use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Attempt, AttemptOrigin, AttemptOutcome, Partition, Record, RecordKey, Status,
    StatusTransition, SyncCursor,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::{ApplyCommit, PartitionStats, RecordStore, ReviewQueue, StoreError, TierPredicate};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS records (
        partition INTEGER NOT NULL,
        sequence_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        reference TEXT,
        title TEXT,
        outcome_recorded INTEGER NOT NULL,
        first_seen_at INTEGER NOT NULL,
        last_checked_at INTEGER NOT NULL,
        last_changed_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        scrape_count INTEGER NOT NULL,
        archived INTEGER NOT NULL,
        archived_at INTEGER,
        pending_cycles INTEGER NOT NULL,
        version INTEGER NOT NULL,
        PRIMARY KEY (partition, sequence_id)
    )",
    "CREATE INDEX IF NOT EXISTS records_status_idx ON records (status, archived)",
    "CREATE INDEX IF NOT EXISTS records_modified_idx ON records (modified_at)",
    "CREATE TABLE IF NOT EXISTS status_transitions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        partition INTEGER NOT NULL,
        sequence_id INTEGER NOT NULL,
        from_status TEXT NOT NULL,
        to_status TEXT NOT NULL,
        changed_at INTEGER NOT NULL,
        anomalous INTEGER NOT NULL,
        reactivated INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS status_transitions_key_idx
        ON status_transitions (partition, sequence_id, changed_at)",
    "CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        partition INTEGER NOT NULL,
        sequence_id INTEGER NOT NULL,
        attempted_at INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        origin TEXT NOT NULL,
        detail TEXT
    )",
    "CREATE INDEX IF NOT EXISTS attempts_key_idx ON attempts (partition, sequence_id)",
    "CREATE TABLE IF NOT EXISTS frontiers (
        partition INTEGER PRIMARY KEY,
        max_hit INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_cursors (
        destination_id TEXT PRIMARY KEY,
        last_synced_at INTEGER NOT NULL
    )",
    "CREATE TRIGGER IF NOT EXISTS records_never_deleted BEFORE DELETE ON records
     BEGIN SELECT RAISE(ABORT, 'records are never deleted'); END",
    "CREATE TRIGGER IF NOT EXISTS status_transitions_append_only BEFORE UPDATE ON status_transitions
     BEGIN SELECT RAISE(ABORT, 'status history is append-only'); END",
    "CREATE TRIGGER IF NOT EXISTS status_transitions_never_deleted BEFORE DELETE ON status_transitions
     BEGIN SELECT RAISE(ABORT, 'status history is append-only'); END",
    "CREATE TRIGGER IF NOT EXISTS attempts_never_deleted BEFORE DELETE ON attempts
     BEGIN SELECT RAISE(ABORT, 'attempt log is write-once'); END",
];

const RECORD_COLUMNS: &str = "partition, sequence_id, status, payload, reference, title, \
    outcome_recorded, first_seen_at, last_checked_at, last_changed_at, modified_at, \
    scrape_count, archived, archived_at, pending_cycles, version";

const CHANGE_STAMP: &str = "MAX(modified_at, COALESCE(archived_at, modified_at))";

/// SQLite-backed store; the harvester's durable local copy.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database (each connection would otherwise
    /// see its own empty database).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("record store schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {value}")))
}

fn parse_status(value: &str) -> Result<Status, StoreError> {
    value
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{e}")))
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let payload: String = row.try_get("payload")?;
    let archived_at: Option<i64> = row.try_get("archived_at")?;
    Ok(Record {
        key: RecordKey::new(
            Partition(row.try_get::<i64, _>("partition")? as u32),
            row.try_get::<i64, _>("sequence_id")? as u64,
        ),
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        payload: serde_json::from_str(&payload)?,
        reference: row.try_get("reference")?,
        title: row.try_get("title")?,
        outcome_recorded: row.try_get("outcome_recorded")?,
        first_seen_at: from_micros(row.try_get("first_seen_at")?)?,
        last_checked_at: from_micros(row.try_get("last_checked_at")?)?,
        last_changed_at: from_micros(row.try_get("last_changed_at")?)?,
        modified_at: from_micros(row.try_get("modified_at")?)?,
        scrape_count: row.try_get::<i64, _>("scrape_count")? as u64,
        archived: row.try_get("archived")?,
        archived_at: archived_at.map(from_micros).transpose()?,
        pending_cycles: row.try_get::<i64, _>("pending_cycles")? as u32,
        version: row.try_get::<i64, _>("version")? as u64,
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<StatusTransition, StoreError> {
    Ok(StatusTransition {
        key: RecordKey::new(
            Partition(row.try_get::<i64, _>("partition")? as u32),
            row.try_get::<i64, _>("sequence_id")? as u64,
        ),
        from_status: parse_status(&row.try_get::<String, _>("from_status")?)?,
        to_status: parse_status(&row.try_get::<String, _>("to_status")?)?,
        changed_at: from_micros(row.try_get("changed_at")?)?,
        anomalous: row.try_get("anomalous")?,
        reactivated: row.try_get("reactivated")?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<Attempt, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    let origin: String = row.try_get("origin")?;
    Ok(Attempt {
        key: RecordKey::new(
            Partition(row.try_get::<i64, _>("partition")? as u32),
            row.try_get::<i64, _>("sequence_id")? as u64,
        ),
        attempted_at: from_micros(row.try_get("attempted_at")?)?,
        outcome: AttemptOutcome::from_str(&outcome).map_err(StoreError::Corrupt)?,
        origin: AttemptOrigin::parse_label(&origin)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown attempt origin `{origin}`")))?,
        detail: row.try_get("detail")?,
    })
}

async fn write_record(conn: &mut SqliteConnection, record: &Record) -> Result<u64, StoreError> {
    let expected = record.version;
    let next = expected + 1;
    let payload = serde_json::to_string(&record.payload)?;

    let affected = if expected == 0 {
        sqlx::query(&format!(
            "INSERT INTO records ({RECORD_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (partition, sequence_id) DO NOTHING"
        ))
        .bind(record.key.partition.0 as i64)
        .bind(record.key.sequence_id as i64)
        .bind(record.status.as_str())
        .bind(&payload)
        .bind(&record.reference)
        .bind(&record.title)
        .bind(record.outcome_recorded)
        .bind(micros(record.first_seen_at))
        .bind(micros(record.last_checked_at))
        .bind(micros(record.last_changed_at))
        .bind(micros(record.modified_at))
        .bind(record.scrape_count as i64)
        .bind(record.archived)
        .bind(record.archived_at.map(micros))
        .bind(record.pending_cycles as i64)
        .bind(next as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected()
    } else {
        sqlx::query(
            "UPDATE records SET status = ?, payload = ?, reference = ?, title = ?, \
             outcome_recorded = ?, first_seen_at = ?, last_checked_at = ?, last_changed_at = ?, \
             modified_at = ?, scrape_count = ?, archived = ?, archived_at = ?, \
             pending_cycles = ?, version = ? \
             WHERE partition = ? AND sequence_id = ? AND version = ?",
        )
        .bind(record.status.as_str())
        .bind(&payload)
        .bind(&record.reference)
        .bind(&record.title)
        .bind(record.outcome_recorded)
        .bind(micros(record.first_seen_at))
        .bind(micros(record.last_checked_at))
        .bind(micros(record.last_changed_at))
        .bind(micros(record.modified_at))
        .bind(record.scrape_count as i64)
        .bind(record.archived)
        .bind(record.archived_at.map(micros))
        .bind(record.pending_cycles as i64)
        .bind(next as i64)
        .bind(record.key.partition.0 as i64)
        .bind(record.key.sequence_id as i64)
        .bind(expected as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected()
    };

    if affected == 1 {
        return Ok(next);
    }

    let found: Option<i64> =
        sqlx::query_scalar("SELECT version FROM records WHERE partition = ? AND sequence_id = ?")
            .bind(record.key.partition.0 as i64)
            .bind(record.key.sequence_id as i64)
            .fetch_optional(&mut *conn)
            .await?;
    Err(StoreError::VersionConflict {
        key: record.key,
        expected,
        found: found.map(|v| v as u64),
    })
}

async fn write_transition(
    conn: &mut SqliteConnection,
    transition: &StatusTransition,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO status_transitions \
         (partition, sequence_id, from_status, to_status, changed_at, anomalous, reactivated) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(transition.key.partition.0 as i64)
    .bind(transition.key.sequence_id as i64)
    .bind(transition.from_status.as_str())
    .bind(transition.to_status.as_str())
    .bind(micros(transition.changed_at))
    .bind(transition.anomalous)
    .bind(transition.reactivated)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_attempt(conn: &mut SqliteConnection, attempt: &Attempt) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO attempts (partition, sequence_id, attempted_at, outcome, origin, detail) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(attempt.key.partition.0 as i64)
    .bind(attempt.key.sequence_id as i64)
    .bind(micros(attempt.attempted_at))
    .bind(attempt.outcome.as_str())
    .bind(attempt.origin.label())
    .bind(&attempt.detail)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_record(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE partition = ? AND sequence_id = ?"
        ))
        .bind(key.partition.0 as i64)
        .bind(key.sequence_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn upsert_record(&self, record: &Record) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_record(&mut conn, record).await
    }

    async fn append_transition(&self, transition: &StatusTransition) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_transition(&mut conn, transition).await
    }

    async fn append_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_attempt(&mut conn, attempt).await
    }

    async fn commit(&self, commit: &ApplyCommit) -> Result<Option<u64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let version = match &commit.record {
            Some(record) => Some(write_record(&mut tx, record).await?),
            None => None,
        };
        if let Some(transition) = &commit.transition {
            write_transition(&mut tx, transition).await?;
        }
        write_attempt(&mut tx, &commit.attempt).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn query_by_tier_predicate(
        &self,
        predicate: &TierPredicate,
    ) -> Result<Vec<Record>, StoreError> {
        if predicate.statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; predicate.statuses.len()].join(", ");
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE status IN ({placeholders})"
        );
        if !predicate.include_archived {
            sql.push_str(" AND archived = 0");
        }
        if predicate.partition.is_some() {
            sql.push_str(" AND partition = ?");
        }
        sql.push_str(" ORDER BY partition DESC, sequence_id DESC");

        let mut query = sqlx::query(&sql);
        for status in &predicate.statuses {
            query = query.bind(status.as_str());
        }
        if let Some(partition) = predicate.partition {
            query = query.bind(partition.0 as i64);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn bump_pending_cycles(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query(
                "UPDATE records SET pending_cycles = pending_cycles + 1, version = version + 1 \
                 WHERE partition = ? AND sequence_id = ?",
            )
            .bind(key.partition.0 as i64)
            .bind(key.sequence_id as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn max_sequence_id(&self, partition: Partition) -> Result<Option<u64>, StoreError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence_id) FROM records WHERE partition = ?")
                .bind(partition.0 as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(|v| v as u64))
    }

    async fn frontier(&self, partition: Partition) -> Result<Option<u64>, StoreError> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT max_hit FROM frontiers WHERE partition = ?")
                .bind(partition.0 as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|v| v as u64))
    }

    async fn advance_frontier(
        &self,
        partition: Partition,
        sequence_id: u64,
    ) -> Result<u64, StoreError> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO frontiers (partition, max_hit) VALUES (?, ?) \
             ON CONFLICT (partition) DO UPDATE SET max_hit = MAX(max_hit, excluded.max_hit) \
             RETURNING max_hit",
        )
        .bind(partition.0 as i64)
        .bind(sequence_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(value as u64)
    }

    async fn get_cursor(&self, destination_id: &str) -> Result<Option<SyncCursor>, StoreError> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_synced_at FROM sync_cursors WHERE destination_id = ?")
                .bind(destination_id)
                .fetch_optional(&self.pool)
                .await?;
        value
            .map(|v| {
                Ok(SyncCursor {
                    destination_id: destination_id.to_string(),
                    last_synced_at: from_micros(v)?,
                })
            })
            .transpose()
    }

    async fn set_cursor(&self, cursor: &SyncCursor) -> Result<SyncCursor, StoreError> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO sync_cursors (destination_id, last_synced_at) VALUES (?, ?) \
             ON CONFLICT (destination_id) DO UPDATE \
             SET last_synced_at = MAX(last_synced_at, excluded.last_synced_at) \
             RETURNING last_synced_at",
        )
        .bind(&cursor.destination_id)
        .bind(micros(cursor.last_synced_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(SyncCursor {
            destination_id: cursor.destination_id.clone(),
            last_synced_at: from_micros(value)?,
        })
    }

    async fn records_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE {CHANGE_STAMP} > ? \
             ORDER BY {CHANGE_STAMP}, partition, sequence_id"
        ))
        .bind(since.map(micros).unwrap_or(i64::MIN))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn transitions_between(
        &self,
        after: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<StatusTransition>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM status_transitions WHERE changed_at > ? AND changed_at <= ? \
             ORDER BY changed_at, id",
        )
        .bind(after.map(micros).unwrap_or(i64::MIN))
        .bind(micros(up_to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn transitions_for(&self, key: &RecordKey) -> Result<Vec<StatusTransition>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM status_transitions WHERE partition = ? AND sequence_id = ? \
             ORDER BY changed_at, id",
        )
        .bind(key.partition.0 as i64)
        .bind(key.sequence_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn attempts_for(&self, key: &RecordKey) -> Result<Vec<Attempt>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM attempts WHERE partition = ? AND sequence_id = ? ORDER BY id",
        )
        .bind(key.partition.0 as i64)
        .bind(key.sequence_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn partitions(&self) -> Result<Vec<Partition>, StoreError> {
        let values: Vec<i64> = sqlx::query_scalar(
            "SELECT partition FROM records UNION SELECT partition FROM frontiers ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(values.into_iter().map(|v| Partition(v as u32)).collect())
    }

    async fn partition_stats(&self, partition: Partition) -> Result<PartitionStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total, SUM(archived) AS archived \
             FROM records WHERE partition = ? GROUP BY status",
        )
        .bind(partition.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = PartitionStats {
            partition: Some(partition),
            frontier: self.frontier(partition).await?,
            highest_sequence_id: self.max_sequence_id(partition).await?,
            ..Default::default()
        };
        for row in rows {
            let status = parse_status(&row.try_get::<String, _>("status")?)?;
            let total = row.try_get::<i64, _>("total")? as u64;
            stats.total += total;
            stats.archived += row.try_get::<i64, _>("archived")? as u64;
            stats.by_status.insert(status, total);
        }
        Ok(stats)
    }

    async fn review_queue(&self) -> Result<ReviewQueue, StoreError> {
        let transitions = sqlx::query(
            "SELECT * FROM status_transitions WHERE anomalous = 1 ORDER BY changed_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let attempts = sqlx::query("SELECT * FROM attempts WHERE outcome = ? ORDER BY id")
            .bind(AttemptOutcome::Rejected.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(ReviewQueue {
            anomalous_transitions: transitions
                .iter()
                .map(transition_from_row)
                .collect::<Result<_, _>>()?,
            rejected_attempts: attempts.iter().map(attempt_from_row).collect::<Result<_, _>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::interpret_payload;
    use serde_json::json;
    use tempfile::tempdir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 8, 30, 0).single().unwrap()
    }

    fn record(seq: u64, status: &str) -> Record {
        let payload = json!({"opportunity": {"statusCode": status, "referenceNumber": format!("AB-2025-{seq:05}")}});
        let summary = interpret_payload(&payload).expect("payload");
        Record::first_seen(RecordKey::new(Partition(2025), seq), summary, payload, at(1))
    }

    #[tokio::test]
    async fn records_round_trip_with_version_guard() {
        let store = SqliteStore::in_memory().await.expect("store");
        let mut r = record(4058, "CLOSED");
        r.archived = true;
        r.archived_at = Some(at(2));
        assert_eq!(store.upsert_record(&r).await.expect("insert"), 1);

        let loaded = store.get_record(&r.key).await.unwrap().expect("row");
        assert_eq!(loaded.status, Status::Closed);
        assert_eq!(loaded.reference.as_deref(), Some("AB-2025-04058"));
        assert_eq!(loaded.archived_at, Some(at(2)));
        assert_eq!(loaded.payload, r.payload);
        assert_eq!(loaded.version, 1);

        assert!(store.upsert_record(&r).await.unwrap_err().is_conflict());

        let mut next = loaded.clone();
        next.scrape_count += 1;
        assert_eq!(store.upsert_record(&next).await.unwrap(), 2);
        let err = store.upsert_record(&next).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 1, found: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn deleting_a_record_is_refused_by_the_database() {
        let store = SqliteStore::in_memory().await.expect("store");
        store.upsert_record(&record(1, "OPEN")).await.unwrap();
        let result = sqlx::query("DELETE FROM records").execute(store.pool()).await;
        assert!(result.is_err());
        assert!(store
            .get_record(&RecordKey::new(Partition(2025), 1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn commit_writes_record_transition_and_attempt_together() {
        let store = SqliteStore::in_memory().await.expect("store");
        let r = record(7, "OPEN");
        let commit = ApplyCommit {
            record: Some(r.clone()),
            transition: Some(StatusTransition {
                key: r.key,
                from_status: Status::Open,
                to_status: Status::Closed,
                changed_at: at(3),
                anomalous: false,
                reactivated: false,
            }),
            attempt: Attempt {
                key: r.key,
                attempted_at: at(3),
                outcome: AttemptOutcome::Found,
                origin: AttemptOrigin::Recheck(harvest_core::Tier::Active),
                detail: None,
            },
        };
        assert_eq!(store.commit(&commit).await.unwrap(), Some(1));
        assert_eq!(store.transitions_for(&r.key).await.unwrap().len(), 1);
        let attempts = store.attempts_for(&r.key).await.unwrap();
        assert_eq!(attempts[0].origin, AttemptOrigin::Recheck(harvest_core::Tier::Active));

        // A conflicting commit leaves no partial history behind.
        let err = store.commit(&commit).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.transitions_for(&r.key).await.unwrap().len(), 1);
        assert_eq!(store.attempts_for(&r.key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tier_predicate_filters_status_partition_and_archival() {
        let store = SqliteStore::in_memory().await.expect("store");
        store.upsert_record(&record(1, "OPEN")).await.unwrap();
        store.upsert_record(&record(2, "CLOSED")).await.unwrap();
        let mut archived = record(3, "OPEN");
        archived.archived = true;
        store.upsert_record(&archived).await.unwrap();

        let open = store
            .query_by_tier_predicate(&TierPredicate::statuses([Status::Open]))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key.sequence_id, 1);

        let other_year = store
            .query_by_tier_predicate(
                &TierPredicate::statuses([Status::Open, Status::Closed])
                    .in_partition(Some(Partition(2024))),
            )
            .await
            .unwrap();
        assert!(other_year.is_empty());
    }

    #[tokio::test]
    async fn frontier_cursor_and_stats_persist_on_disk() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("harvest.db").display());
        {
            let store = SqliteStore::connect(&url).await.expect("store");
            store.advance_frontier(Partition(2025), 820).await.unwrap();
            store.advance_frontier(Partition(2025), 10).await.unwrap();
            store.upsert_record(&record(820, "AWARD")).await.unwrap();
            store
                .set_cursor(&SyncCursor {
                    destination_id: "mirror".into(),
                    last_synced_at: at(4),
                })
                .await
                .unwrap();
            let kept = store
                .set_cursor(&SyncCursor {
                    destination_id: "mirror".into(),
                    last_synced_at: at(2),
                })
                .await
                .unwrap();
            assert_eq!(kept.last_synced_at, at(4));
        }

        let store = SqliteStore::connect(&url).await.expect("reopen");
        assert_eq!(store.frontier(Partition(2025)).await.unwrap(), Some(820));
        assert_eq!(
            store.get_cursor("mirror").await.unwrap().map(|c| c.last_synced_at),
            Some(at(4))
        );
        let stats = store.partition_stats(Partition(2025)).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_status.get(&Status::Award), Some(&1));
        assert_eq!(stats.highest_sequence_id, Some(820));
        assert_eq!(store.partitions().await.unwrap(), vec![Partition(2025)]);
    }
}
