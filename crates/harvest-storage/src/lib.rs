//! Persistent record store contract plus its in-memory and SQLite backends.
//!
//! The trait deliberately has no delete operation: a record row, once
//! written, lives forever. Writes to a single record are guarded by the
//! record's `version` (optimistic concurrency); there is no cross-record
//! transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{Attempt, Partition, Record, RecordKey, Status, StatusTransition, SyncCursor};
use serde::Serialize;
use thiserror::Error;

mod archive;
mod memory;
mod sqlite;

pub use archive::{ArchivedPayload, PayloadArchive};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "harvest-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected {expected}, found {found:?}")]
    VersionConflict {
        key: RecordKey,
        expected: u64,
        found: Option<u64>,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Candidate filter for tier selection. The scheduler applies the exact tier
/// rules on top of what the store returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPredicate {
    pub statuses: Vec<Status>,
    pub partition: Option<Partition>,
    pub include_archived: bool,
}

impl TierPredicate {
    pub fn statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            partition: None,
            include_archived: false,
        }
    }

    pub fn in_partition(mut self, partition: Option<Partition>) -> Self {
        self.partition = partition;
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.statuses.contains(&record.status)
            && self.partition.map_or(true, |p| p == record.key.partition)
            && (self.include_archived || !record.archived)
    }
}

/// Everything one fetch result writes, persisted as a unit when the backend
/// supports it.
#[derive(Debug, Clone)]
pub struct ApplyCommit {
    pub record: Option<Record>,
    pub transition: Option<StatusTransition>,
    pub attempt: Attempt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub partition: Option<Partition>,
    pub total: u64,
    pub archived: u64,
    pub by_status: BTreeMap<Status, u64>,
    pub frontier: Option<u64>,
    pub highest_sequence_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewQueue {
    pub anomalous_transitions: Vec<StatusTransition>,
    pub rejected_attempts: Vec<Attempt>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, key: &RecordKey) -> Result<Option<Record>, StoreError>;

    /// Insert (`record.version == 0`) or update (`record.version` equals the
    /// stored version). Returns the new stored version.
    async fn upsert_record(&self, record: &Record) -> Result<u64, StoreError>;

    async fn append_transition(&self, transition: &StatusTransition) -> Result<(), StoreError>;

    async fn append_attempt(&self, attempt: &Attempt) -> Result<(), StoreError>;

    /// Persist one fetch result. Returns the new record version if a record
    /// was written.
    async fn commit(&self, commit: &ApplyCommit) -> Result<Option<u64>, StoreError> {
        let version = match &commit.record {
            Some(record) => Some(self.upsert_record(record).await?),
            None => None,
        };
        if let Some(transition) = &commit.transition {
            self.append_transition(transition).await?;
        }
        self.append_attempt(&commit.attempt).await?;
        Ok(version)
    }

    async fn query_by_tier_predicate(
        &self,
        predicate: &TierPredicate,
    ) -> Result<Vec<Record>, StoreError>;

    /// Increment the pending-resolution cycle counter of each record.
    async fn bump_pending_cycles(&self, keys: &[RecordKey]) -> Result<(), StoreError>;

    async fn max_sequence_id(&self, partition: Partition) -> Result<Option<u64>, StoreError>;

    async fn frontier(&self, partition: Partition) -> Result<Option<u64>, StoreError>;

    /// Raise the partition frontier to at least `sequence_id`; never lowers it.
    async fn advance_frontier(
        &self,
        partition: Partition,
        sequence_id: u64,
    ) -> Result<u64, StoreError>;

    async fn get_cursor(&self, destination_id: &str) -> Result<Option<SyncCursor>, StoreError>;

    /// Store the cursor unless it would move backwards. Returns what is stored.
    async fn set_cursor(&self, cursor: &SyncCursor) -> Result<SyncCursor, StoreError>;

    /// Records whose `change_stamp()` is after `since` (all when `None`),
    /// oldest change first.
    async fn records_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Transitions with `after < changed_at <= up_to`, oldest first.
    async fn transitions_between(
        &self,
        after: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<StatusTransition>, StoreError>;

    async fn transitions_for(&self, key: &RecordKey) -> Result<Vec<StatusTransition>, StoreError>;

    async fn attempts_for(&self, key: &RecordKey) -> Result<Vec<Attempt>, StoreError>;

    async fn partitions(&self) -> Result<Vec<Partition>, StoreError>;

    async fn partition_stats(&self, partition: Partition) -> Result<PartitionStats, StoreError>;

    async fn review_queue(&self) -> Result<ReviewQueue, StoreError>;
}
