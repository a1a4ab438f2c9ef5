use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    Attempt, AttemptOutcome, Partition, Record, RecordKey, StatusTransition, SyncCursor,
};
use tokio::sync::Mutex;

use crate::{ApplyCommit, PartitionStats, RecordStore, ReviewQueue, StoreError, TierPredicate};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordKey, Record>,
    transitions: Vec<StatusTransition>,
    attempts: Vec<Attempt>,
    frontiers: BTreeMap<Partition, u64>,
    cursors: BTreeMap<String, SyncCursor>,
}

impl Inner {
    fn write_record(&mut self, record: &Record) -> Result<u64, StoreError> {
        let found = self.records.get(&record.key).map(|r| r.version);
        let expected = record.version;
        let matches = match found {
            None => expected == 0,
            Some(current) => expected != 0 && current == expected,
        };
        if !matches {
            return Err(StoreError::VersionConflict {
                key: record.key,
                expected,
                found,
            });
        }
        let mut stored = record.clone();
        stored.version = expected + 1;
        self.records.insert(record.key, stored);
        Ok(expected + 1)
    }
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn all_attempts(&self) -> Vec<Attempt> {
        self.inner.lock().await.attempts.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_record(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.lock().await.records.get(key).cloned())
    }

    async fn upsert_record(&self, record: &Record) -> Result<u64, StoreError> {
        self.inner.lock().await.write_record(record)
    }

    async fn append_transition(&self, transition: &StatusTransition) -> Result<(), StoreError> {
        self.inner.lock().await.transitions.push(transition.clone());
        Ok(())
    }

    async fn append_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        self.inner.lock().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn commit(&self, commit: &ApplyCommit) -> Result<Option<u64>, StoreError> {
        let mut inner = self.inner.lock().await;
        let version = match &commit.record {
            Some(record) => Some(inner.write_record(record)?),
            None => None,
        };
        if let Some(transition) = &commit.transition {
            inner.transitions.push(transition.clone());
        }
        inner.attempts.push(commit.attempt.clone());
        Ok(version)
    }

    async fn query_by_tier_predicate(
        &self,
        predicate: &TierPredicate,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|r| predicate.matches(r))
            .cloned()
            .collect())
    }

    async fn bump_pending_cycles(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for key in keys {
            if let Some(record) = inner.records.get_mut(key) {
                record.pending_cycles = record.pending_cycles.saturating_add(1);
                record.version += 1;
            }
        }
        Ok(())
    }

    async fn max_sequence_id(&self, partition: Partition) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .keys()
            .filter(|k| k.partition == partition)
            .map(|k| k.sequence_id)
            .max())
    }

    async fn frontier(&self, partition: Partition) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().await.frontiers.get(&partition).copied())
    }

    async fn advance_frontier(
        &self,
        partition: Partition,
        sequence_id: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.frontiers.entry(partition).or_insert(sequence_id);
        *entry = (*entry).max(sequence_id);
        Ok(*entry)
    }

    async fn get_cursor(&self, destination_id: &str) -> Result<Option<SyncCursor>, StoreError> {
        Ok(self.inner.lock().await.cursors.get(destination_id).cloned())
    }

    async fn set_cursor(&self, cursor: &SyncCursor) -> Result<SyncCursor, StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .cursors
            .entry(cursor.destination_id.clone())
            .or_insert_with(|| cursor.clone());
        if cursor.last_synced_at > stored.last_synced_at {
            stored.last_synced_at = cursor.last_synced_at;
        }
        Ok(stored.clone())
    }

    async fn records_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<Record> = inner
            .records
            .values()
            .filter(|r| since.map_or(true, |s| r.change_stamp() > s))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.change_stamp(), r.key));
        Ok(records)
    }

    async fn transitions_between(
        &self,
        after: Option<DateTime<Utc>>,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<StatusTransition>, StoreError> {
        let inner = self.inner.lock().await;
        let mut transitions: Vec<StatusTransition> = inner
            .transitions
            .iter()
            .filter(|t| after.map_or(true, |a| t.changed_at > a) && t.changed_at <= up_to)
            .cloned()
            .collect();
        transitions.sort_by_key(|t| (t.changed_at, t.key));
        Ok(transitions)
    }

    async fn transitions_for(&self, key: &RecordKey) -> Result<Vec<StatusTransition>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transitions
            .iter()
            .filter(|t| &t.key == key)
            .cloned()
            .collect())
    }

    async fn attempts_for(&self, key: &RecordKey) -> Result<Vec<Attempt>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| &a.key == key)
            .cloned()
            .collect())
    }

    async fn partitions(&self) -> Result<Vec<Partition>, StoreError> {
        let inner = self.inner.lock().await;
        let mut partitions: Vec<Partition> = inner
            .records
            .keys()
            .map(|k| k.partition)
            .chain(inner.frontiers.keys().copied())
            .collect();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    async fn partition_stats(&self, partition: Partition) -> Result<PartitionStats, StoreError> {
        let inner = self.inner.lock().await;
        let mut stats = PartitionStats {
            partition: Some(partition),
            frontier: inner.frontiers.get(&partition).copied(),
            ..Default::default()
        };
        for record in inner.records.values().filter(|r| r.key.partition == partition) {
            stats.total += 1;
            if record.archived {
                stats.archived += 1;
            }
            *stats.by_status.entry(record.status).or_default() += 1;
            stats.highest_sequence_id = stats.highest_sequence_id.max(Some(record.key.sequence_id));
        }
        Ok(stats)
    }

    async fn review_queue(&self) -> Result<ReviewQueue, StoreError> {
        let inner = self.inner.lock().await;
        Ok(ReviewQueue {
            anomalous_transitions: inner
                .transitions
                .iter()
                .filter(|t| t.anomalous)
                .cloned()
                .collect(),
            rejected_attempts: inner
                .attempts
                .iter()
                .filter(|a| a.outcome == AttemptOutcome::Rejected)
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::{interpret_payload, AttemptOrigin, Status};
    use serde_json::json;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).single().unwrap()
    }

    fn record(seq: u64, status: &str, day: u32) -> Record {
        let payload = json!({"opportunity": {"statusCode": status}});
        let summary = interpret_payload(&payload).expect("payload");
        Record::first_seen(RecordKey::new(Partition(2025), seq), summary, payload, at(day))
    }

    #[tokio::test]
    async fn stale_versions_are_rejected() {
        let store = MemoryStore::new();
        let mut r = record(1, "OPEN", 1);
        assert_eq!(store.upsert_record(&r).await.expect("insert"), 1);

        let err = store.upsert_record(&r).await.expect_err("duplicate insert");
        assert!(err.is_conflict());

        r.version = 1;
        r.status = Status::Closed;
        assert_eq!(store.upsert_record(&r).await.expect("update"), 2);
        let stale = store.upsert_record(&r).await.expect_err("stale update");
        assert!(matches!(
            stale,
            StoreError::VersionConflict { expected: 1, found: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn frontier_and_cursor_never_move_backwards() {
        let store = MemoryStore::new();
        let p = Partition(2024);
        assert_eq!(store.advance_frontier(p, 10).await.unwrap(), 10);
        assert_eq!(store.advance_frontier(p, 7).await.unwrap(), 10);
        assert_eq!(store.frontier(p).await.unwrap(), Some(10));

        let late = SyncCursor {
            destination_id: "mirror".into(),
            last_synced_at: at(5),
        };
        let early = SyncCursor {
            last_synced_at: at(2),
            ..late.clone()
        };
        store.set_cursor(&late).await.unwrap();
        let stored = store.set_cursor(&early).await.unwrap();
        assert_eq!(stored.last_synced_at, at(5));
    }

    #[tokio::test]
    async fn modified_since_is_exclusive_and_ordered() {
        let store = MemoryStore::new();
        for (seq, day) in [(1, 3), (2, 1), (3, 2)] {
            store.upsert_record(&record(seq, "OPEN", day)).await.unwrap();
        }
        let all = store.records_modified_since(None).await.unwrap();
        let order: Vec<u64> = all.iter().map(|r| r.key.sequence_id).collect();
        assert_eq!(order, vec![2, 3, 1]);

        let after = store.records_modified_since(Some(at(2))).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].key.sequence_id, 1);
    }

    #[tokio::test]
    async fn review_queue_collects_anomalies_and_rejections() {
        let store = MemoryStore::new();
        let key = RecordKey::new(Partition(2025), 9);
        store
            .append_transition(&StatusTransition {
                key,
                from_status: Status::Award,
                to_status: Status::Open,
                changed_at: at(4),
                anomalous: true,
                reactivated: false,
            })
            .await
            .unwrap();
        store
            .append_attempt(&Attempt {
                key,
                attempted_at: at(4),
                outcome: AttemptOutcome::Rejected,
                origin: AttemptOrigin::Discovery,
                detail: Some("payload has no `opportunity` object".into()),
            })
            .await
            .unwrap();
        let queue = store.review_queue().await.unwrap();
        assert_eq!(queue.anomalous_transitions.len(), 1);
        assert_eq!(queue.rejected_attempts.len(), 1);
    }
}
