//! Cursor-driven incremental push of local changes to a secondary mirror.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_core::{Record, SyncCursor};
use harvest_storage::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::mirror::{MirrorError, SecondaryMirror};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("reading local store: {0}")]
    Store(#[from] StoreError),
    #[error("destination `{destination_id}` failed after {pushed} upserts: {source}")]
    Destination {
        destination_id: String,
        pushed: u64,
        #[source]
        source: MirrorError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Re-read every record regardless of the stored cursor.
    pub full: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub destination_id: String,
    /// Records pushed (or that would be pushed on a dry run).
    pub pushed_count: u64,
    pub transitions_pushed: u64,
    pub previous_cursor: Option<DateTime<Utc>>,
    pub new_cursor: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

pub struct SyncEngine {
    store: Arc<dyn RecordStore>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Push every record changed since the destination's cursor, then the
    /// status transitions in the same window. The cursor only moves after the
    /// whole batch landed, and only to the newest change stamp in the batch.
    pub async fn sync(
        &self,
        mirror: &dyn SecondaryMirror,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let span = info_span!("sync", destination = mirror.id(), full = options.full, dry_run = options.dry_run);
        self.run(mirror, options).instrument(span).await
    }

    async fn run(
        &self,
        mirror: &dyn SecondaryMirror,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let destination_id = mirror.id().to_string();
        let previous_cursor = self
            .store
            .get_cursor(&destination_id)
            .await?
            .map(|c| c.last_synced_at);
        let read_from = if options.full { None } else { previous_cursor };

        let records = self.store.records_modified_since(read_from).await?;
        let batch_max = records.iter().map(Record::change_stamp).max();
        let new_cursor = batch_max.max(previous_cursor);
        let transitions = match new_cursor {
            Some(up_to) => self.store.transitions_between(read_from, up_to).await?,
            None => Vec::new(),
        };

        let mut result = SyncResult {
            destination_id: destination_id.clone(),
            pushed_count: records.len() as u64,
            transitions_pushed: transitions.len() as u64,
            previous_cursor,
            new_cursor,
            dry_run: options.dry_run,
        };
        if options.dry_run {
            info!(records = result.pushed_count, transitions = result.transitions_pushed, "dry run; nothing pushed");
            return Ok(result);
        }

        let mut pushed = 0u64;
        let destination_error = |pushed: u64, source: MirrorError| {
            warn!(pushed, error = %source, "destination failed; cursor held");
            SyncError::Destination {
                destination_id: destination_id.clone(),
                pushed,
                source,
            }
        };
        for record in &records {
            mirror
                .upsert_record(record)
                .await
                .map_err(|e| destination_error(pushed, e))?;
            pushed += 1;
        }
        for transition in &transitions {
            mirror
                .upsert_transition(transition)
                .await
                .map_err(|e| destination_error(pushed, e))?;
            pushed += 1;
        }

        if let Some(last_synced_at) = new_cursor {
            let stored = self
                .store
                .set_cursor(&SyncCursor {
                    destination_id: destination_id.clone(),
                    last_synced_at,
                })
                .await?;
            result.new_cursor = Some(stored.last_synced_at);
        }
        info!(
            records = result.pushed_count,
            transitions = result.transitions_pushed,
            cursor = ?result.new_cursor,
            "sync complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MemoryMirror;
    use chrono::{Duration, TimeZone};
    use harvest_core::{interpret_payload, Partition, RecordKey, Status, StatusTransition};
    use harvest_storage::MemoryStore;
    use serde_json::json;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    async fn seed(store: &MemoryStore, seq: u64, at: DateTime<Utc>) -> Record {
        let payload = json!({"opportunity": {"statusCode": "OPEN"}});
        let summary = interpret_payload(&payload).unwrap();
        let record = Record::first_seen(RecordKey::new(Partition(2025), seq), summary, payload, at);
        store.upsert_record(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn cursor_advances_to_newest_change_not_wall_clock() {
        let store = Arc::new(MemoryStore::new());
        for (seq, minute) in [(1, 10), (2, 30), (3, 20)] {
            seed(&store, seq, t(minute)).await;
        }
        let mirror = MemoryMirror::new("mirror");
        let engine = SyncEngine::new(store.clone());

        let result = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
        assert_eq!(result.pushed_count, 3);
        assert_eq!(result.previous_cursor, None);
        assert_eq!(result.new_cursor, Some(t(30)));
        let cursor = store.get_cursor("mirror").await.unwrap().unwrap();
        assert_eq!(cursor.last_synced_at, t(30));

        let again = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
        assert_eq!(again.pushed_count, 0);
        assert_eq!(again.new_cursor, Some(t(30)));
    }

    #[tokio::test]
    async fn failure_mid_batch_holds_cursor_and_repush_converges() {
        let store = Arc::new(MemoryStore::new());
        for seq in 1..=4 {
            seed(&store, seq, t(seq as i64)).await;
        }
        let mirror = MemoryMirror::failing_after("mirror", 2);
        let engine = SyncEngine::new(store.clone());

        let err = engine.sync(&mirror, SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Destination { pushed: 2, .. }));
        assert_eq!(store.get_cursor("mirror").await.unwrap(), None);

        mirror.heal().await;
        let result = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
        assert_eq!(result.pushed_count, 4);
        assert_eq!(result.new_cursor, Some(t(4)));
        assert_eq!(mirror.records().await, store.records_modified_since(None).await.unwrap());
    }

    #[tokio::test]
    async fn transitions_follow_their_records() {
        let store = Arc::new(MemoryStore::new());
        let record = seed(&store, 1, t(0)).await;
        let mut closed = store.get_record(&record.key).await.unwrap().unwrap();
        closed.status = Status::Closed;
        closed.last_changed_at = t(5);
        closed.modified_at = t(5);
        store.upsert_record(&closed).await.unwrap();
        store
            .append_transition(&StatusTransition {
                key: record.key,
                from_status: Status::Open,
                to_status: Status::Closed,
                changed_at: t(5),
                anomalous: false,
                reactivated: false,
            })
            .await
            .unwrap();

        let mirror = MemoryMirror::new("mirror");
        let result = SyncEngine::new(store.clone())
            .sync(&mirror, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.transitions_pushed, 1);
        assert_eq!(mirror.transitions().await.len(), 1);
        assert_eq!(mirror.record(&record.key).await.unwrap().status, Status::Closed);
    }

    #[tokio::test]
    async fn dry_run_pushes_nothing_and_keeps_cursor() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, t(1)).await;
        let mirror = MemoryMirror::new("mirror");
        let result = SyncEngine::new(store.clone())
            .sync(&mirror, SyncOptions { dry_run: true, full: false })
            .await
            .unwrap();
        assert_eq!(result.pushed_count, 1);
        assert!(mirror.records().await.is_empty());
        assert_eq!(store.get_cursor("mirror").await.unwrap(), None);
    }

    #[tokio::test]
    async fn full_sync_rereads_everything_without_moving_cursor_back() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, 1, t(1)).await;
        seed(&store, 2, t(2)).await;
        let mirror = MemoryMirror::new("mirror");
        let engine = SyncEngine::new(store.clone());
        engine.sync(&mirror, SyncOptions::default()).await.unwrap();

        let full = engine
            .sync(&mirror, SyncOptions { dry_run: false, full: true })
            .await
            .unwrap();
        assert_eq!(full.pushed_count, 2);
        assert_eq!(full.new_cursor, Some(t(2)));
    }
}
