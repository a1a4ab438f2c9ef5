use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use harvest_core::{AttemptOrigin, FetchOutcome, Partition, RecordKey, Status, Tier};
use harvest_engine::{
    Clock, DiscoveryConfig, ManualClock, MemoryMirror, RangeDiscoverer, SecondaryMirror,
    SqliteMirror, StateMachine, StopReason, SyncEngine, SyncError, SyncOptions, Throttle,
    TierConfig, TierScheduler,
};
use harvest_fetch::{registry_payload, BackoffPolicy, ScriptedFetcher};
use harvest_storage::{MemoryStore, RecordStore, SqliteStore};
use proptest::prelude::*;

const P: Partition = Partition(2025);

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 6, 0, 0).unwrap() + Duration::days(n)
}

fn key(seq: u64) -> RecordKey {
    RecordKey::new(P, seq)
}

fn found(seq: u64, status: Status) -> FetchOutcome {
    FetchOutcome::Found(registry_payload(&key(seq), status, None))
}

const RECHECK: AttemptOrigin = AttemptOrigin::Recheck(Tier::Active);

#[tokio::test]
async fn discovery_halts_exactly_threshold_ids_past_last_hit() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    for seq in 1..=820 {
        fetcher.script(key(seq), [found(seq, Status::Open)]).await;
    }
    let discoverer = RangeDiscoverer::new(
        StateMachine::new(store.clone()),
        fetcher.clone(),
        Arc::new(ManualClock::new(day(0))),
        Arc::new(Throttle::new(StdDuration::ZERO)),
        DiscoveryConfig {
            miss_threshold: 50,
            max_probes: 100_000,
            transient_retries: 0,
            retry_backoff: BackoffPolicy::none(),
        },
    );

    let report = discoverer.discover(P, None, false).await.unwrap();
    assert_eq!(report.highest_hit, Some(820));
    assert_eq!(report.last_probed, Some(870));
    assert_eq!(report.stop_reason, StopReason::MissThreshold);
    assert_eq!(fetcher.calls().await.last(), Some(&key(870)));
    assert_eq!(store.frontier(P).await.unwrap(), Some(820));
    assert_eq!(store.max_sequence_id(P).await.unwrap(), Some(820));
}

#[tokio::test]
async fn record_lifecycle_open_closed_then_archived() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let machine = StateMachine::new(store.clone());
    let r1 = key(1);

    machine
        .apply(r1, &found(1, Status::Open), AttemptOrigin::Discovery, day(0), false)
        .await
        .unwrap();
    machine
        .apply(r1, &found(1, Status::Closed), RECHECK, day(14), false)
        .await
        .unwrap();
    let gone = machine
        .apply(r1, &FetchOutcome::NotFound, RECHECK, day(114), false)
        .await
        .unwrap();
    assert!(gone.archived);

    let record = store.get_record(&r1).await.unwrap().expect("row persists");
    assert!(record.archived);
    assert_eq!(record.archived_at, Some(day(114)));
    assert_eq!(record.status, Status::Closed);
    assert_eq!(record.last_changed_at, day(14));
    assert_eq!(record.first_seen_at, day(0));

    let transitions = store.transitions_for(&r1).await.unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from_status, Status::Open);
    assert_eq!(transitions[0].to_status, Status::Closed);
    assert_eq!(transitions[0].changed_at, day(14));
    assert!(!transitions[0].anomalous);

    let scheduler = TierScheduler::new(store.clone(), TierConfig::default());
    let plan = scheduler.select_due(day(120), None, None, true).await.unwrap();
    assert!(plan.due.is_empty(), "archived records leave every tier");
}

#[tokio::test]
async fn identical_found_applied_twice_is_idempotent_on_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let machine = StateMachine::new(store.clone());
    machine
        .apply(key(5), &found(5, Status::Evaluation), RECHECK, day(0), false)
        .await
        .unwrap();
    machine
        .apply(key(5), &found(5, Status::Award), RECHECK, day(1), false)
        .await
        .unwrap();
    machine
        .apply(key(5), &found(5, Status::Award), RECHECK, day(2), false)
        .await
        .unwrap();

    let record = store.get_record(&key(5)).await.unwrap().unwrap();
    assert_eq!(record.scrape_count, 3);
    assert_eq!(record.status, Status::Award);
    assert_eq!(store.transitions_for(&key(5)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sync_cursor_lands_on_batch_max_not_wall_clock() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let machine = StateMachine::new(store.clone());
    let t0 = day(0);
    machine.apply(key(1), &found(1, Status::Open), RECHECK, t0, false).await.unwrap();
    let mirror = SqliteMirror::in_memory("cloud").await.unwrap();
    let engine = SyncEngine::new(store.clone());
    engine.sync(&mirror, SyncOptions::default()).await.unwrap();

    let t1 = t0 + Duration::hours(3);
    machine.apply(key(2), &found(2, Status::Open), RECHECK, t0 + Duration::hours(1), false).await.unwrap();
    machine.apply(key(3), &found(3, Status::Open), RECHECK, t0 + Duration::hours(2), false).await.unwrap();
    machine.apply(key(1), &found(1, Status::Closed), RECHECK, t1, false).await.unwrap();

    let result = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
    assert_eq!(result.previous_cursor, Some(t0));
    assert_eq!(result.pushed_count, 3);
    assert_eq!(result.transitions_pushed, 1);
    assert_eq!(result.new_cursor, Some(t1));
    assert_ne!(result.new_cursor, Some(Utc::now()));
    assert_eq!(store.get_cursor("cloud").await.unwrap().unwrap().last_synced_at, t1);
    assert_eq!(mirror.record_count().await.unwrap(), 3);
    assert_eq!(mirror.fetch_record(&key(1)).await.unwrap().unwrap().status, "CLOSED");
}

#[tokio::test]
async fn archival_reaches_the_mirror() {
    let store = Arc::new(MemoryStore::new());
    let machine = StateMachine::new(store.clone());
    machine.apply(key(1), &found(1, Status::Closed), RECHECK, day(0), false).await.unwrap();
    let mirror = MemoryMirror::new("mirror");
    let engine = SyncEngine::new(store.clone());
    engine.sync(&mirror, SyncOptions::default()).await.unwrap();

    machine.apply(key(1), &FetchOutcome::NotFound, RECHECK, day(30), false).await.unwrap();
    let result = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
    assert_eq!(result.pushed_count, 1);
    assert_eq!(result.new_cursor, Some(day(30)));
    assert!(mirror.record(&key(1)).await.unwrap().archived);
}

#[tokio::test]
async fn partial_destination_failure_holds_cursor_until_a_clean_run() {
    let store = Arc::new(MemoryStore::new());
    let machine = StateMachine::new(store.clone());
    for seq in 1..=3 {
        machine
            .apply(key(seq), &found(seq, Status::Open), RECHECK, day(seq as i64), false)
            .await
            .unwrap();
    }
    let mirror = MemoryMirror::failing_after("mirror", 1);
    let engine = SyncEngine::new(store.clone());

    let err = engine.sync(&mirror, SyncOptions::default()).await.unwrap_err();
    assert!(matches!(err, SyncError::Destination { pushed: 1, .. }));
    assert!(store.get_cursor("mirror").await.unwrap().is_none());

    mirror.heal().await;
    let result = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
    assert_eq!(result.pushed_count, 3);
    assert_eq!(result.new_cursor, Some(day(3)));
}

#[tokio::test]
async fn repeated_syncs_keep_cursor_monotonic_and_mirror_converged() {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(day(0));
    let machine = StateMachine::new(store.clone());
    let mirror = MemoryMirror::new("mirror");
    let engine = SyncEngine::new(store.clone());
    let statuses = [Status::Open, Status::Closed, Status::Evaluation, Status::Award];

    let mut last_cursor = None;
    for round in 0..8u64 {
        clock.advance(Duration::hours(5));
        let seq = round % 3 + 1;
        let status = statuses[(round as usize / 3) % statuses.len()];
        machine
            .apply(key(seq), &found(seq, status), RECHECK, clock.now(), false)
            .await
            .unwrap();
        if round % 4 == 3 {
            machine
                .apply(key(seq), &FetchOutcome::NotFound, RECHECK, clock.now(), false)
                .await
                .unwrap();
        }

        let result = engine.sync(&mirror, SyncOptions::default()).await.unwrap();
        assert!(result.new_cursor >= last_cursor);
        last_cursor = result.new_cursor;

        for record in store.records_modified_since(None).await.unwrap() {
            let mirrored = mirror.record(&record.key).await.expect("synced");
            assert_eq!(mirrored.status, record.status);
            assert_eq!(mirrored.payload, record.payload);
            assert_eq!(mirrored.archived, record.archived);
            assert_eq!(mirrored.archived_at, record.archived_at);
        }
    }
    assert_eq!(mirror.id(), "mirror");
}

#[tokio::test]
async fn concurrent_workers_never_lose_an_update() {
    let store = Arc::new(MemoryStore::new());
    let machine = StateMachine::new(store.clone());
    machine
        .apply(key(1), &found(1, Status::Open), AttemptOrigin::Discovery, day(0), false)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for worker in 0..2i64 {
        let machine = machine.clone();
        tasks.push(tokio::spawn(async move {
            let mut written = 0u64;
            for i in 0..20i64 {
                let at = day(1) + Duration::minutes(worker * 100 + i);
                if machine.apply(key(1), &found(1, Status::Open), RECHECK, at, false).await.is_ok() {
                    written += 1;
                }
                tokio::task::yield_now().await;
            }
            written
        }));
    }
    let mut written = 1;
    for task in tasks {
        written += task.await.unwrap();
    }
    let record = store.get_record(&key(1)).await.unwrap().unwrap();
    assert_eq!(record.scrape_count, written);
}

fn outcome_strategy() -> impl Strategy<Value = FetchOutcome> {
    prop_oneof![
        Just(found(9, Status::Open)),
        Just(found(9, Status::Closed)),
        Just(found(9, Status::Award)),
        Just(FetchOutcome::NotFound),
        Just(FetchOutcome::TransientError("timeout".to_string())),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn rows_survive_any_outcome_sequence(outcomes in prop::collection::vec(outcome_strategy(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let machine = StateMachine::new(store.clone());
            let mut created = false;
            let mut last_count = 0;
            for (i, outcome) in outcomes.iter().enumerate() {
                machine
                    .apply(key(9), outcome, RECHECK, day(i as i64), false)
                    .await
                    .unwrap();
                let record = store.get_record(&key(9)).await.unwrap();
                created |= record.is_some();
                if created {
                    let record = record.expect("a created row never disappears");
                    assert!(record.scrape_count >= last_count);
                    last_count = record.scrape_count;
                }
            }
        });
    }
}
