//! One harvest cycle: per-partition workers (bounded by `max_workers`) run
//! discovery and then the partition's due re-checks, each pacing its own
//! upstream requests.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_core::{AttemptOrigin, Partition, RecordKey, Tier};
use harvest_fetch::RecordFetcher;
use harvest_storage::{PayloadArchive, RecordStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::apply::StateMachine;
use crate::clock::Clock;
use crate::config::HarvestConfig;
use crate::discovery::{DiscoveryConfig, DiscoveryReport, RangeDiscoverer};
use crate::report::{write_reports, CycleSummary, OutcomeTally, PartitionRun};
use crate::scheduler::{TierConfig, TierScheduler};
use crate::throttle::Throttle;

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub max_workers: usize,
    pub request_delay: Duration,
    pub discovery: DiscoveryConfig,
    pub tiers: TierConfig,
    /// Where run reports go; `None` disables them.
    pub reports_dir: Option<PathBuf>,
}

impl CycleSettings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            request_delay: config.request_delay(),
            discovery: config.discovery_config(),
            tiers: config.tiers,
            reports_dir: Some(config.reports_dir.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOptions {
    pub dry_run: bool,
    pub discover: bool,
    pub recheck: bool,
    /// Restrict re-checks to one tier.
    pub tier: Option<Tier>,
    /// Cap on re-checks per partition.
    pub limit: Option<usize>,
    /// Probe from this id instead of the persisted frontier.
    pub start_id: Option<u64>,
}

impl CycleOptions {
    pub fn full(dry_run: bool) -> Self {
        Self {
            dry_run,
            discover: true,
            recheck: true,
            ..Default::default()
        }
    }
}

pub struct CycleRunner {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<dyn RecordFetcher>,
    clock: Arc<dyn Clock>,
    settings: CycleSettings,
    archive: Option<PayloadArchive>,
}

impl CycleRunner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        fetcher: Arc<dyn RecordFetcher>,
        clock: Arc<dyn Clock>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            clock,
            settings,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Option<PayloadArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Discovery only, for the given partitions.
    pub async fn discover(
        &self,
        partitions: &[Partition],
        start_id: Option<u64>,
        dry_run: bool,
    ) -> Result<CycleSummary> {
        let options = CycleOptions {
            dry_run,
            discover: true,
            start_id,
            ..Default::default()
        };
        self.run_cycle(partitions, options).await
    }

    /// Re-check one tier across every known partition.
    pub async fn run_tier(&self, tier: Tier, limit: Option<usize>, dry_run: bool) -> Result<CycleSummary> {
        let options = CycleOptions {
            dry_run,
            recheck: true,
            tier: Some(tier),
            limit,
            ..Default::default()
        };
        self.run_cycle(&[], options).await
    }

    /// Discovery runs on `partitions`; re-checks cover those plus every
    /// partition the store already knows.
    pub async fn run_cycle(&self, partitions: &[Partition], options: CycleOptions) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let requested: BTreeSet<Partition> = partitions.iter().copied().collect();
        let mut targets = requested.clone();
        if options.recheck {
            targets.extend(self.store.partitions().await.context("listing known partitions")?);
        }

        let span = info_span!("cycle", %run_id, dry_run = options.dry_run);
        let runs = self
            .run_workers(&requested, targets, options, started_at)
            .instrument(span)
            .await;

        let finished_at = self.clock.now();
        let mut summary =
            CycleSummary::from_partitions(run_id, started_at, finished_at, options.dry_run, runs);
        if !options.dry_run {
            if let Some(reports_dir) = &self.settings.reports_dir {
                write_reports(reports_dir, &mut summary).await?;
            }
        }
        info!(
            %run_id,
            partitions = summary.partitions.len(),
            checked = summary.totals.checked,
            found = summary.totals.found,
            not_found = summary.totals.not_found,
            transient = summary.totals.transient,
            rejected = summary.totals.rejected,
            created = summary.totals.created,
            status_changes = summary.totals.status_changes,
            archived = summary.totals.archived,
            failed = summary.failed_partitions.len(),
            "cycle finished"
        );
        Ok(summary)
    }

    async fn run_workers(
        &self,
        requested: &BTreeSet<Partition>,
        targets: BTreeSet<Partition>,
        options: CycleOptions,
        cycle_date: DateTime<Utc>,
    ) -> Vec<PartitionRun> {
        let permits = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let mut workers = JoinSet::new();
        for partition in targets {
            let worker = self.worker();
            let permits = permits.clone();
            let discover = options.discover && requested.contains(&partition);
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await;
                worker
                    .run(partition, discover, options, cycle_date)
                    .instrument(info_span!("partition", %partition))
                    .await
            });
        }

        let mut runs = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(run) => runs.push(run),
                Err(err) => error!(error = %err, "partition worker aborted"),
            }
        }
        runs
    }

    fn worker(&self) -> PartitionWorker {
        let machine = StateMachine::new(self.store.clone()).with_archive(self.archive.clone());
        let throttle = Arc::new(Throttle::new(self.settings.request_delay));
        PartitionWorker {
            discoverer: RangeDiscoverer::new(
                machine.clone(),
                self.fetcher.clone(),
                self.clock.clone(),
                throttle.clone(),
                self.settings.discovery,
            ),
            scheduler: TierScheduler::new(self.store.clone(), self.settings.tiers),
            machine,
            fetcher: self.fetcher.clone(),
            clock: self.clock.clone(),
            throttle,
        }
    }
}

struct PartitionWorker {
    discoverer: RangeDiscoverer,
    scheduler: TierScheduler,
    machine: StateMachine,
    fetcher: Arc<dyn RecordFetcher>,
    clock: Arc<dyn Clock>,
    throttle: Arc<Throttle>,
}

impl PartitionWorker {
    async fn run(
        &self,
        partition: Partition,
        discover: bool,
        options: CycleOptions,
        cycle_date: DateTime<Utc>,
    ) -> PartitionRun {
        let mut run = PartitionRun::new(partition);
        if discover {
            match self
                .discoverer
                .discover(partition, options.start_id, options.dry_run)
                .await
            {
                Ok(report) => run.discovery = Some(report),
                Err(err) => {
                    error!(error = %err, "discovery failed");
                    run.error = Some(format!("discovery: {err}"));
                }
            }
        }
        if options.recheck {
            match self
                .scheduler
                .select_due(cycle_date, Some(partition), options.tier, options.dry_run)
                .await
            {
                Ok(plan) => {
                    run.due = plan.due.len();
                    run.skipped_backoff = plan.skipped_backoff;
                    run.tiers = self
                        .recheck(plan.due, run.discovery.as_ref(), options)
                        .await;
                }
                Err(err) => {
                    error!(error = %err, "due-set selection failed");
                    run.error = Some(format!("selection: {err}"));
                }
            }
        }
        run
    }

    async fn recheck(
        &self,
        due: BTreeMap<RecordKey, Tier>,
        discovery: Option<&DiscoveryReport>,
        options: CycleOptions,
    ) -> BTreeMap<Tier, OutcomeTally> {
        let just_probed = |key: &RecordKey| {
            discovery.is_some_and(|d| {
                d.last_probed
                    .is_some_and(|last| (d.start_id..=last).contains(&key.sequence_id))
            })
        };
        let mut tallies: BTreeMap<Tier, OutcomeTally> = BTreeMap::new();
        let limit = options.limit.unwrap_or(usize::MAX);
        for (key, tier) in due.into_iter().filter(|(k, _)| !just_probed(k)).take(limit) {
            self.throttle.wait().await;
            let outcome = self.fetcher.fetch(&key).await;
            let tally = tallies.entry(tier).or_default();
            match self
                .machine
                .apply(key, &outcome, AttemptOrigin::Recheck(tier), self.clock.now(), options.dry_run)
                .await
            {
                Ok(report) => tally.record(&report, options.dry_run),
                Err(err) => {
                    error!(record = %key, %tier, error = %err, "failed to persist re-check");
                    tally.record_store_error();
                }
            }
        }
        tallies
    }
}

/// Cron-driven scheduler running `task` on every tick of `cron`
/// (six-field, seconds first).
pub async fn build_scheduler<F, Fut>(cron: &str, task: F) -> Result<JobScheduler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let task = Arc::new(task);
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let task = task.clone();
        Box::pin(async move {
            info!("scheduled harvest triggered");
            task().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use harvest_core::{interpret_payload, FetchOutcome, Record, Status};
    use harvest_fetch::{registry_payload, BackoffPolicy, ScriptedFetcher};
    use harvest_storage::MemoryStore;

    fn settings(reports_dir: Option<PathBuf>) -> CycleSettings {
        CycleSettings {
            max_workers: 2,
            request_delay: Duration::ZERO,
            discovery: DiscoveryConfig {
                miss_threshold: 3,
                max_probes: 1_000,
                transient_retries: 0,
                retry_backoff: BackoffPolicy::none(),
            },
            tiers: TierConfig::default(),
            reports_dir,
        }
    }

    async fn script(fetcher: &ScriptedFetcher, partition: u32, seq: u64, status: Status) {
        let key = RecordKey::new(Partition(partition), seq);
        fetcher
            .script(key, [FetchOutcome::Found(registry_payload(&key, status, None))])
            .await;
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn cycle_discovers_each_partition_and_writes_reports() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        for seq in 1..=3 {
            script(&fetcher, 2024, seq, Status::Closed).await;
            script(&fetcher, 2025, seq, Status::Open).await;
        }
        let reports = tempfile::tempdir().unwrap();
        let runner = CycleRunner::new(
            store.clone(),
            fetcher.clone(),
            clock(),
            settings(Some(reports.path().to_path_buf())),
        );

        let summary = runner
            .run_cycle(&[Partition(2024), Partition(2025)], CycleOptions::full(false))
            .await
            .unwrap();
        assert_eq!(summary.partitions.len(), 2);
        assert_eq!(summary.discovery.created, 6);
        // Freshly discovered ids are not fetched a second time in the same cycle.
        assert_eq!(summary.tiers.values().map(|t| t.checked).sum::<u64>(), 0);
        assert_eq!(store.record_count().await, 6);

        let dir = PathBuf::from(summary.report_dir.expect("report dir"));
        assert!(dir.join("cycle_summary.json").is_file());
        assert!(dir.join("brief.md").is_file());
    }

    #[tokio::test]
    async fn later_cycle_rechecks_known_records_by_tier() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        script(&fetcher, 2025, 1, Status::Open).await;
        script(&fetcher, 2025, 2, Status::Closed).await;
        let clock = clock();
        let runner = CycleRunner::new(store.clone(), fetcher.clone(), clock.clone(), settings(None));
        runner.discover(&[Partition(2025)], None, false).await.unwrap();

        clock.advance(chrono::Duration::days(7));
        script(&fetcher, 2025, 1, Status::Closed).await;
        let summary = runner.run_cycle(&[], CycleOptions { recheck: true, ..Default::default() }).await.unwrap();
        let tier1 = summary.tiers[&Tier::Active];
        let tier2 = summary.tiers[&Tier::RecentlyClosed];
        assert_eq!(tier1.checked, 1);
        assert_eq!(tier1.status_changes, 1);
        assert_eq!(tier2.checked, 1);
        assert_eq!(summary.totals.checked, 2);
    }

    #[tokio::test]
    async fn run_tier_respects_limit_and_dry_run() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        for seq in 1..=5 {
            script(&fetcher, 2025, seq, Status::Open).await;
        }
        let clock = clock();
        let runner = CycleRunner::new(store.clone(), fetcher.clone(), clock.clone(), settings(None));
        runner.discover(&[Partition(2025)], None, false).await.unwrap();
        clock.advance(chrono::Duration::days(1));

        let summary = runner.run_tier(Tier::Active, Some(2), true).await.unwrap();
        let tally = summary.tiers[&Tier::Active];
        assert_eq!(tally.checked, 2);
        assert_eq!(tally.skipped, 2);
        let record = store
            .get_record(&RecordKey::new(Partition(2025), 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.scrape_count, 1);
    }

    #[tokio::test]
    async fn repeated_tier3_runs_reach_records_held_back_by_backoff() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let clock = clock();
        let key = RecordKey::new(Partition(2025), 7);
        let payload = registry_payload(&key, Status::Evaluation, None);
        let summary = interpret_payload(&payload).unwrap();
        let mut stale = Record::first_seen(
            key,
            summary,
            payload.clone(),
            clock.now() - chrono::Duration::days(45),
        );
        stale.pending_cycles = 1;
        store.upsert_record(&stale).await.unwrap();
        fetcher.script(key, [FetchOutcome::Found(payload)]).await;
        let runner = CycleRunner::new(store.clone(), fetcher.clone(), clock.clone(), settings(None));

        let mut checked = 0;
        for _ in 0..4 {
            let summary = runner.run_tier(Tier::PendingResolution, None, false).await.unwrap();
            checked += summary.totals.checked;
            clock.advance(chrono::Duration::days(1));
        }
        assert_eq!(checked, 2);
        assert_eq!(fetcher.calls().await, vec![key, key]);
        let record = store.get_record(&key).await.unwrap().unwrap();
        assert_eq!(record.pending_cycles, 5);
        assert_eq!(record.scrape_count, 3);
    }
}
