//! Frontier probing over a partition's sparse id space.

use std::sync::Arc;

use harvest_core::{AttemptOrigin, FetchOutcome, Partition, RecordKey};
use harvest_fetch::{BackoffPolicy, RecordFetcher};
use harvest_storage::StoreError;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};

use crate::apply::StateMachine;
use crate::clock::Clock;
use crate::report::OutcomeTally;
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryConfig {
    /// Consecutive confirmed misses that end a run.
    pub miss_threshold: u32,
    /// Hard cap on distinct ids probed in one run.
    pub max_probes: u64,
    /// Extra fetches of the same id after a transient failure.
    pub transient_retries: u32,
    pub retry_backoff: BackoffPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            miss_threshold: 50,
            max_probes: 100_000,
            transient_retries: 3,
            retry_backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MissThreshold,
    MaxProbes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub partition: Partition,
    pub start_id: u64,
    pub highest_hit: Option<u64>,
    pub probes: u64,
    pub last_probed: Option<u64>,
    pub stop_reason: StopReason,
    /// Persisted frontier after the run (unchanged on dry runs).
    pub frontier: Option<u64>,
    pub tally: OutcomeTally,
    pub dry_run: bool,
}

pub struct RangeDiscoverer {
    machine: StateMachine,
    fetcher: Arc<dyn RecordFetcher>,
    clock: Arc<dyn Clock>,
    throttle: Arc<Throttle>,
    config: DiscoveryConfig,
}

impl RangeDiscoverer {
    pub fn new(
        machine: StateMachine,
        fetcher: Arc<dyn RecordFetcher>,
        clock: Arc<dyn Clock>,
        throttle: Arc<Throttle>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            machine,
            fetcher,
            clock,
            throttle,
            config,
        }
    }

    /// First id a fresh run would probe: one past the persisted frontier or
    /// the highest stored id, whichever is larger.
    pub async fn resume_point(&self, partition: Partition) -> Result<u64, StoreError> {
        let store = self.machine.store();
        let frontier = store.frontier(partition).await?;
        let known = store.max_sequence_id(partition).await?;
        Ok(frontier.max(known).map_or(1, |id| id + 1))
    }

    pub async fn discover(
        &self,
        partition: Partition,
        start_id: Option<u64>,
        dry_run: bool,
    ) -> Result<DiscoveryReport, StoreError> {
        let start_id = match start_id {
            Some(id) => id.max(1),
            None => self.resume_point(partition).await?,
        };
        let span = info_span!("discover", %partition, start_id, dry_run);
        self.probe_from(partition, start_id, dry_run).instrument(span).await
    }

    async fn probe_from(
        &self,
        partition: Partition,
        start_id: u64,
        dry_run: bool,
    ) -> Result<DiscoveryReport, StoreError> {
        let mut tally = OutcomeTally::default();
        let mut highest_hit = None;
        let mut consecutive_misses = 0u32;
        let mut probes = 0u64;
        let mut next_id = start_id;

        info!(miss_threshold = self.config.miss_threshold, "discovery started");
        let stop_reason = loop {
            if consecutive_misses >= self.config.miss_threshold {
                break StopReason::MissThreshold;
            }
            if probes >= self.config.max_probes {
                break StopReason::MaxProbes;
            }

            let key = RecordKey::new(partition, next_id);
            probes += 1;
            next_id += 1;

            match self.probe(key, dry_run, &mut tally).await? {
                Probe::Hit => {
                    consecutive_misses = 0;
                    highest_hit = Some(key.sequence_id);
                    if !dry_run {
                        self.machine
                            .store()
                            .advance_frontier(partition, key.sequence_id)
                            .await?;
                    }
                }
                Probe::Miss => consecutive_misses += 1,
                Probe::Unknown => {}
            }
        };

        let frontier = self.machine.store().frontier(partition).await?;
        let report = DiscoveryReport {
            partition,
            start_id,
            highest_hit,
            probes,
            last_probed: (probes > 0).then(|| next_id - 1),
            stop_reason,
            frontier,
            tally,
            dry_run,
        };
        info!(
            highest_hit = report.highest_hit,
            probes = report.probes,
            last_probed = report.last_probed,
            stop_reason = ?report.stop_reason,
            found = tally.found,
            transient = tally.transient,
            "discovery finished"
        );
        Ok(report)
    }

    /// Fetch one id, retrying transient failures, and apply every result.
    /// A result that cannot be persisted ends the run.
    async fn probe(
        &self,
        key: RecordKey,
        dry_run: bool,
        tally: &mut OutcomeTally,
    ) -> Result<Probe, StoreError> {
        let mut retry = 0u32;
        loop {
            self.throttle.wait().await;
            let outcome = self.fetcher.fetch(&key).await;
            let probe = match &outcome {
                FetchOutcome::Found(_) => Probe::Hit,
                FetchOutcome::NotFound => Probe::Miss,
                FetchOutcome::TransientError(_) => Probe::Unknown,
            };
            match self
                .machine
                .apply(key, &outcome, AttemptOrigin::Discovery, self.clock.now(), dry_run)
                .await
            {
                Ok(report) => tally.record(&report, dry_run),
                Err(err) => {
                    error!(record = %key, error = %err, "failed to persist discovery result; stopping");
                    return Err(err);
                }
            }

            let FetchOutcome::TransientError(reason) = outcome else {
                return Ok(probe);
            };
            if retry >= self.config.transient_retries {
                error!(record = %key, %reason, retries = retry, "giving up on id after transient failures");
                return Ok(probe);
            }
            let delay = self.config.retry_backoff.delay_for_attempt(retry as usize);
            warn!(record = %key, %reason, retry, ?delay, "transient failure; retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

enum Probe {
    /// Upstream has the id (including payloads rejected by the schema check).
    Hit,
    Miss,
    /// Retries exhausted; says nothing about existence.
    Unknown,
}
