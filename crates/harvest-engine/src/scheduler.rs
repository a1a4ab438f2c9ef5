//! Tier classification and per-cycle due-set selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_core::{Partition, Record, RecordKey, Status, Tier};
use harvest_storage::{RecordStore, StoreError, TierPredicate};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Tier-3 backoff. `cycle_index` is the record's `pending_cycles`: the
/// number of live selections that evaluated Tier 3 (full cycles and
/// `run-tier 3`) since the record entered its current status. Unbounded in
/// age: any four consecutive indices contain an eligible one.
pub fn eligible(age_days: i64, cycle_index: u32) -> bool {
    if age_days < 30 {
        true
    } else if age_days < 90 {
        cycle_index % 2 == 0
    } else {
        cycle_index % 4 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Tier-2 window after a record closed.
    pub recently_closed_days: i64,
    /// Tier-4 window after a record was awarded.
    pub award_window_days: i64,
    /// Minimum spacing between Tier-4 checks.
    pub award_verify_interval_days: i64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            recently_closed_days: 60,
            award_window_days: 90,
            award_verify_interval_days: 30,
        }
    }
}

fn days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_days()
}

/// Unresolved and still worth polling under the Tier-3 backoff.
pub fn is_pending_resolution(record: &Record) -> bool {
    !record.archived
        && matches!(record.status, Status::Closed | Status::Evaluation)
        && !record.outcome_recorded
        && !record.status.is_terminal()
}

/// Whether `record` is due under `tier` on `cycle_date`.
pub fn due_in_tier(record: &Record, tier: Tier, cycle_date: DateTime<Utc>, config: &TierConfig) -> bool {
    if record.archived {
        return false;
    }
    let since_change = days_between(record.last_changed_at, cycle_date);
    match tier {
        Tier::Active => record.status == Status::Open,
        Tier::RecentlyClosed => {
            record.status == Status::Closed && since_change <= config.recently_closed_days
        }
        Tier::PendingResolution => {
            is_pending_resolution(record) && eligible(since_change, record.pending_cycles)
        }
        Tier::AwardVerification => {
            record.status == Status::Award
                && record.scrape_count == 1
                && since_change <= config.award_window_days
                && days_between(record.last_checked_at, cycle_date)
                    >= config.award_verify_interval_days
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuePlan {
    /// Each due record once, attributed to the lowest tier it matched.
    pub due: BTreeMap<RecordKey, Tier>,
    /// Every Tier-3 candidate, eligible this cycle or not.
    pub pending_candidates: Vec<RecordKey>,
    /// Tier-3 candidates held back by the backoff and due nowhere else.
    pub skipped_backoff: usize,
}

impl DuePlan {
    pub fn count_by_tier(&self) -> BTreeMap<Tier, usize> {
        let mut counts = BTreeMap::new();
        for tier in self.due.values() {
            *counts.entry(*tier).or_default() += 1;
        }
        counts
    }
}

/// Pure due-set selection. `only` restricts to a single tier.
pub fn select_due(
    records: &[Record],
    cycle_date: DateTime<Utc>,
    config: &TierConfig,
    only: Option<Tier>,
) -> DuePlan {
    let mut plan = DuePlan::default();
    for record in records {
        if record.archived {
            continue;
        }
        let pending = is_pending_resolution(record);
        if pending {
            plan.pending_candidates.push(record.key);
        }
        let tier = Tier::ALL
            .into_iter()
            .filter(|t| only.map_or(true, |o| o == *t))
            .find(|t| due_in_tier(record, *t, cycle_date, config));
        match tier {
            Some(tier) => {
                plan.due.insert(record.key, tier);
            }
            None if pending && only.map_or(true, |o| o == Tier::PendingResolution) => {
                plan.skipped_backoff += 1;
            }
            None => {}
        }
    }
    plan
}

pub struct TierScheduler {
    store: Arc<dyn RecordStore>,
    config: TierConfig,
}

impl TierScheduler {
    pub fn new(store: Arc<dyn RecordStore>, config: TierConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Select the records due on `cycle_date`. Every non-dry selection that
    /// evaluates Tier 3 advances the cycle index of each Tier-3 candidate.
    pub async fn select_due(
        &self,
        cycle_date: DateTime<Utc>,
        partition: Option<Partition>,
        only: Option<Tier>,
        dry_run: bool,
    ) -> Result<DuePlan, StoreError> {
        let predicate =
            TierPredicate::statuses([Status::Open, Status::Closed, Status::Evaluation, Status::Award])
                .in_partition(partition);
        let records = self.store.query_by_tier_predicate(&predicate).await?;
        let plan = select_due(&records, cycle_date, &self.config, only);

        let evaluates_tier3 = only.map_or(true, |t| t == Tier::PendingResolution);
        if !dry_run && evaluates_tier3 && !plan.pending_candidates.is_empty() {
            self.store.bump_pending_cycles(&plan.pending_candidates).await?;
        }

        let by_tier = plan.count_by_tier();
        info!(
            partition = partition.map(|p| p.0),
            tier = only.map(|t| t.number()),
            candidates = records.len(),
            due = plan.due.len(),
            tier1 = by_tier.get(&Tier::Active).copied().unwrap_or(0),
            tier2 = by_tier.get(&Tier::RecentlyClosed).copied().unwrap_or(0),
            tier3 = by_tier.get(&Tier::PendingResolution).copied().unwrap_or(0),
            tier4 = by_tier.get(&Tier::AwardVerification).copied().unwrap_or(0),
            skipped_backoff = plan.skipped_backoff,
            dry_run,
            "due set selected"
        );
        Ok(plan)
    }
}
