//! Run summaries and the on-disk report layout
//! (`<reports_dir>/<run_id>/cycle_summary.json` + `brief.md`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_core::{AttemptOutcome, Partition, Tier};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::apply::ApplyReport;
use crate::discovery::DiscoveryReport;
use crate::sync::SyncResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeTally {
    pub checked: u64,
    pub found: u64,
    pub not_found: u64,
    pub transient: u64,
    pub rejected: u64,
    pub created: u64,
    pub status_changes: u64,
    pub anomalies: u64,
    pub awards_added: u64,
    pub archived: u64,
    pub reactivated: u64,
    /// Results computed but not written (dry run).
    pub skipped: u64,
    pub store_errors: u64,
}

impl OutcomeTally {
    pub fn record(&mut self, report: &ApplyReport, dry_run: bool) {
        self.checked += 1;
        match report.outcome {
            AttemptOutcome::Found => self.found += 1,
            AttemptOutcome::NotFound => self.not_found += 1,
            AttemptOutcome::TransientError => self.transient += 1,
            AttemptOutcome::Rejected => self.rejected += 1,
        }
        self.created += u64::from(report.created);
        self.status_changes += u64::from(report.status_changed());
        self.anomalies += u64::from(report.anomalous());
        self.awards_added += u64::from(report.award_added);
        self.archived += u64::from(report.archived);
        self.reactivated += u64::from(report.reactivated);
        self.skipped += u64::from(dry_run);
    }

    pub fn record_store_error(&mut self) {
        self.checked += 1;
        self.store_errors += 1;
    }

    pub fn merge(&mut self, other: &OutcomeTally) {
        self.checked += other.checked;
        self.found += other.found;
        self.not_found += other.not_found;
        self.transient += other.transient;
        self.rejected += other.rejected;
        self.created += other.created;
        self.status_changes += other.status_changes;
        self.anomalies += other.anomalies;
        self.awards_added += other.awards_added;
        self.archived += other.archived;
        self.reactivated += other.reactivated;
        self.skipped += other.skipped;
        self.store_errors += other.store_errors;
    }

    fn markdown_line(&self) -> String {
        format!(
            "checked {} | found {} | not found {} | transient {} | rejected {} | new {} | status changes {} (anomalous {}) | awards {} | archived {} | reactivated {}",
            self.checked,
            self.found,
            self.not_found,
            self.transient,
            self.rejected,
            self.created,
            self.status_changes,
            self.anomalies,
            self.awards_added,
            self.archived,
            self.reactivated,
        )
    }
}

/// One partition worker's share of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRun {
    pub partition: Partition,
    pub discovery: Option<DiscoveryReport>,
    pub due: usize,
    pub skipped_backoff: usize,
    pub tiers: BTreeMap<Tier, OutcomeTally>,
    pub error: Option<String>,
}

impl PartitionRun {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            discovery: None,
            due: 0,
            skipped_backoff: 0,
            tiers: BTreeMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub partitions: Vec<PartitionRun>,
    pub discovery: OutcomeTally,
    pub tiers: BTreeMap<Tier, OutcomeTally>,
    pub totals: OutcomeTally,
    pub failed_partitions: Vec<Partition>,
    pub sync: Option<SyncResult>,
    pub report_dir: Option<String>,
}

impl CycleSummary {
    pub fn from_partitions(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        dry_run: bool,
        mut partitions: Vec<PartitionRun>,
    ) -> Self {
        partitions.sort_by_key(|p| p.partition);
        let mut discovery = OutcomeTally::default();
        let mut tiers: BTreeMap<Tier, OutcomeTally> = BTreeMap::new();
        let mut failed_partitions = Vec::new();
        for run in &partitions {
            if let Some(report) = &run.discovery {
                discovery.merge(&report.tally);
            }
            for (tier, tally) in &run.tiers {
                tiers.entry(*tier).or_default().merge(tally);
            }
            if run.error.is_some() {
                failed_partitions.push(run.partition);
            }
        }
        let mut totals = discovery;
        for tally in tiers.values() {
            totals.merge(tally);
        }
        Self {
            run_id,
            started_at,
            finished_at,
            dry_run,
            partitions,
            discovery,
            tiers,
            totals,
            failed_partitions,
            sync: None,
            report_dir: None,
        }
    }
}

pub fn brief_markdown(summary: &CycleSummary) -> String {
    let mut lines = vec![
        "# Registry Harvest Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Dry run: {}", summary.dry_run),
        format!("- Totals: {}", summary.totals.markdown_line()),
        String::new(),
        "## Discovery".to_string(),
    ];
    for run in &summary.partitions {
        match &run.discovery {
            Some(d) => lines.push(format!(
                "- {}: probed {} from {} (highest hit {}, stopped on {:?}); {}",
                run.partition,
                d.probes,
                d.start_id,
                d.highest_hit.map_or_else(|| "none".to_string(), |id| id.to_string()),
                d.stop_reason,
                d.tally.markdown_line(),
            )),
            None => lines.push(format!("- {}: not run", run.partition)),
        }
    }
    lines.push(String::new());
    lines.push("## Re-checks by tier".to_string());
    for tier in Tier::ALL {
        let tally = summary.tiers.get(&tier).copied().unwrap_or_default();
        lines.push(format!("- {tier}: {}", tally.markdown_line()));
    }
    if !summary.failed_partitions.is_empty() {
        lines.push(String::new());
        lines.push("## Failed partitions".to_string());
        for run in summary.partitions.iter().filter(|r| r.error.is_some()) {
            lines.push(format!(
                "- {}: {}",
                run.partition,
                run.error.as_deref().unwrap_or_default()
            ));
        }
    }
    if let Some(sync) = &summary.sync {
        lines.push(String::new());
        lines.push("## Sync".to_string());
        lines.push(format!(
            "- {}: {} records, {} transitions, cursor {}",
            sync.destination_id,
            sync.pushed_count,
            sync.transitions_pushed,
            sync.new_cursor
                .map_or_else(|| "unset".to_string(), |c| c.to_rfc3339()),
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write `cycle_summary.json` and `brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &mut CycleSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    summary.report_dir = Some(dir.display().to_string());

    let json = serde_json::to_vec_pretty(summary).context("serializing cycle summary")?;
    fs::write(dir.join("cycle_summary.json"), json)
        .await
        .context("writing cycle_summary.json")?;
    fs::write(dir.join("brief.md"), brief_markdown(summary))
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

/// Short digest of the most recent `runs` reports, newest first.
pub fn report_recent_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join("cycle_summary.json");
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: CycleSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by_key(|s| std::cmp::Reverse(s.started_at));

    let mut lines = vec!["# Recent Harvest Runs".to_string(), String::new()];
    for summary in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.started_at));
        lines.push(format!("- {}", summary.totals.markdown_line()));
        if !summary.failed_partitions.is_empty() {
            let failed: Vec<String> =
                summary.failed_partitions.iter().map(|p| p.to_string()).collect();
            lines.push(format!("- failed partitions: {}", failed.join(", ")));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::{RecordKey, Status, StatusTransition};

    fn report(outcome: AttemptOutcome) -> ApplyReport {
        ApplyReport {
            key: RecordKey::new(Partition(2025), 1),
            outcome,
            created: false,
            transition: None,
            archived: false,
            reactivated: false,
            award_added: false,
            rejected: None,
        }
    }

    fn summary() -> CycleSummary {
        let at = Utc.with_ymd_and_hms(2025, 3, 3, 6, 0, 0).unwrap();
        let mut run = PartitionRun::new(Partition(2025));
        let mut tally = OutcomeTally::default();
        let mut changed = report(AttemptOutcome::Found);
        changed.transition = Some(StatusTransition {
            key: changed.key,
            from_status: Status::Open,
            to_status: Status::Closed,
            changed_at: at,
            anomalous: false,
            reactivated: false,
        });
        tally.record(&changed, false);
        tally.record(&report(AttemptOutcome::NotFound), false);
        run.tiers.insert(Tier::Active, tally);

        let mut broken = PartitionRun::new(Partition(2024));
        broken.error = Some("database is locked".into());
        CycleSummary::from_partitions(Uuid::new_v4(), at, at, false, vec![run, broken])
    }

    #[test]
    fn tally_counts_each_outcome_kind() {
        let mut tally = OutcomeTally::default();
        tally.record(&report(AttemptOutcome::Found), true);
        tally.record(&report(AttemptOutcome::TransientError), true);
        tally.record(&report(AttemptOutcome::Rejected), false);
        tally.record_store_error();
        assert_eq!(tally.checked, 4);
        assert_eq!(tally.found, 1);
        assert_eq!(tally.transient, 1);
        assert_eq!(tally.rejected, 1);
        assert_eq!(tally.skipped, 2);
        assert_eq!(tally.store_errors, 1);
    }

    #[test]
    fn summary_rolls_up_tiers_and_failures() {
        let summary = summary();
        assert_eq!(summary.partitions[0].partition, Partition(2024));
        assert_eq!(summary.failed_partitions, vec![Partition(2024)]);
        assert_eq!(summary.totals.checked, 2);
        assert_eq!(summary.tiers[&Tier::Active].status_changes, 1);

        let brief = brief_markdown(&summary);
        assert!(brief.contains("# Registry Harvest Brief"));
        assert!(brief.contains("database is locked"));
    }

    #[tokio::test]
    async fn reports_land_under_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = summary();
        let run_dir = write_reports(dir.path(), &mut summary).await.unwrap();
        assert!(run_dir.ends_with(summary.run_id.to_string()));
        assert!(run_dir.join("cycle_summary.json").is_file());
        assert!(run_dir.join("brief.md").is_file());

        let recent = report_recent_markdown(dir.path(), 5).unwrap();
        assert!(recent.contains(&summary.run_id.to_string()));
        assert!(recent.contains("failed partitions: 2024"));
    }
}
