//! Per-record state machine: turns one fetch result into the record,
//! transition and attempt rows that persist it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_core::{
    interpret_payload, Attempt, AttemptOrigin, AttemptOutcome, FetchOutcome, Record, RecordKey,
    Status, StatusTransition,
};
use harvest_storage::{ApplyCommit, PayloadArchive, RecordStore, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Re-read and re-plan this many times when another worker wrote the same
/// record between our read and our write.
pub const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub key: RecordKey,
    pub outcome: AttemptOutcome,
    pub created: bool,
    pub transition: Option<StatusTransition>,
    /// The record went from live to archived on this fetch.
    pub archived: bool,
    pub reactivated: bool,
    /// The payload gained an award date or award entries.
    pub award_added: bool,
    pub rejected: Option<String>,
}

impl ApplyReport {
    fn new(key: RecordKey, outcome: AttemptOutcome) -> Self {
        Self {
            key,
            outcome,
            created: false,
            transition: None,
            archived: false,
            reactivated: false,
            award_added: false,
            rejected: None,
        }
    }

    pub fn status_changed(&self) -> bool {
        self.transition.is_some()
    }

    pub fn anomalous(&self) -> bool {
        self.transition.as_ref().is_some_and(|t| t.anomalous)
    }
}

#[derive(Debug, Clone)]
pub struct ApplyPlan {
    pub commit: ApplyCommit,
    pub report: ApplyReport,
}

/// Decide what a fetch result changes, given the currently stored record.
/// Pure: no I/O and no clock access.
pub fn plan(
    existing: Option<&Record>,
    key: RecordKey,
    outcome: &FetchOutcome,
    origin: AttemptOrigin,
    now: DateTime<Utc>,
) -> ApplyPlan {
    let attempt = |outcome: AttemptOutcome, detail: Option<String>| Attempt {
        key,
        attempted_at: now,
        outcome,
        origin,
        detail,
    };

    match outcome {
        FetchOutcome::TransientError(reason) => ApplyPlan {
            commit: ApplyCommit {
                record: None,
                transition: None,
                attempt: attempt(AttemptOutcome::TransientError, Some(reason.clone())),
            },
            report: ApplyReport::new(key, AttemptOutcome::TransientError),
        },
        FetchOutcome::NotFound => {
            let mut report = ApplyReport::new(key, AttemptOutcome::NotFound);
            let record = match existing {
                Some(current) if !current.archived => {
                    let mut next = current.clone();
                    next.archived = true;
                    next.archived_at = Some(now);
                    report.archived = true;
                    Some(next)
                }
                _ => None,
            };
            let detail = report.archived.then(|| "archived".to_string());
            ApplyPlan {
                commit: ApplyCommit {
                    record,
                    transition: None,
                    attempt: attempt(AttemptOutcome::NotFound, detail),
                },
                report,
            }
        }
        FetchOutcome::Found(payload) => {
            let summary = match interpret_payload(payload) {
                Ok(summary) => summary,
                Err(err) => {
                    let mut report = ApplyReport::new(key, AttemptOutcome::Rejected);
                    report.rejected = Some(err.to_string());
                    return ApplyPlan {
                        commit: ApplyCommit {
                            record: None,
                            transition: None,
                            attempt: attempt(AttemptOutcome::Rejected, Some(err.to_string())),
                        },
                        report,
                    };
                }
            };

            let mut report = ApplyReport::new(key, AttemptOutcome::Found);
            let Some(current) = existing else {
                report.created = true;
                report.award_added = summary.outcome_recorded;
                return ApplyPlan {
                    commit: ApplyCommit {
                        record: Some(Record::first_seen(key, summary, payload.clone(), now)),
                        transition: None,
                        attempt: attempt(AttemptOutcome::Found, Some("created".to_string())),
                    },
                    report,
                };
            };

            let mut next = current.clone();
            let content_changed = current.payload != *payload
                || current.reference != summary.reference
                || current.title != summary.title
                || current.outcome_recorded != summary.outcome_recorded;
            report.award_added = summary.outcome_recorded && !current.outcome_recorded;
            report.reactivated = current.archived;

            if summary.status != current.status {
                report.transition = Some(StatusTransition {
                    key,
                    from_status: current.status,
                    to_status: summary.status,
                    changed_at: now,
                    anomalous: !Status::is_expected_transition(current.status, summary.status),
                    reactivated: report.reactivated,
                });
                next.status = summary.status;
                next.last_changed_at = now;
                next.pending_cycles = 0;
            }
            if report.reactivated {
                next.archived = false;
                next.archived_at = None;
            }
            if content_changed || report.transition.is_some() || report.reactivated {
                next.modified_at = now;
            }

            next.payload = payload.clone();
            next.reference = summary.reference;
            next.title = summary.title;
            next.outcome_recorded = summary.outcome_recorded;
            next.last_checked_at = now;
            next.scrape_count += 1;

            let detail = report.reactivated.then(|| "reactivated".to_string());
            ApplyPlan {
                commit: ApplyCommit {
                    record: Some(next),
                    transition: report.transition.clone(),
                    attempt: attempt(AttemptOutcome::Found, detail),
                },
                report,
            }
        }
    }
}

/// Applies fetch results to the store with optimistic concurrency.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn RecordStore>,
    archive: Option<PayloadArchive>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Option<PayloadArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Apply one fetch result. With `dry_run` the plan is computed and
    /// reported but nothing is written.
    pub async fn apply(
        &self,
        key: RecordKey,
        outcome: &FetchOutcome,
        origin: AttemptOrigin,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<ApplyReport, StoreError> {
        let mut tries = 0;
        let report = loop {
            tries += 1;
            let existing = self.store.get_record(&key).await?;
            let plan = plan(existing.as_ref(), key, outcome, origin, now);
            if dry_run {
                break plan.report;
            }
            match self.store.commit(&plan.commit).await {
                Ok(_) => break plan.report,
                Err(err) if err.is_conflict() && tries < MAX_CONFLICT_RETRIES => {
                    debug!(record = %key, tries, error = %err, "concurrent write; re-planning");
                }
                Err(err) => return Err(err),
            }
        };

        if !dry_run {
            if let (Some(archive), FetchOutcome::Found(payload)) = (&self.archive, outcome) {
                if let Err(err) = archive.store_payload(&key, payload).await {
                    warn!(record = %key, error = %err, "failed to archive raw payload");
                }
            }
        }

        log_report(&report, origin, dry_run);
        Ok(report)
    }
}

fn log_report(report: &ApplyReport, origin: AttemptOrigin, dry_run: bool) {
    let key = report.key;
    let origin = origin.label();
    if let Some(reason) = &report.rejected {
        error!(record = %key, %origin, reason = %reason, dry_run, "payload rejected; queued for review");
        return;
    }
    if let Some(t) = &report.transition {
        if t.anomalous {
            warn!(
                record = %key, %origin, from = %t.from_status, to = %t.to_status, dry_run,
                "unexpected status transition"
            );
        } else {
            info!(record = %key, %origin, from = %t.from_status, to = %t.to_status, dry_run, "status changed");
        }
    }
    if report.created {
        info!(record = %key, %origin, dry_run, "new record");
    }
    if report.archived {
        info!(record = %key, %origin, dry_run, "record gone upstream; archived");
    }
    if report.reactivated {
        info!(record = %key, %origin, dry_run, "archived record reappeared");
    }
    if report.outcome == AttemptOutcome::TransientError {
        warn!(record = %key, %origin, dry_run, "transient fetch failure");
    }
}
