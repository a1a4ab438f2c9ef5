//! Core domain model for the procurement registry harvester.
//!
//! Records are identified by `(partition, sequence_id)`; a partition is one
//! calendar year of the upstream registry. Everything here is plain data plus
//! the pure rules (status parsing, transition table, payload interpretation)
//! that the engine applies on top of a store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "harvest-core";

/// An independent sub-range of the upstream id space with its own frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partition(pub u32);

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Partition {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub partition: Partition,
    pub sequence_id: u64,
}

impl RecordKey {
    pub fn new(partition: Partition, sequence_id: u64) -> Self {
        Self {
            partition,
            sequence_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:05}", self.partition, self.sequence_id)
    }
}

/// Posting status as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Open,
    Closed,
    Cancelled,
    Evaluation,
    Award,
    Unawardable,
    Selection,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Open,
        Status::Closed,
        Status::Cancelled,
        Status::Evaluation,
        Status::Award,
        Status::Unawardable,
        Status::Selection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "OPEN",
            Status::Closed => "CLOSED",
            Status::Cancelled => "CANCELLED",
            Status::Evaluation => "EVALUATION",
            Status::Award => "AWARD",
            Status::Unawardable => "UNAWARDABLE",
            Status::Selection => "SELECTION",
        }
    }

    /// Statuses after which pending-resolution polling stops.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Award | Status::Cancelled | Status::Unawardable)
    }

    /// Successors the registry is expected to move a posting to.
    pub fn expected_successors(self) -> &'static [Status] {
        use Status::*;
        match self {
            Open => &[Closed, Cancelled],
            Closed | Cancelled => &[Evaluation, Award, Cancelled, Unawardable, Selection],
            Evaluation => &[Award, Cancelled, Unawardable, Selection],
            Selection => &[Award, Cancelled, Unawardable],
            Award | Unawardable => &[],
        }
    }

    pub fn is_expected_transition(from: Status, to: Status) -> bool {
        from.expected_successors().contains(&to)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status code `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Payload did not have the shape the harvester relies on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no `opportunity` object")]
    MissingOpportunity,
    #[error("payload has no `opportunity.statusCode` string")]
    MissingStatus,
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
}

/// The fields the engine derives from an upstream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSummary {
    pub status: Status,
    pub reference: Option<String>,
    pub title: Option<String>,
    /// `awardedOnUtc` is set or the payload lists at least one award.
    pub outcome_recorded: bool,
}

pub fn interpret_payload(payload: &JsonValue) -> Result<PayloadSummary, SchemaError> {
    let root = payload.as_object().ok_or(SchemaError::NotAnObject)?;
    let opportunity = root
        .get("opportunity")
        .and_then(JsonValue::as_object)
        .ok_or(SchemaError::MissingOpportunity)?;
    let status = opportunity
        .get("statusCode")
        .and_then(JsonValue::as_str)
        .ok_or(SchemaError::MissingStatus)?
        .parse::<Status>()?;

    let text = |key: &str| {
        opportunity
            .get(key)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let awarded_on = opportunity
        .get("awardedOnUtc")
        .is_some_and(|v| !v.is_null());
    let has_awards = root
        .get("awards")
        .and_then(JsonValue::as_array)
        .is_some_and(|awards| !awards.is_empty());

    Ok(PayloadSummary {
        status,
        reference: text("referenceNumber"),
        title: text("shortTitle").or_else(|| text("title")),
        outcome_recorded: awarded_on || has_awards,
    })
}

/// Permanent local copy of one registry posting. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub status: Status,
    pub payload: JsonValue,
    pub reference: Option<String>,
    pub title: Option<String>,
    pub outcome_recorded: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    /// Time of the last observed status change (creation counts).
    pub last_changed_at: DateTime<Utc>,
    /// Time of the last change to status, payload content or archival flags.
    pub modified_at: DateTime<Utc>,
    pub scrape_count: u64,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    /// Scheduler invocations since the record entered its current status.
    pub pending_cycles: u32,
    pub version: u64,
}

impl Record {
    pub fn first_seen(
        key: RecordKey,
        summary: PayloadSummary,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            status: summary.status,
            payload,
            reference: summary.reference,
            title: summary.title,
            outcome_recorded: summary.outcome_recorded,
            first_seen_at: now,
            last_checked_at: now,
            last_changed_at: now,
            modified_at: now,
            scrape_count: 1,
            archived: false,
            archived_at: None,
            pending_cycles: 0,
            version: 0,
        }
    }

    /// Latest instant anything a downstream mirror cares about changed.
    pub fn change_stamp(&self) -> DateTime<Utc> {
        match self.archived_at {
            Some(archived_at) if archived_at > self.modified_at => archived_at,
            _ => self.modified_at,
        }
    }
}

/// Append-only status history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub key: RecordKey,
    pub from_status: Status,
    pub to_status: Status,
    pub changed_at: DateTime<Utc>,
    /// Not in the expected transition table; kept for manual review.
    pub anomalous: bool,
    /// Observed on the fetch that brought an archived record back.
    pub reactivated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Found,
    NotFound,
    TransientError,
    /// Upstream answered but the payload violated the expected schema.
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Found => "found",
            AttemptOutcome::NotFound => "not_found",
            AttemptOutcome::TransientError => "transient_error",
            AttemptOutcome::Rejected => "rejected",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "found" => Ok(AttemptOutcome::Found),
            "not_found" => Ok(AttemptOutcome::NotFound),
            "transient_error" => Ok(AttemptOutcome::TransientError),
            "rejected" => Ok(AttemptOutcome::Rejected),
            other => Err(format!("unknown attempt outcome `{other}`")),
        }
    }
}

/// Polling tier a known record is re-checked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Active,
    RecentlyClosed,
    PendingResolution,
    AwardVerification,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::Active,
        Tier::RecentlyClosed,
        Tier::PendingResolution,
        Tier::AwardVerification,
    ];

    pub fn number(self) -> u8 {
        match self {
            Tier::Active => 1,
            Tier::RecentlyClosed => 2,
            Tier::PendingResolution => 3,
            Tier::AwardVerification => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Tier> {
        Tier::ALL.into_iter().find(|t| t.number() == n)
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::Active => "active",
            Tier::RecentlyClosed => "recently-closed",
            Tier::PendingResolution => "pending-resolution",
            Tier::AwardVerification => "award-verification",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {} ({})", self.number(), self.label())
    }
}

/// Why a fetch was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tier")]
pub enum AttemptOrigin {
    Discovery,
    Recheck(Tier),
}

impl AttemptOrigin {
    pub fn label(self) -> String {
        match self {
            AttemptOrigin::Discovery => "discovery".to_string(),
            AttemptOrigin::Recheck(tier) => format!("tier{}", tier.number()),
        }
    }

    pub fn parse_label(label: &str) -> Option<Self> {
        if label == "discovery" {
            return Some(AttemptOrigin::Discovery);
        }
        label
            .strip_prefix("tier")
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(Tier::from_number)
            .map(AttemptOrigin::Recheck)
    }
}

/// Write-once fetch audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub key: RecordKey,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub origin: AttemptOrigin,
    pub detail: Option<String>,
}

/// Watermark up to which a destination has received all changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub destination_id: String,
    pub last_synced_at: DateTime<Utc>,
}

/// Result of asking the registry for one id.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(JsonValue),
    NotFound,
    TransientError(String),
}

impl FetchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Found(_) => "found",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::TransientError(_) => "transient_error",
        }
    }
}
