//! Harvesting and synchronization engine: range discovery, tiered
//! re-polling, the per-record state machine and incremental mirror sync.

pub mod apply;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod discovery;
pub mod mirror;
pub mod report;
pub mod scheduler;
pub mod sync;
pub mod throttle;

pub use apply::{plan, ApplyPlan, ApplyReport, StateMachine, MAX_CONFLICT_RETRIES};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigFile, HarvestConfig};
pub use cycle::{build_scheduler, CycleOptions, CycleRunner, CycleSettings};
pub use discovery::{DiscoveryConfig, DiscoveryReport, RangeDiscoverer, StopReason};
pub use mirror::{MemoryMirror, MirrorError, SecondaryMirror, SqliteMirror};
pub use report::{brief_markdown, report_recent_markdown, write_reports, CycleSummary, OutcomeTally, PartitionRun};
pub use scheduler::{eligible, select_due, DuePlan, TierConfig, TierScheduler};
pub use sync::{SyncEngine, SyncError, SyncOptions, SyncResult};
pub use throttle::Throttle;

pub const CRATE_NAME: &str = "harvest-engine";
