//! Scheduled compaction of persisted SQL statistics.
//!
//! - [`lifecycle`] keeps exactly one protected `sql-stats-compaction`
//!   schedule in existence and vetoes attempts to drop it.
//! - [`compaction`] is the schedule's task body: it trims each statistics
//!   table to the retention ceiling, oldest rows first.
//! - [`anomaly`] flags a paused schedule or one that runs too rarely to keep
//!   storage bounded.
//! - [`orchestrator`] wires these into a node's job registry and background
//!   tasks.

pub mod anomaly;
pub mod compaction;
pub mod lifecycle;
pub mod orchestrator;
pub mod retention;

pub use anomaly::{AnomalyKind, AnomalyReport, ScheduleAnomalyChecker};
pub use compaction::{CompactionExecutor, CompactionSummary, TableCompaction};
pub use lifecycle::{
    ProtectedScheduleGuard, SQL_STATS_COMPACTION_EXECUTOR, SQL_STATS_COMPACTION_SCHEDULE_NAME,
    ScheduleLifecycleManager,
};
pub use orchestrator::{BackgroundHandle, CompactionScheduleOrchestrator};
pub use retention::RetentionPolicy;
