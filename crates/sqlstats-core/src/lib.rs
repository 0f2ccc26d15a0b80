//! sqlstats-core: Core library for sqlstats
//!
//! This crate keeps persisted SQL execution statistics bounded. One
//! protected, cluster-wide schedule periodically trims the statement and
//! transaction statistics tables to a configured row ceiling, and a health
//! check flags schedules that are paused or run too rarely.
//!
//! # Architecture
//!
//! ```text
//! node startup → ScheduleLifecycleManager (ensure one schedule)
//!                      ↓
//!     JobRegistry (claim due schedule) → CompactionExecutor → stats tables
//!                      ↓
//!     health reporter → ScheduleAnomalyChecker → warn!/`sqlstats check`
//! ```
//!
//! # Modules
//!
//! - `sqlstats`: Compaction executor, schedule lifecycle, anomaly checks
//! - `jobs`: Cluster-wide scheduled job framework
//! - `settings`: Cluster settings shared by every node
//! - `persisted_stats`: Persisted statement/transaction statistics tables
//! - `recurrence`: Cron-style recurrence expressions
//! - `storage`: SQLite schema and connection handling
//! - `config`: Node configuration (`sqlstats.toml`)
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod persisted_stats;
pub mod recurrence;
pub mod settings;
pub mod sqlstats;
pub mod storage;

pub use error::{Error, Result, StorageError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
