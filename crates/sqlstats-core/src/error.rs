//! Error types for sqlstats-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sqlstats-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration and cluster setting errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Schedule administration errors
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Diagnostic anomaly detected on the compaction schedule
    #[error("Schedule anomaly: {0}")]
    Anomaly(#[from] ScheduleAnomaly),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operation was cancelled before it could commit
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

impl Error {
    /// Whether this error is the protected-schedule drop rejection.
    #[must_use]
    pub fn is_schedule_undroppable(&self) -> bool {
        matches!(self, Self::Schedule(ScheduleError::Undroppable { .. }))
    }

    /// Whether this error is a storage uniqueness violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Storage(StorageError::UniqueViolation(_)))
    }

    /// The wrapped schedule anomaly, if this error carries one.
    #[must_use]
    pub fn anomaly(&self) -> Option<&ScheduleAnomaly> {
        match self {
            Self::Anomaly(anomaly) => Some(anomaly),
            _ => None,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Schedule(err) => Some(err.remediation()),
            Self::Anomaly(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the database directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON payload and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command.")
                    .alternative("If the issue persists, restart the node with `sqlstats serve`."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new(
                    "The operation was cancelled and rolled back. It is retried on the next scheduled run.",
                )
                .command("Run compaction now", "sqlstats compact"),
            ),
        }
    }
}

/// Storage-layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Uniqueness constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi_err, _) = &err {
            if ffi_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || ffi_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                return Self::UniqueViolation(err.to_string());
            }
        }
        Self::Database(err.to_string())
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check database permissions and retry.",
            )
            .command("Initialize", "sqlstats init")
            .alternative("Ensure the database directory is writable."),
            Self::UniqueViolation(_) => Remediation::new(
                "A row with the same unique key already exists.",
            )
            .command("Show schedule", "sqlstats schedule show"),
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Database schema version {current} is newer than supported ({supported}). Upgrade sqlstats."
            ))
            .alternative("Point --db at a database created by this version."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unknown cluster setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid value for cluster setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .alternative("Omit --config to run with defaults."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .alternative("Omit --config to run with defaults."),
            Self::ParseError(_) => {
                Remediation::new("Config could not be parsed. Fix the TOML syntax and retry.")
                    .alternative("Compare against the documented sqlstats.toml layout.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config values are invalid. Correct them and retry.")
            }
            Self::UnknownSetting(_) => Remediation::new("Use a registered cluster setting name.")
                .command("List settings", "sqlstats settings list"),
            Self::InvalidSetting { key, .. } => Remediation::new(format!(
                "Provide a valid value for {key}, or reset it to its default."
            ))
            .command("Reset", format!("sqlstats settings reset {key}")),
        }
    }
}

/// Schedule administration errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Deletion of a protected schedule was attempted.
    #[error("{name} schedule cannot be dropped (schedule id {schedule_id})")]
    Undroppable { schedule_id: i64, name: String },

    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Invalid recurrence expression '{expr}': {reason}")]
    InvalidRecurrence { expr: String, reason: String },

    #[error("No executor registered for type {0}")]
    UnknownExecutor(String),
}

impl ScheduleError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Undroppable { .. } => Remediation::new(
                "This schedule bounds persisted statistics and cannot be dropped.",
            )
            .command("Pause instead", "sqlstats schedule pause")
            .alternative("Raise sql.stats.cleanup.recurrence interval rather than removing the schedule."),
            Self::NotFound(_) => Remediation::new(
                "Schedule not found. Run init to create the compaction schedule.",
            )
            .command("Initialize", "sqlstats init"),
            Self::InvalidRecurrence { .. } => Remediation::new(
                "Use @hourly/@daily/@weekly or a 5, 6 or 7 field cron expression.",
            )
            .command("Reset recurrence", "sqlstats settings reset sql.stats.cleanup.recurrence"),
            Self::UnknownExecutor(_) => Remediation::new(
                "No node registered an executor for this schedule type.",
            )
            .command("Run a node", "sqlstats serve"),
        }
    }
}

/// Diagnostic anomalies on the compaction schedule.
///
/// These are return values, never operational failures; callers decide
/// whether to alert.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleAnomaly {
    #[error("sql stats compaction schedule {schedule_id} is paused")]
    Paused { schedule_id: i64 },

    #[error(
        "sql stats compaction schedule interval is too long: '{expr}' runs every {} (threshold {threshold_secs}s)",
        interval_label(.interval_secs)
    )]
    IntervalTooLong {
        schedule_id: i64,
        expr: String,
        /// Seconds between consecutive runs; `None` when no further run exists.
        interval_secs: Option<i64>,
        threshold_secs: i64,
    },

    #[error("sql stats compaction schedule {schedule_id} has an unusable recurrence '{expr}': {reason}")]
    InvalidRecurrence {
        schedule_id: i64,
        expr: String,
        reason: String,
    },
}

#[allow(clippy::ref_option)]
fn interval_label(interval_secs: &Option<i64>) -> String {
    interval_secs.map_or_else(|| "never again".to_string(), |secs| format!("{secs}s"))
}

impl ScheduleAnomaly {
    /// Stable machine-readable kind name.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Paused { .. } => "schedule_paused",
            Self::IntervalTooLong { .. } => "schedule_interval_too_long",
            Self::InvalidRecurrence { .. } => "schedule_invalid_recurrence",
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Paused { .. } => Remediation::new(
                "Compaction is paused; persisted statistics can grow without bound.",
            )
            .command("Resume", "sqlstats schedule resume"),
            Self::IntervalTooLong { .. } | Self::InvalidRecurrence { .. } => Remediation::new(
                "Restore a recurrence that runs at least once per threshold interval.",
            )
            .command("Reset recurrence", "sqlstats settings reset sql.stats.cleanup.recurrence"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(extended_code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(extended_code),
            Some("constraint failed".to_string()),
        )
    }

    #[test]
    fn unique_violation_is_distinguished() {
        let err: Error = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE).into();
        assert!(err.is_unique_violation());

        let err: Error = sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY).into();
        assert!(err.is_unique_violation());

        let err: Error = sqlite_failure(rusqlite::ffi::SQLITE_BUSY).into();
        assert!(!err.is_unique_violation());
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn undroppable_survives_wrapping() {
        let err: Error = ScheduleError::Undroppable {
            schedule_id: 7,
            name: "sql-stats-compaction".to_string(),
        }
        .into();
        assert!(err.is_schedule_undroppable());
        assert!(err.to_string().contains("cannot be dropped"));
        assert!(!Error::Runtime("x".to_string()).is_schedule_undroppable());
    }

    #[test]
    fn anomaly_display_mentions_expression() {
        let anomaly = ScheduleAnomaly::IntervalTooLong {
            schedule_id: 1,
            expr: "@weekly".to_string(),
            interval_secs: Some(604_800),
            threshold_secs: 86_400,
        };
        let msg = anomaly.to_string();
        assert!(msg.contains("@weekly"));
        assert!(msg.contains("604800s"));

        let never = ScheduleAnomaly::IntervalTooLong {
            schedule_id: 1,
            expr: "0 59 23 24 12 ? 2099".to_string(),
            interval_secs: None,
            threshold_secs: 86_400,
        };
        assert!(never.to_string().contains("never again"));
    }

    #[test]
    fn every_variant_has_remediation() {
        let errors = vec![
            Error::Storage(StorageError::Database("db".to_string())),
            Error::Config(ConfigError::UnknownSetting("x".to_string())),
            Error::Schedule(ScheduleError::NotFound("x".to_string())),
            Error::Anomaly(ScheduleAnomaly::Paused { schedule_id: 1 }),
            Error::Runtime("r".to_string()),
            Error::Cancelled("c".to_string()),
        ];
        for err in errors {
            let remediation = err.remediation().expect("remediation");
            assert!(!remediation.summary.is_empty());
            assert!(remediation.render_plain().starts_with("To fix:"));
        }
    }

    #[test]
    fn anomaly_kind_names_are_stable() {
        assert_eq!(
            ScheduleAnomaly::Paused { schedule_id: 1 }.kind_name(),
            "schedule_paused"
        );
        let err: Error = ScheduleAnomaly::Paused { schedule_id: 1 }.into();
        assert!(matches!(err.anomaly(), Some(ScheduleAnomaly::Paused { .. })));
    }
}
