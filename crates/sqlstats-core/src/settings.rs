//! Cluster settings.
//!
//! Values every node must agree on live in the shared `settings` table and
//! are registered here with a type, a default and a validator. Unset names
//! read as their default. Each successful write bumps `settings_meta.version`
//! so nodes can notice changes made elsewhere with a single cheap read.

use std::fmt;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::recurrence::{HOURLY, Recurrence};
use crate::storage::{Database, to_epoch_ms};

/// Maximum number of rows kept in each persisted statistics table.
pub const PERSISTED_ROWS_MAX: &str = "sql.stats.persisted_rows.max";
/// Recurrence of the compaction schedule.
pub const CLEANUP_RECURRENCE: &str = "sql.stats.cleanup.recurrence";
/// Rows removed by each DELETE statement during compaction.
pub const ROWS_TO_DELETE_PER_TXN: &str = "sql.stats.cleanup.rows_to_delete_per_txn";
/// Longest acceptable gap between compaction runs.
pub const LONG_INTERVAL_THRESHOLD_SECS: &str = "sql.stats.cleanup.long_interval_threshold_secs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Int,
    String,
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::String => f.write_str("string"),
        }
    }
}

/// A registered cluster setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub name: &'static str,
    pub kind: SettingKind,
    pub default: &'static str,
    pub description: &'static str,
    validate: fn(&str) -> std::result::Result<(), String>,
}

impl SettingSpec {
    /// Check a raw value against this setting's type and bounds.
    pub fn validate(&self, raw: &str) -> std::result::Result<(), ConfigError> {
        (self.validate)(raw).map_err(|reason| ConfigError::InvalidSetting {
            key: self.name.to_string(),
            reason,
        })
    }
}

fn int_at_least(raw: &str, min: i64) -> std::result::Result<(), String> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("expected an integer, got '{raw}'"))?;
    if value < min {
        return Err(format!("must be >= {min}, got {value}"));
    }
    Ok(())
}

fn non_negative_int(raw: &str) -> std::result::Result<(), String> {
    int_at_least(raw, 0)
}

fn positive_int(raw: &str) -> std::result::Result<(), String> {
    int_at_least(raw, 1)
}

fn validate_recurrence(raw: &str) -> std::result::Result<(), String> {
    Recurrence::parse(raw).map(|_| ()).map_err(|e| e.to_string())
}

/// Every setting this crate reads.
pub const REGISTRY: &[SettingSpec] = &[
    SettingSpec {
        name: PERSISTED_ROWS_MAX,
        kind: SettingKind::Int,
        default: "1000000",
        description: "maximum number of rows of statement and transaction statistics that will be persisted",
        validate: non_negative_int,
    },
    SettingSpec {
        name: CLEANUP_RECURRENCE,
        kind: SettingKind::String,
        default: HOURLY,
        description: "cron-tab recurrence for the SQL stats cleanup job",
        validate: validate_recurrence,
    },
    SettingSpec {
        name: ROWS_TO_DELETE_PER_TXN,
        kind: SettingKind::Int,
        default: "10000",
        description: "number of rows removed by each delete statement during compaction",
        validate: positive_int,
    },
    SettingSpec {
        name: LONG_INTERVAL_THRESHOLD_SECS,
        kind: SettingKind::Int,
        default: "86400",
        description: "longest gap between compaction runs before the schedule is reported as anomalous",
        validate: positive_int,
    },
];

/// Look up a registered setting by name.
pub fn lookup(name: &str) -> std::result::Result<&'static SettingSpec, ConfigError> {
    REGISTRY
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| ConfigError::UnknownSetting(name.to_string()))
}

/// Current value of one setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingValue {
    pub name: String,
    pub kind: SettingKind,
    pub value: String,
    pub default: String,
    pub is_default: bool,
    pub description: String,
}

impl SettingValue {
    fn from_spec(spec: &SettingSpec, stored: Option<String>) -> Self {
        let is_default = stored.is_none();
        Self {
            name: spec.name.to_string(),
            kind: spec.kind,
            value: stored.unwrap_or_else(|| spec.default.to_string()),
            default: spec.default.to_string(),
            is_default,
            description: spec.description.to_string(),
        }
    }
}

/// Read one setting, falling back to its default.
pub fn get(conn: &Connection, name: &str) -> Result<SettingValue> {
    let spec = lookup(name)?;
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE name = ?1",
            params![spec.name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(SettingValue::from_spec(spec, stored))
}

/// Read an integer setting.
pub fn get_int(conn: &Connection, name: &str) -> Result<i64> {
    let setting = get(conn, name)?;
    setting.value.trim().parse().map_err(|_| {
        ConfigError::InvalidSetting {
            key: setting.name.clone(),
            reason: format!("stored value '{}' is not an integer", setting.value),
        }
        .into()
    })
}

/// List every registered setting.
pub fn list(conn: &Connection) -> Result<Vec<SettingValue>> {
    REGISTRY.iter().map(|spec| get(conn, spec.name)).collect()
}

/// Current settings version.
pub fn version(conn: &Connection) -> Result<u64> {
    let version: i64 = conn.query_row(
        "SELECT version FROM settings_meta WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(version).unwrap_or_default())
}

fn bump_version(conn: &Connection) -> Result<u64> {
    conn.execute(
        "UPDATE settings_meta SET version = version + 1 WHERE id = 1",
        [],
    )?;
    version(conn)
}

/// Validate and store a value. Returns the new settings version.
pub fn set(conn: &Connection, name: &str, value: &str) -> Result<u64> {
    let spec = lookup(name)?;
    spec.validate(value)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO settings (name, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![spec.name, value.trim(), to_epoch_ms(Utc::now())],
    )?;
    let version = bump_version(&tx)?;
    tx.commit()?;
    Ok(version)
}

/// Remove any override so the default applies again.
pub fn reset(conn: &Connection, name: &str) -> Result<u64> {
    let spec = lookup(name)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM settings WHERE name = ?1", params![spec.name])?;
    let version = bump_version(&tx)?;
    tx.commit()?;
    Ok(version)
}

/// Typed snapshot of the settings compaction reads.
///
/// Loaded fresh for every run so changes apply to the next execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSettings {
    pub persisted_rows_max: u64,
    pub cleanup_recurrence: String,
    pub rows_to_delete_per_txn: u64,
    pub long_interval_threshold: TimeDelta,
}

impl StatsSettings {
    pub fn load(conn: &Connection) -> Result<Self> {
        let non_negative = |name: &str| -> Result<u64> {
            let value = get_int(conn, name)?;
            u64::try_from(value).map_err(|_| {
                ConfigError::InvalidSetting {
                    key: name.to_string(),
                    reason: format!("must be >= 0, got {value}"),
                }
                .into()
            })
        };
        let threshold_secs = get_int(conn, LONG_INTERVAL_THRESHOLD_SECS)?;
        Ok(Self {
            persisted_rows_max: non_negative(PERSISTED_ROWS_MAX)?,
            cleanup_recurrence: get(conn, CLEANUP_RECURRENCE)?.value,
            rows_to_delete_per_txn: non_negative(ROWS_TO_DELETE_PER_TXN)?.max(1),
            long_interval_threshold: TimeDelta::try_seconds(threshold_secs)
                .unwrap_or(TimeDelta::MAX),
        })
    }
}

/// Notification sent to subscribers when settings change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsChange {
    pub version: u64,
    /// Setting written by this process, or `None` when the change was
    /// discovered by [`ClusterSettings::refresh`].
    pub name: Option<String>,
}

/// Async handle to cluster settings with change notification.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    db: Database,
    changes: Arc<watch::Sender<SettingsChange>>,
}

impl ClusterSettings {
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (tx, _rx) = watch::channel(SettingsChange {
            version: 0,
            name: None,
        });
        Self {
            db,
            changes: Arc::new(tx),
        }
    }

    pub async fn get(&self, name: &str) -> Result<SettingValue> {
        let name = name.to_string();
        self.db.call(move |conn| get(conn, &name)).await
    }

    pub async fn list(&self) -> Result<Vec<SettingValue>> {
        self.db.call(|conn| list(conn)).await
    }

    pub async fn snapshot(&self) -> Result<StatsSettings> {
        self.db.call(|conn| StatsSettings::load(conn)).await
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<SettingValue> {
        let name = name.to_string();
        let value = value.to_string();
        let (version, current) = self
            .db
            .call(move |conn| {
                let version = set(conn, &name, &value)?;
                Ok((version, get(conn, &name)?))
            })
            .await?;
        info!(setting = %current.name, value = %current.value, version, "Cluster setting updated");
        self.publish(version, &current.name);
        Ok(current)
    }

    pub async fn reset(&self, name: &str) -> Result<SettingValue> {
        let name = name.to_string();
        let (version, current) = self
            .db
            .call(move |conn| {
                let version = reset(conn, &name)?;
                Ok((version, get(conn, &name)?))
            })
            .await?;
        info!(setting = %current.name, value = %current.value, version, "Cluster setting reset");
        self.publish(version, &current.name);
        Ok(current)
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    /// Re-read the persisted version and notify subscribers if another node
    /// changed a setting. Returns whether a change was found.
    pub async fn refresh(&self) -> Result<bool> {
        let persisted = self.db.call(|conn| version(conn)).await?;
        let seen = self.changes.borrow().version;
        if persisted > seen {
            debug!(seen, persisted, "Cluster settings changed elsewhere");
            self.changes.send_replace(SettingsChange {
                version: persisted,
                name: None,
            });
            return Ok(true);
        }
        Ok(false)
    }

    fn publish(&self, version: u64, name: &str) {
        self.changes.send_replace(SettingsChange {
            version,
            name: Some(name.to_string()),
        });
    }
}
