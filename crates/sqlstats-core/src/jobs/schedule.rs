//! Schedule rows and their CRUD operations.
//!
//! All functions are synchronous and take a borrowed connection; async
//! callers wrap them in [`crate::storage::Database::call`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};
use crate::recurrence::Recurrence;
use crate::storage::{from_epoch_ms, required_ts, to_epoch_ms};

/// Lifecycle status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Waiting for its next run
    Pending,
    /// Administratively paused; never picked up while paused
    Paused,
    /// Last run succeeded
    Succeeded,
    /// Last run failed
    Failed,
}

impl ScheduleStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A persisted recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub executor_type: String,
    pub owner: String,
    /// Effective recurrence expression as persisted.
    pub recurrence: String,
    /// `None` while paused or when the expression has no further occurrence.
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub status: ScheduleStatus,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == ScheduleStatus::Paused
    }
}

/// Fields supplied when creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule<'a> {
    pub name: &'a str,
    pub executor_type: &'a str,
    pub owner: &'a str,
    pub recurrence: &'a str,
}

const SELECT_COLUMNS: &str = "schedule_id, schedule_name, executor_type, owner, schedule_expr,
    next_run, last_run, schedule_status, status_message, created_at";

fn decode_schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let status_raw: String = row.get(7)?;
    let status = ScheduleStatus::from_str(&status_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;
    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        executor_type: row.get(2)?,
        owner: row.get(3)?,
        recurrence: row.get(4)?,
        next_run: row.get::<_, Option<i64>>(5)?.and_then(from_epoch_ms),
        last_run: row.get::<_, Option<i64>>(6)?.and_then(from_epoch_ms),
        status,
        status_message: row.get(8)?,
        created_at: required_ts(9, row.get(9)?)?,
    })
}

/// Insert a new pending schedule.
///
/// A second schedule with the same name fails with a uniqueness violation
/// (see [`crate::Error::is_unique_violation`]).
pub fn create_schedule(
    conn: &Connection,
    new: &NewSchedule<'_>,
    now: DateTime<Utc>,
) -> Result<ScheduledJob> {
    let recurrence = Recurrence::parse(new.recurrence)?;
    let next_run = recurrence.next_after(now).map(to_epoch_ms);
    conn.execute(
        "INSERT INTO scheduled_jobs
            (schedule_name, executor_type, owner, schedule_expr, next_run, schedule_status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        params![
            new.name,
            new.executor_type,
            new.owner,
            recurrence.as_str(),
            next_run,
            to_epoch_ms(now)
        ],
    )?;
    load_schedule(conn, conn.last_insert_rowid())
}

pub fn load_schedule(conn: &Connection, id: i64) -> Result<ScheduledJob> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM scheduled_jobs WHERE schedule_id = ?1"),
        params![id],
        decode_schedule_row,
    )
    .optional()?
    .ok_or_else(|| ScheduleError::NotFound(format!("schedule id {id}")).into())
}

pub fn load_schedule_by_name(conn: &Connection, name: &str) -> Result<Option<ScheduledJob>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM scheduled_jobs WHERE schedule_name = ?1"),
            params![name],
            decode_schedule_row,
        )
        .optional()?)
}

pub fn list_schedules(conn: &Connection) -> Result<Vec<ScheduledJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM scheduled_jobs ORDER BY schedule_id"
    ))?;
    let rows = stmt.query_map([], decode_schedule_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn expect_one_row(changed: usize, id: i64) -> Result<()> {
    if changed == 0 {
        return Err(ScheduleError::NotFound(format!("schedule id {id}")).into());
    }
    Ok(())
}

/// Pause a schedule. Its next run is cleared until it is resumed.
pub fn pause_schedule(conn: &Connection, id: i64) -> Result<ScheduledJob> {
    let changed = conn.execute(
        "UPDATE scheduled_jobs SET schedule_status = 'paused', next_run = NULL
         WHERE schedule_id = ?1",
        params![id],
    )?;
    expect_one_row(changed, id)?;
    load_schedule(conn, id)
}

/// Resume a paused schedule from `now`.
pub fn resume_schedule(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<ScheduledJob> {
    let current = load_schedule(conn, id)?;
    let recurrence = Recurrence::parse(&current.recurrence)?;
    conn.execute(
        "UPDATE scheduled_jobs SET schedule_status = 'pending', next_run = ?2, status_message = NULL
         WHERE schedule_id = ?1",
        params![id, recurrence.next_after(now).map(to_epoch_ms)],
    )?;
    load_schedule(conn, id)
}

/// Replace the recurrence expression and recompute the next run.
///
/// A paused schedule keeps no next run.
pub fn update_schedule_recurrence(
    conn: &Connection,
    id: i64,
    expr: &str,
    now: DateTime<Utc>,
) -> Result<ScheduledJob> {
    let recurrence = Recurrence::parse(expr)?;
    let changed = conn.execute(
        "UPDATE scheduled_jobs
         SET schedule_expr = ?2,
             next_run = CASE WHEN schedule_status = 'paused' THEN NULL ELSE ?3 END
         WHERE schedule_id = ?1",
        params![
            id,
            recurrence.as_str(),
            recurrence.next_after(now).map(to_epoch_ms)
        ],
    )?;
    expect_one_row(changed, id)?;
    load_schedule(conn, id)
}

/// Delete a schedule row without consulting any drop guard.
///
/// Only [`crate::jobs::JobRegistry::drop_schedule`] should reach this.
pub(crate) fn delete_schedule_row(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute(
        "DELETE FROM scheduled_jobs WHERE schedule_id = ?1",
        params![id],
    )?;
    expect_one_row(changed, id)
}
