//! Lifecycle of the protected compaction schedule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, ScheduleError};
use crate::jobs::{
    NewSchedule, ScheduleDropGuard, ScheduledJob, SchedulerClock, create_schedule,
    load_schedule, load_schedule_by_name, update_schedule_recurrence,
};
use crate::settings::{CLEANUP_RECURRENCE, ClusterSettings};
use crate::storage::Database;

/// Name of the compaction schedule. Unique across the cluster.
pub const SQL_STATS_COMPACTION_SCHEDULE_NAME: &str = "sql-stats-compaction";
/// Executor type registered for the compaction schedule.
pub const SQL_STATS_COMPACTION_EXECUTOR: &str = "scheduled-sql-stats-compaction-executor";
/// Owner recorded on the compaction schedule.
pub const SQL_STATS_COMPACTION_OWNER: &str = "node";

/// Load the compaction schedule, creating it if absent.
///
/// Racing creators are resolved by the unique index on the schedule name:
/// the loser's uniqueness violation is treated as success and the winner's
/// row is returned.
pub fn ensure_schedule_exists_in(
    conn: &Connection,
    recurrence: &str,
    now: DateTime<Utc>,
) -> Result<ScheduledJob> {
    if let Some(existing) = load_schedule_by_name(conn, SQL_STATS_COMPACTION_SCHEDULE_NAME)? {
        return Ok(existing);
    }
    let new = NewSchedule {
        name: SQL_STATS_COMPACTION_SCHEDULE_NAME,
        executor_type: SQL_STATS_COMPACTION_EXECUTOR,
        owner: SQL_STATS_COMPACTION_OWNER,
        recurrence,
    };
    match create_schedule(conn, &new, now) {
        Ok(created) => {
            info!(
                schedule_id = created.id,
                schedule_name = SQL_STATS_COMPACTION_SCHEDULE_NAME,
                recurrence = %created.recurrence,
                "Created SQL stats compaction schedule"
            );
            Ok(created)
        }
        Err(err) if err.is_unique_violation() => {
            debug!("Compaction schedule created concurrently by another node");
            load_schedule_by_name(conn, SQL_STATS_COMPACTION_SCHEDULE_NAME)?.ok_or_else(|| {
                ScheduleError::NotFound(SQL_STATS_COMPACTION_SCHEDULE_NAME.to_string()).into()
            })
        }
        Err(err) => Err(err),
    }
}

/// Refuses to drop the compaction schedule.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtectedScheduleGuard;

impl ScheduleDropGuard for ProtectedScheduleGuard {
    fn check_drop(&self, schedule: &ScheduledJob) -> Result<()> {
        if schedule.name == SQL_STATS_COMPACTION_SCHEDULE_NAME {
            return Err(ScheduleError::Undroppable {
                schedule_id: schedule.id,
                name: schedule.name.clone(),
            }
            .into());
        }
        Ok(())
    }
}

/// Creates, loads and reconfigures the compaction schedule.
#[derive(Debug, Clone)]
pub struct ScheduleLifecycleManager {
    db: Database,
    settings: ClusterSettings,
    clock: Arc<dyn SchedulerClock>,
}

impl ScheduleLifecycleManager {
    #[must_use]
    pub fn new(db: Database, settings: ClusterSettings, clock: Arc<dyn SchedulerClock>) -> Self {
        Self {
            db,
            settings,
            clock,
        }
    }

    /// Idempotently create the compaction schedule with the configured
    /// recurrence.
    pub async fn ensure_schedule_exists(&self) -> Result<ScheduledJob> {
        let recurrence = self.settings.get(CLEANUP_RECURRENCE).await?.value;
        let now = self.clock.now();
        self.db
            .call(move |conn| ensure_schedule_exists_in(conn, &recurrence, now))
            .await
    }

    /// Fresh snapshot of the compaction schedule.
    pub async fn load_schedule(&self) -> Result<ScheduledJob> {
        self.db
            .call(|conn| {
                load_schedule_by_name(conn, SQL_STATS_COMPACTION_SCHEDULE_NAME)?.ok_or_else(
                    || {
                        ScheduleError::NotFound(SQL_STATS_COMPACTION_SCHEDULE_NAME.to_string())
                            .into()
                    },
                )
            })
            .await
    }

    /// Reject deletion of `schedule_id` if it is the compaction schedule.
    pub async fn intercept_deletion(&self, schedule_id: i64) -> Result<()> {
        let schedule = self
            .db
            .call(move |conn| load_schedule(conn, schedule_id))
            .await?;
        ProtectedScheduleGuard.check_drop(&schedule)
    }

    /// Rewrite the persisted recurrence and next run.
    pub async fn update_recurrence(&self, expr: &str) -> Result<ScheduledJob> {
        let expr = expr.to_string();
        let now = self.clock.now();
        let updated = self
            .db
            .call(move |conn| {
                let current = load_schedule_by_name(conn, SQL_STATS_COMPACTION_SCHEDULE_NAME)?
                    .ok_or_else(|| {
                        ScheduleError::NotFound(SQL_STATS_COMPACTION_SCHEDULE_NAME.to_string())
                    })?;
                update_schedule_recurrence(conn, current.id, &expr, now)
            })
            .await?;
        info!(
            schedule_id = updated.id,
            recurrence = %updated.recurrence,
            next_run = ?updated.next_run,
            "Compaction schedule recurrence updated"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ScheduleStatus, list_schedules};
    use crate::storage::make_test_db;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 15, 0).unwrap()
    }

    #[test]
    fn first_call_creates_pending_hourly_schedule() {
        let conn = make_test_db();
        let job = ensure_schedule_exists_in(&conn, "@hourly", now()).unwrap();
        assert_eq!(job.name, SQL_STATS_COMPACTION_SCHEDULE_NAME);
        assert_eq!(job.recurrence, "@hourly");
        assert_eq!(job.status, ScheduleStatus::Pending);
        assert!(job.next_run.is_some());
    }

    #[test]
    fn repeated_calls_are_noops() {
        let conn = make_test_db();
        let first = ensure_schedule_exists_in(&conn, "@hourly", now()).unwrap();
        for _ in 0..5 {
            let again = ensure_schedule_exists_in(&conn, "@daily", now()).unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(list_schedules(&conn).unwrap().len(), 1);
    }

    #[test]
    fn guard_only_protects_compaction_schedule() {
        let conn = make_test_db();
        let job = ensure_schedule_exists_in(&conn, "@hourly", now()).unwrap();
        let err = ProtectedScheduleGuard.check_drop(&job).unwrap_err();
        assert!(err.is_schedule_undroppable());
        assert!(err.to_string().contains(SQL_STATS_COMPACTION_SCHEDULE_NAME));

        let mut other = job;
        other.name = "nightly-backup".to_string();
        assert!(ProtectedScheduleGuard.check_drop(&other).is_ok());
    }
}
