//! Executor registry and the due-schedule runner.
//!
//! Nodes race to claim due schedules with a conditional UPDATE; the winner
//! holds a lease until it records the outcome, so at most one execution of
//! a schedule is active at a time across every node sharing the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::clock::{SchedulerClock, SystemClock};
use super::schedule::{ScheduleStatus, ScheduledJob, delete_schedule_row, load_schedule};
use crate::config::SchedulerConfig;
use crate::error::{Result, ScheduleError};
use crate::recurrence::Recurrence;
use crate::storage::{Database, to_epoch_ms};

fn default_lease() -> TimeDelta {
    TimeDelta::minutes(5)
}

/// Everything an executor learns about the run it is asked to perform.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: i64,
    pub node_id: String,
    pub schedule: ScheduledJob,
    /// Set when the node is shutting down; long-running work should stop
    /// and roll back.
    pub cancel: Arc<AtomicBool>,
}

/// Body of a scheduled job, registered per executor type.
#[async_trait]
pub trait ScheduledJobExecutor: Send + Sync {
    /// Perform one run. The returned text becomes the schedule's status
    /// message.
    async fn execute(&self, ctx: &JobContext) -> Result<String>;
}

/// Consulted before any schedule is dropped. An error vetoes the drop.
pub trait ScheduleDropGuard: Send + Sync {
    fn check_drop(&self, schedule: &ScheduledJob) -> Result<()>;
}

/// Outcome of one schedule execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRunOutcome {
    pub schedule_id: i64,
    pub schedule_name: String,
    pub job_id: i64,
    pub status: ScheduleStatus,
    pub message: String,
}

/// Registered executors and drop guards for one node.
pub struct JobRegistry {
    db: Database,
    node_id: String,
    lease: TimeDelta,
    clock: Arc<dyn SchedulerClock>,
    executors: HashMap<String, Arc<dyn ScheduledJobExecutor>>,
    drop_guards: Vec<Arc<dyn ScheduleDropGuard>>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("node_id", &self.node_id)
            .field("lease", &self.lease)
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .field("drop_guards", &self.drop_guards.len())
            .finish_non_exhaustive()
    }
}

impl JobRegistry {
    #[must_use]
    pub fn new(db: Database, node_id: impl Into<String>) -> Self {
        Self {
            db,
            node_id: node_id.into(),
            lease: default_lease(),
            clock: Arc::new(SystemClock),
            executors: HashMap::new(),
            drop_guards: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn from_config(db: Database, config: &SchedulerConfig) -> Self {
        Self::new(db, config.node_id.clone()).with_lease(config.lease())
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn SchedulerClock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = TimeDelta::from_std(lease).unwrap_or_else(|_| default_lease());
        self
    }

    /// Share a cancellation flag with every executor this registry runs.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn register_executor(
        &mut self,
        executor_type: impl Into<String>,
        executor: Arc<dyn ScheduledJobExecutor>,
    ) {
        let executor_type = executor_type.into();
        debug!(executor_type = %executor_type, "Registered job executor");
        self.executors.insert(executor_type, executor);
    }

    pub fn register_drop_guard(&mut self, guard: Arc<dyn ScheduleDropGuard>) {
        self.drop_guards.push(guard);
    }

    #[must_use]
    pub fn clock(&self) -> Arc<dyn SchedulerClock> {
        Arc::clone(&self.clock)
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Drop a schedule after every registered guard has approved it.
    ///
    /// A guard's error is returned unchanged and nothing is deleted.
    pub async fn drop_schedule(&self, schedule_id: i64) -> Result<()> {
        let schedule = self
            .db
            .call(move |conn| load_schedule(conn, schedule_id))
            .await?;
        for guard in &self.drop_guards {
            if let Err(err) = guard.check_drop(&schedule) {
                warn!(
                    schedule_id,
                    schedule_name = %schedule.name,
                    error = %err,
                    "Schedule drop rejected"
                );
                return Err(err);
            }
        }
        self.db
            .call(move |conn| delete_schedule_row(conn, schedule_id))
            .await?;
        info!(schedule_id, schedule_name = %schedule.name, "Schedule dropped");
        Ok(())
    }

    /// Run every schedule that is due at the clock's current time.
    pub async fn execute_due_schedules(&self) -> Result<Vec<JobRunOutcome>> {
        let now = self.clock.now();
        let due = self.db.call(move |conn| find_due(conn, now)).await?;
        let mut outcomes = Vec::new();
        for schedule_id in due {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            if let Some(outcome) = self.execute_one(schedule_id, now).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    async fn execute_one(
        &self,
        schedule_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRunOutcome>> {
        let node_id = self.node_id.clone();
        let expires = now.checked_add_signed(self.lease).unwrap_or(now);
        let claimed = self
            .db
            .call(move |conn| claim(conn, schedule_id, &node_id, now, expires))
            .await?;
        let Some((schedule, job_id)) = claimed else {
            debug!(schedule_id, "Schedule claimed by another node");
            return Ok(None);
        };

        info!(
            schedule_id,
            schedule_name = %schedule.name,
            job_id,
            node_id = %self.node_id,
            "Executing scheduled job"
        );

        let result = match self.executors.get(&schedule.executor_type) {
            Some(executor) => {
                let ctx = JobContext {
                    job_id,
                    node_id: self.node_id.clone(),
                    schedule: schedule.clone(),
                    cancel: Arc::clone(&self.cancel),
                };
                executor.execute(&ctx).await
            }
            None => Err(ScheduleError::UnknownExecutor(schedule.executor_type.clone()).into()),
        };

        let (status, message) = match result {
            Ok(message) => (ScheduleStatus::Succeeded, message),
            Err(err) => {
                error!(
                    schedule_id,
                    schedule_name = %schedule.name,
                    job_id,
                    error = %err,
                    "Scheduled job failed"
                );
                (ScheduleStatus::Failed, err.to_string())
            }
        };

        let finished = self.clock.now();
        let node_id = self.node_id.clone();
        let record = message.clone();
        let recorded = self
            .db
            .call(move |conn| {
                finish(
                    conn,
                    &FinishedRun {
                        schedule_id,
                        job_id,
                        node_id: &node_id,
                        started: now,
                        finished,
                        status,
                        message: &record,
                    },
                )
            })
            .await?;
        if !recorded {
            warn!(
                schedule_id,
                job_id,
                node_id = %self.node_id,
                "Lease lost before the run finished; outcome not recorded on the schedule"
            );
        }

        Ok(Some(JobRunOutcome {
            schedule_id,
            schedule_name: schedule.name,
            job_id,
            status,
            message,
        }))
    }

    /// Poll for due schedules until `shutdown` is set.
    pub fn spawn_scheduler_loop(
        self: Arc<Self>,
        poll_interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    info!(node_id = %self.node_id, "Scheduler: shutdown signal received");
                    break;
                }
                match self.execute_due_schedules().await {
                    Ok(outcomes) if !outcomes.is_empty() => {
                        debug!(count = outcomes.len(), "Scheduler: executed due schedules");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Scheduler: polling failed"),
                }
            }
        })
    }
}

fn find_due(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT schedule_id FROM scheduled_jobs
         WHERE schedule_status != 'paused' AND next_run IS NOT NULL AND next_run <= ?1
         ORDER BY next_run, schedule_id",
    )?;
    let ids = stmt.query_map(params![to_epoch_ms(now)], |row| row.get(0))?;
    Ok(ids.collect::<rusqlite::Result<Vec<i64>>>()?)
}

/// Claim a due schedule and open a job run. `None` if another node holds it
/// or it is no longer due.
fn claim(
    conn: &mut Connection,
    schedule_id: i64,
    node_id: &str,
    now: DateTime<Utc>,
    expires: DateTime<Utc>,
) -> Result<Option<(ScheduledJob, i64)>> {
    let now_ms = to_epoch_ms(now);
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let claimed = tx.execute(
        "UPDATE scheduled_jobs SET claimed_by = ?2, claim_expires_at = ?3
         WHERE schedule_id = ?1
           AND schedule_status != 'paused'
           AND next_run IS NOT NULL AND next_run <= ?4
           AND (claimed_by IS NULL OR claim_expires_at <= ?4)",
        params![schedule_id, node_id, to_epoch_ms(expires), now_ms],
    )?;
    if claimed == 0 {
        return Ok(None);
    }
    tx.execute(
        "INSERT INTO job_runs (schedule_id, node_id, status, started_at)
         VALUES (?1, ?2, 'running', ?3)",
        params![schedule_id, node_id, now_ms],
    )?;
    let job_id = tx.last_insert_rowid();
    let schedule = load_schedule(&tx, schedule_id)?;
    tx.commit()?;
    Ok(Some((schedule, job_id)))
}

struct FinishedRun<'a> {
    schedule_id: i64,
    job_id: i64,
    node_id: &'a str,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    status: ScheduleStatus,
    message: &'a str,
}

/// Record the outcome and release the claim.
///
/// The next run is computed from the expression persisted now, which may
/// differ from the one the run started with. A schedule paused while it was
/// running stays paused. Returns `false` when this node no longer holds the
/// claim; the run itself is still recorded in `job_runs`.
fn finish(conn: &mut Connection, run: &FinishedRun<'_>) -> Result<bool> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let expr: Option<String> = tx
        .query_row(
            "SELECT schedule_expr FROM scheduled_jobs WHERE schedule_id = ?1",
            params![run.schedule_id],
            |row| row.get(0),
        )
        .optional()?;
    let next_run = expr
        .as_deref()
        .and_then(|e| Recurrence::parse(e).ok())
        .and_then(|r| r.next_after(run.finished))
        .map(to_epoch_ms);

    let recorded = tx.execute(
        "UPDATE scheduled_jobs
         SET last_run = ?2,
             next_run = CASE WHEN schedule_status = 'paused' THEN NULL ELSE ?3 END,
             schedule_status = CASE WHEN schedule_status = 'paused' THEN 'paused' ELSE ?4 END,
             status_message = ?5,
             claimed_by = NULL,
             claim_expires_at = NULL
         WHERE schedule_id = ?1 AND claimed_by = ?6",
        params![
            run.schedule_id,
            to_epoch_ms(run.started),
            next_run,
            run.status.as_str(),
            run.message,
            run.node_id
        ],
    )? == 1;
    let run_status = if run.status == ScheduleStatus::Succeeded {
        "succeeded"
    } else {
        "failed"
    };
    tx.execute(
        "UPDATE job_runs SET status = ?2, finished_at = ?3, message = ?4 WHERE job_id = ?1",
        params![
            run.job_id,
            run_status,
            to_epoch_ms(run.finished),
            run.message
        ],
    )?;
    tx.commit()?;
    Ok(recorded)
}
