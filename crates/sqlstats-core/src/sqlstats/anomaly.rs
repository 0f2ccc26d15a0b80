//! Health diagnostics for the compaction schedule.
//!
//! The checker is pure: it inspects a schedule snapshot the caller has just
//! loaded and never touches storage. Reload before every check so edits made
//! directly to the schedule row are seen.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::ScheduleAnomaly;
use crate::jobs::ScheduledJob;
use crate::recurrence::Recurrence;

/// Checks a schedule snapshot against the long-interval threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleAnomalyChecker {
    threshold: TimeDelta,
}

impl ScheduleAnomalyChecker {
    #[must_use]
    pub const fn new(threshold: TimeDelta) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub const fn threshold(&self) -> TimeDelta {
        self.threshold
    }

    /// Classify `schedule`, using `now` only when it has no next run.
    ///
    /// Paused wins over every other finding. Otherwise the effective
    /// interval is the longer of the wait until the next run and the gap
    /// between the next run and the one after it.
    pub fn check(
        &self,
        schedule: &ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleAnomaly> {
        if schedule.is_paused() {
            return Err(ScheduleAnomaly::Paused {
                schedule_id: schedule.id,
            });
        }

        let recurrence = Recurrence::parse(&schedule.recurrence).map_err(|err| {
            ScheduleAnomaly::InvalidRecurrence {
                schedule_id: schedule.id,
                expr: schedule.recurrence.clone(),
                reason: err.to_string(),
            }
        })?;

        let too_long = |interval: Option<TimeDelta>| ScheduleAnomaly::IntervalTooLong {
            schedule_id: schedule.id,
            expr: schedule.recurrence.clone(),
            interval_secs: interval.map(|d| d.num_seconds()),
            threshold_secs: self.threshold.num_seconds(),
        };

        let Some(anchor) = schedule.next_run.or_else(|| recurrence.next_after(now)) else {
            return Err(too_long(None));
        };
        let Some(following) = recurrence.next_after(anchor) else {
            return Err(too_long(None));
        };

        let wait = anchor - now;
        let gap = following - anchor;
        let interval = wait.max(gap);
        if interval > self.threshold {
            return Err(too_long(Some(interval)));
        }
        Ok(())
    }

    /// Check and wrap the result for reporting.
    #[must_use]
    pub fn report(&self, schedule: ScheduledJob, now: DateTime<Utc>) -> AnomalyReport {
        let anomaly = self.check(&schedule, now).err();
        AnomalyReport::new(schedule, anomaly)
    }
}

/// Kind of finding in an [`AnomalyReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    None,
    Paused,
    IntervalTooLong,
    InvalidRecurrence,
}

/// A health finding together with the snapshot it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnomalyReport {
    pub kind: AnomalyKind,
    /// Human-readable description; `None` when healthy.
    pub detail: Option<String>,
    pub schedule: ScheduledJob,
    #[serde(skip)]
    pub anomaly: Option<ScheduleAnomaly>,
}

impl AnomalyReport {
    #[must_use]
    pub fn new(schedule: ScheduledJob, anomaly: Option<ScheduleAnomaly>) -> Self {
        let kind = match &anomaly {
            None => AnomalyKind::None,
            Some(ScheduleAnomaly::Paused { .. }) => AnomalyKind::Paused,
            Some(ScheduleAnomaly::IntervalTooLong { .. }) => AnomalyKind::IntervalTooLong,
            Some(ScheduleAnomaly::InvalidRecurrence { .. }) => AnomalyKind::InvalidRecurrence,
        };
        Self {
            kind,
            detail: anomaly.as_ref().map(ToString::to_string),
            schedule,
            anomaly,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.anomaly.is_none()
    }
}
