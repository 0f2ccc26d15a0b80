//! Scheduled job framework.
//!
//! A small cluster-wide scheduler on the shared database: schedules are
//! rows in `scheduled_jobs`, executors are registered per type on each
//! node, and drop guards get a veto over schedule deletion.

pub mod clock;
pub mod registry;
pub mod schedule;

pub use clock::{ManualClock, SchedulerClock, SystemClock};
pub use registry::{
    JobContext, JobRegistry, JobRunOutcome, ScheduleDropGuard, ScheduledJobExecutor,
};
pub use schedule::{
    NewSchedule, ScheduleStatus, ScheduledJob, create_schedule, list_schedules, load_schedule,
    load_schedule_by_name, pause_schedule, resume_schedule, update_schedule_recurrence,
};
