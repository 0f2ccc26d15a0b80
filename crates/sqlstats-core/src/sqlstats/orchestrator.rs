//! Composition root for scheduled SQL stats compaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::anomaly::{AnomalyReport, ScheduleAnomalyChecker};
use super::compaction::{CompactionExecutor, CompactionSummary};
use super::lifecycle::{
    ProtectedScheduleGuard, SQL_STATS_COMPACTION_EXECUTOR, ScheduleLifecycleManager,
};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::jobs::{JobRegistry, ScheduledJob, SchedulerClock};
use crate::settings::{CLEANUP_RECURRENCE, ClusterSettings, SettingValue};
use crate::storage::Database;

/// Wires the lifecycle manager, executor and anomaly checker together.
#[derive(Debug, Clone)]
pub struct CompactionScheduleOrchestrator {
    settings: ClusterSettings,
    lifecycle: ScheduleLifecycleManager,
    executor: Arc<CompactionExecutor>,
    clock: Arc<dyn SchedulerClock>,
}

impl CompactionScheduleOrchestrator {
    #[must_use]
    pub fn new(db: Database, settings: ClusterSettings, clock: Arc<dyn SchedulerClock>) -> Self {
        let lifecycle =
            ScheduleLifecycleManager::new(db.clone(), settings.clone(), Arc::clone(&clock));
        let executor = Arc::new(CompactionExecutor::new(db, settings.clone()));
        Self {
            settings,
            lifecycle,
            executor,
            clock,
        }
    }

    /// Register the executor and drop guard, then make sure the schedule
    /// exists.
    pub async fn start(&self, registry: &mut JobRegistry) -> Result<ScheduledJob> {
        registry.register_executor(SQL_STATS_COMPACTION_EXECUTOR, self.executor.clone());
        registry.register_drop_guard(Arc::new(ProtectedScheduleGuard));
        self.lifecycle.ensure_schedule_exists().await
    }

    #[must_use]
    pub fn lifecycle(&self) -> &ScheduleLifecycleManager {
        &self.lifecycle
    }

    #[must_use]
    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Run one compaction outside the schedule.
    pub async fn compact_now(&self, cancel: Arc<AtomicBool>) -> Result<CompactionSummary> {
        self.executor.run(cancel).await
    }

    /// Reload the schedule and check it against the current threshold.
    pub async fn check_health(&self) -> Result<AnomalyReport> {
        let threshold = self.settings.snapshot().await?.long_interval_threshold;
        let schedule = self.lifecycle.load_schedule().await?;
        Ok(ScheduleAnomalyChecker::new(threshold).report(schedule, self.clock.now()))
    }

    /// Set a cluster setting and apply it to the schedule if it is the
    /// recurrence.
    pub async fn set_setting(&self, name: &str, value: &str) -> Result<SettingValue> {
        let updated = self.settings.set(name, value).await?;
        self.apply_setting(&updated).await?;
        Ok(updated)
    }

    /// Reset a cluster setting and apply the default to the schedule if it
    /// is the recurrence.
    pub async fn reset_setting(&self, name: &str) -> Result<SettingValue> {
        let updated = self.settings.reset(name).await?;
        self.apply_setting(&updated).await?;
        Ok(updated)
    }

    async fn apply_setting(&self, setting: &SettingValue) -> Result<()> {
        if setting.name == CLEANUP_RECURRENCE {
            self.lifecycle.update_recurrence(&setting.value).await?;
        }
        Ok(())
    }

    /// Spawn the settings watcher and the periodic health reporter.
    ///
    /// The recurrence setting is read before the watcher starts; only later
    /// changes of its value are applied to the schedule.
    pub async fn spawn_background(
        &self,
        health: &HealthConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<BackgroundHandle> {
        let applied = self.settings.get(CLEANUP_RECURRENCE).await?.value;
        let tasks = vec![
            self.spawn_settings_watcher(health.settings_refresh(), applied, Arc::clone(&shutdown)),
            self.spawn_health_reporter(health.check_interval(), Arc::clone(&shutdown)),
        ];
        Ok(BackgroundHandle { tasks, shutdown })
    }

    /// Apply recurrence changes made on any node.
    ///
    /// Only a change of the setting's value away from `applied` is written
    /// to the schedule, so a recurrence edited directly on the row stays until
    /// the setting itself changes.
    fn spawn_settings_watcher(
        &self,
        refresh: Duration,
        mut applied: String,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut changes = this.settings.subscribe();
            let mut interval = tokio::time::interval(refresh);
            loop {
                // A change found by refresh() is delivered on the next pass.
                let notified = tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = this.settings.refresh().await {
                            warn!(error = %err, "Settings watcher: refresh failed");
                        }
                        false
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        true
                    }
                };
                if shutdown.load(Ordering::SeqCst) {
                    debug!("Settings watcher: shutdown signal received");
                    break;
                }
                if !notified {
                    continue;
                }
                match this.settings.get(CLEANUP_RECURRENCE).await {
                    Ok(setting) if setting.value != applied => {
                        match this.lifecycle.update_recurrence(&setting.value).await {
                            Ok(_) => applied = setting.value,
                            Err(err) => {
                                warn!(error = %err, "Settings watcher: failed to apply recurrence");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Settings watcher: read failed"),
                }
            }
        })
    }

    fn spawn_health_reporter(&self, every: Duration, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    debug!("Health reporter: shutdown signal received");
                    break;
                }
                match this.check_health().await {
                    Ok(report) => match &report.anomaly {
                        None => debug!(
                            schedule_id = report.schedule.id,
                            "Compaction schedule healthy"
                        ),
                        Some(anomaly) => warn!(
                            schedule_id = report.schedule.id,
                            schedule_name = %report.schedule.name,
                            kind = anomaly.kind_name(),
                            recurrence = %report.schedule.recurrence,
                            detail = %anomaly,
                            "Compaction schedule anomaly"
                        ),
                    },
                    Err(err) => warn!(error = %err, "Health reporter: check failed"),
                }
            }
        })
    }
}

/// Handle to the orchestrator's background tasks.
#[derive(Debug)]
pub struct BackgroundHandle {
    tasks: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl BackgroundHandle {
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for every task to finish. Tasks notice the shutdown flag on
    /// their next tick.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Background tasks stopped");
    }

    /// Stop every task without waiting for a tick.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
