//! Shared test infrastructure for sqlstats-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::Harness;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rusqlite::Connection;
use serde_json::json;
use sqlstats_core::jobs::{JobRegistry, ManualClock, SchedulerClock};
use sqlstats_core::persisted_stats::{
    StatementStatsRow, TransactionStatsRow, insert_statement_stats, insert_transaction_stats,
};
use sqlstats_core::settings::ClusterSettings;
use sqlstats_core::sqlstats::CompactionScheduleOrchestrator;
use sqlstats_core::storage::Database;
use tempfile::TempDir;

/// A single node wired against a temp database with a manual clock.
pub struct Harness {
    pub dir: TempDir,
    pub db: Database,
    pub settings: ClusterSettings,
    pub clock: ManualClock,
    pub orchestrator: CompactionScheduleOrchestrator,
    pub registry: JobRegistry,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 10, 15, 0).unwrap()
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("cluster.db"), Duration::from_secs(5));
    db.initialize().unwrap();
    let clock = ManualClock::new(start_time());
    let settings = ClusterSettings::new(db.clone());
    let orchestrator =
        CompactionScheduleOrchestrator::new(db.clone(), settings.clone(), Arc::new(clock.clone()));
    let registry = JobRegistry::new(db.clone(), "node-1").with_clock(Arc::new(clock.clone()));
    Harness {
        dir,
        db,
        settings,
        clock,
        orchestrator,
        registry,
    }
}

impl Harness {
    pub fn conn(&self) -> Connection {
        self.db.open().unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn insert_statement(conn: &Connection, aggregated_ts: DateTime<Utc>, fingerprint_id: u64) {
    insert_statement_stats(
        conn,
        &StatementStatsRow {
            aggregated_ts,
            fingerprint_id,
            transaction_fingerprint_id: fingerprint_id + 1_000,
            plan_hash: 0,
            app_name: "test-app".to_string(),
            node_id: 1,
            agg_interval_secs: 3_600,
            metadata: json!({ "query": format!("SELECT {fingerprint_id}") }),
            statistics: json!({ "count": 1 }),
        },
    )
    .unwrap();
}

pub fn insert_transaction(conn: &Connection, aggregated_ts: DateTime<Utc>, fingerprint_id: u64) {
    insert_transaction_stats(
        conn,
        &TransactionStatsRow {
            aggregated_ts,
            fingerprint_id,
            app_name: "test-app".to_string(),
            node_id: 1,
            agg_interval_secs: 3_600,
            metadata: json!({}),
            statistics: json!({ "count": 1 }),
        },
    )
    .unwrap();
}

/// `count` rows in each table, one per hourly bucket before `start_time`.
pub fn seed_rows(conn: &Connection, count: u32) {
    for i in 0..count {
        let ts = start_time() - TimeDelta::hours(i64::from(i) + 1);
        insert_statement(conn, ts, u64::from(i));
        insert_transaction(conn, ts, u64::from(i));
    }
}
