//! Retention-ceiling compaction of the persisted statistics tables.
//!
//! Each table is compacted in its own IMMEDIATE transaction: the row count,
//! every DELETE batch and the commit see one consistent snapshot, and a
//! failure or cancellation leaves that table untouched. The other table is
//! still attempted.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::retention::RetentionPolicy;
use crate::error::{Error, Result};
use crate::jobs::{JobContext, ScheduledJobExecutor};
use crate::persisted_stats::{StatsTable, count_rows};
use crate::settings::ClusterSettings;
use crate::storage::Database;

/// Outcome of compacting one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableCompaction {
    pub table: StatsTable,
    pub rows_before: u64,
    pub rows_deleted: u64,
    pub rows_after: u64,
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    pub ceiling: u64,
    pub tables: Vec<TableCompaction>,
}

impl CompactionSummary {
    #[must_use]
    pub fn total_deleted(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_deleted).sum()
    }

    #[must_use]
    pub fn table(&self, table: StatsTable) -> Option<&TableCompaction> {
        self.tables.iter().find(|t| t.table == table)
    }
}

impl fmt::Display for CompactionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ceiling {}", self.ceiling)?;
        for t in &self.tables {
            write!(
                f,
                "; {}: {} -> {} ({} deleted)",
                t.table, t.rows_before, t.rows_after, t.rows_deleted
            )?;
        }
        Ok(())
    }
}

fn cancelled(table: StatsTable) -> Error {
    Error::Cancelled(format!("compaction of {table} rolled back"))
}

/// Compact a single table down to the policy ceiling.
///
/// Rows go oldest `aggregated_ts` first, ties broken by the row key.
pub fn compact_table(
    conn: &mut Connection,
    table: StatsTable,
    policy: &RetentionPolicy,
    cancel: &AtomicBool,
) -> Result<TableCompaction> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let rows_before = count_rows(&tx, table)?;
    let target = policy.deletion_target(rows_before);

    let delete_sql = format!(
        "DELETE FROM {name} WHERE rowid IN (
            SELECT rowid FROM {name} ORDER BY {order} LIMIT ?1
         )",
        name = table.table_name(),
        order = table.order_by()
    );

    let mut rows_deleted = 0u64;
    for batch in policy.batches(target) {
        if cancel.load(Ordering::SeqCst) {
            return Err(cancelled(table));
        }
        let limit = i64::try_from(batch).unwrap_or(i64::MAX);
        let deleted = tx.execute(&delete_sql, params![limit])?;
        rows_deleted += deleted as u64;
        debug!(table = %table, batch = deleted, "Deleted compaction batch");
        if deleted == 0 {
            break;
        }
    }

    if cancel.load(Ordering::SeqCst) {
        return Err(cancelled(table));
    }
    tx.commit()?;

    Ok(TableCompaction {
        table,
        rows_before,
        rows_deleted,
        rows_after: rows_before - rows_deleted,
    })
}

/// Compact every table, each in its own transaction.
///
/// All tables are attempted; the first error is returned.
pub fn compact_all(
    conn: &mut Connection,
    policy: &RetentionPolicy,
    cancel: &AtomicBool,
) -> Result<CompactionSummary> {
    let mut tables = Vec::with_capacity(StatsTable::ALL.len());
    let mut first_error = None;
    for table in StatsTable::ALL {
        match compact_table(conn, table, policy, cancel) {
            Ok(result) => {
                info!(
                    table = %table,
                    rows_before = result.rows_before,
                    rows_deleted = result.rows_deleted,
                    ceiling = policy.ceiling,
                    "Compacted persisted statistics"
                );
                tables.push(result);
            }
            Err(err) => {
                warn!(table = %table, error = %err, "Compaction of table failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(CompactionSummary {
            ceiling: policy.ceiling,
            tables,
        }),
    }
}

/// Task body of the compaction schedule.
#[derive(Debug, Clone)]
pub struct CompactionExecutor {
    db: Database,
    settings: ClusterSettings,
}

impl CompactionExecutor {
    #[must_use]
    pub fn new(db: Database, settings: ClusterSettings) -> Self {
        Self { db, settings }
    }

    /// Run one compaction. The retention ceiling is read fresh every time.
    pub async fn run(&self, cancel: Arc<AtomicBool>) -> Result<CompactionSummary> {
        let policy = RetentionPolicy::from_settings(&self.settings.snapshot().await?);
        let summary = self
            .db
            .call(move |conn| compact_all(conn, &policy, &cancel))
            .await?;
        info!(
            ceiling = summary.ceiling,
            rows_deleted = summary.total_deleted(),
            "Compaction run finished"
        );
        Ok(summary)
    }
}

#[async_trait]
impl ScheduledJobExecutor for CompactionExecutor {
    async fn execute(&self, ctx: &JobContext) -> Result<String> {
        let summary = self.run(Arc::clone(&ctx.cancel)).await?;
        Ok(summary.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persisted_stats::{
        StatementStatsRow, TransactionStatsRow, insert_statement_stats, insert_transaction_stats,
        list_buckets,
    };
    use crate::storage::make_test_db;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap() + chrono::TimeDelta::minutes(i64::from(minute))
    }

    fn insert_stmt(conn: &Connection, minute: u32, fingerprint_id: u64) {
        insert_statement_stats(
            conn,
            &StatementStatsRow {
                aggregated_ts: ts(minute),
                fingerprint_id,
                transaction_fingerprint_id: 1,
                plan_hash: 0,
                app_name: "app".to_string(),
                node_id: 1,
                agg_interval_secs: 60,
                metadata: json!({}),
                statistics: json!({}),
            },
        )
        .unwrap();
    }

    fn insert_txn(conn: &Connection, minute: u32, fingerprint_id: u64) {
        insert_transaction_stats(
            conn,
            &TransactionStatsRow {
                aggregated_ts: ts(minute),
                fingerprint_id,
                app_name: "app".to_string(),
                node_id: 1,
                agg_interval_secs: 60,
                metadata: json!({}),
                statistics: json!({}),
            },
        )
        .unwrap();
    }

    fn fingerprints(conn: &Connection, table: StatsTable) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT fingerprint_id FROM {} ORDER BY {}",
                table.table_name(),
                table.order_by()
            ))
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn deletes_oldest_rows_down_to_ceiling() {
        let mut conn = make_test_db();
        for minute in [30, 10, 50, 20, 40] {
            insert_stmt(&conn, minute, u64::from(minute));
        }
        let never = AtomicBool::new(false);
        let result = compact_table(
            &mut conn,
            StatsTable::Statement,
            &RetentionPolicy::new(2, 10),
            &never,
        )
        .unwrap();
        assert_eq!(result.rows_before, 5);
        assert_eq!(result.rows_deleted, 3);
        assert_eq!(result.rows_after, 2);
        assert_eq!(
            list_buckets(&conn, StatsTable::Statement).unwrap(),
            vec![ts(40), ts(50)]
        );
    }

    #[test]
    fn ceiling_at_or_above_count_is_noop() {
        let mut conn = make_test_db();
        for minute in 0..3 {
            insert_txn(&conn, minute, 1);
        }
        let never = AtomicBool::new(false);
        for ceiling in [3, 100] {
            let result = compact_table(
                &mut conn,
                StatsTable::Transaction,
                &RetentionPolicy::new(ceiling, 10),
                &never,
            )
            .unwrap();
            assert_eq!(result.rows_deleted, 0);
            assert_eq!(result.rows_after, 3);
        }
    }

    #[test]
    fn zero_ceiling_empties_table_in_batches() {
        let mut conn = make_test_db();
        for minute in 0..25 {
            insert_stmt(&conn, minute, 1);
        }
        let never = AtomicBool::new(false);
        let result = compact_table(
            &mut conn,
            StatsTable::Statement,
            &RetentionPolicy::new(0, 7),
            &never,
        )
        .unwrap();
        assert_eq!(result.rows_deleted, 25);
        assert_eq!(count_rows(&conn, StatsTable::Statement).unwrap(), 0);
    }

    #[test]
    fn ties_are_broken_by_key() {
        let mut conn = make_test_db();
        for fp in [3, 1, 2] {
            insert_stmt(&conn, 5, fp);
        }
        let never = AtomicBool::new(false);
        compact_table(
            &mut conn,
            StatsTable::Statement,
            &RetentionPolicy::new(1, 10),
            &never,
        )
        .unwrap();
        assert_eq!(
            fingerprints(&conn, StatsTable::Statement),
            vec![crate::persisted_stats::encode_fingerprint(3)]
        );
    }

    #[test]
    fn cancellation_rolls_back() {
        let mut conn = make_test_db();
        for minute in 0..10 {
            insert_stmt(&conn, minute, 1);
        }
        let cancel = AtomicBool::new(true);
        let err = compact_table(
            &mut conn,
            StatsTable::Statement,
            &RetentionPolicy::new(0, 3),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(count_rows(&conn, StatsTable::Statement).unwrap(), 10);
    }

    #[test]
    fn tables_are_compacted_independently() {
        let mut conn = make_test_db();
        for minute in 0..4 {
            insert_stmt(&conn, minute, 1);
            insert_txn(&conn, minute, 1);
        }
        conn.execute_batch("DROP TABLE statement_statistics").unwrap();

        let never = AtomicBool::new(false);
        let err = compact_all(&mut conn, &RetentionPolicy::new(1, 10), &never).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        // The transaction table was still brought under the ceiling.
        assert_eq!(count_rows(&conn, StatsTable::Transaction).unwrap(), 1);
    }

    #[test]
    fn summary_reports_both_tables() {
        let mut conn = make_test_db();
        for minute in 0..3 {
            insert_stmt(&conn, minute, 1);
            insert_txn(&conn, minute, 1);
        }
        let never = AtomicBool::new(false);
        let summary = compact_all(&mut conn, &RetentionPolicy::new(1, 10), &never).unwrap();
        assert_eq!(summary.total_deleted(), 4);
        assert_eq!(
            summary.table(StatsTable::Transaction).unwrap().rows_after,
            1
        );
        let text = summary.to_string();
        assert!(text.contains("statement_statistics: 3 -> 1"));
    }

    proptest! {
        #[test]
        fn retained_rows_are_the_most_recent(
            minutes in proptest::collection::btree_set(0u32..10_000, 0..60),
            ceiling in 0u64..80,
        ) {
            let mut conn = make_test_db();
            for minute in &minutes {
                insert_stmt(&conn, *minute, 1);
            }
            let never = AtomicBool::new(false);
            let result = compact_table(
                &mut conn,
                StatsTable::Statement,
                &RetentionPolicy::new(ceiling, 7),
                &never,
            ).unwrap();

            let total = minutes.len() as u64;
            let expected_kept = total.min(ceiling);
            prop_assert_eq!(result.rows_after, expected_kept);

            let kept = list_buckets(&conn, StatsTable::Statement).unwrap();
            let newest: Vec<DateTime<Utc>> = minutes
                .iter()
                .rev()
                .take(usize::try_from(expected_kept).unwrap())
                .rev()
                .map(|m| ts(*m))
                .collect();
            prop_assert_eq!(kept, newest);
        }
    }
}
