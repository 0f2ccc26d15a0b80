//! Persisted statement and transaction statistics.
//!
//! The in-memory collector that produces these rows is not part of this
//! crate; [`insert_statement_stats`] and [`insert_transaction_stats`] are the
//! flush path it would call. Compaction only ever needs the key columns and
//! `aggregated_ts`; metrics payloads are opaque JSON.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::storage::{required_ts, to_epoch_ms};

/// One of the two persisted statistics tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsTable {
    Statement,
    Transaction,
}

impl StatsTable {
    pub const ALL: [Self; 2] = [Self::Statement, Self::Transaction];

    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Statement => "statement_statistics",
            Self::Transaction => "transaction_statistics",
        }
    }

    /// Deletion order: oldest bucket first, then the row key.
    #[must_use]
    pub const fn order_by(self) -> &'static str {
        match self {
            Self::Statement => {
                "aggregated_ts ASC, fingerprint_id ASC, transaction_fingerprint_id ASC, \
                 plan_hash ASC, app_name ASC, node_id ASC"
            }
            Self::Transaction => "aggregated_ts ASC, fingerprint_id ASC, app_name ASC, node_id ASC",
        }
    }
}

impl fmt::Display for StatsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Persisted statistics for one statement fingerprint in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementStatsRow {
    pub aggregated_ts: DateTime<Utc>,
    pub fingerprint_id: u64,
    pub transaction_fingerprint_id: u64,
    pub plan_hash: u64,
    pub app_name: String,
    pub node_id: i64,
    pub agg_interval_secs: i64,
    pub metadata: serde_json::Value,
    pub statistics: serde_json::Value,
}

/// Persisted statistics for one transaction fingerprint in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStatsRow {
    pub aggregated_ts: DateTime<Utc>,
    pub fingerprint_id: u64,
    pub app_name: String,
    pub node_id: i64,
    pub agg_interval_secs: i64,
    pub metadata: serde_json::Value,
    pub statistics: serde_json::Value,
}

/// Fingerprints are stored as fixed-width hex so they sort like the integers.
#[must_use]
pub fn encode_fingerprint(id: u64) -> String {
    format!("{id:016x}")
}

/// Insert or merge a statement statistics row.
pub fn insert_statement_stats(conn: &Connection, row: &StatementStatsRow) -> Result<()> {
    conn.execute(
        "INSERT INTO statement_statistics (
            aggregated_ts, fingerprint_id, transaction_fingerprint_id, plan_hash,
            app_name, node_id, agg_interval_secs, metadata, statistics
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(aggregated_ts, fingerprint_id, transaction_fingerprint_id, plan_hash, app_name, node_id)
         DO UPDATE SET metadata = excluded.metadata, statistics = excluded.statistics",
        params![
            to_epoch_ms(row.aggregated_ts),
            encode_fingerprint(row.fingerprint_id),
            encode_fingerprint(row.transaction_fingerprint_id),
            encode_fingerprint(row.plan_hash),
            row.app_name,
            row.node_id,
            row.agg_interval_secs,
            row.metadata.to_string(),
            row.statistics.to_string(),
        ],
    )?;
    Ok(())
}

/// Insert or merge a transaction statistics row.
pub fn insert_transaction_stats(conn: &Connection, row: &TransactionStatsRow) -> Result<()> {
    conn.execute(
        "INSERT INTO transaction_statistics (
            aggregated_ts, fingerprint_id, app_name, node_id,
            agg_interval_secs, metadata, statistics
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(aggregated_ts, fingerprint_id, app_name, node_id)
         DO UPDATE SET metadata = excluded.metadata, statistics = excluded.statistics",
        params![
            to_epoch_ms(row.aggregated_ts),
            encode_fingerprint(row.fingerprint_id),
            row.app_name,
            row.node_id,
            row.agg_interval_secs,
            row.metadata.to_string(),
            row.statistics.to_string(),
        ],
    )?;
    Ok(())
}

/// Number of rows in `table`.
pub fn count_rows(conn: &Connection, table: StatsTable) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table.table_name()),
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Aggregation bucket of every row in deletion order.
pub fn list_buckets(conn: &Connection, table: StatsTable) -> Result<Vec<DateTime<Utc>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT aggregated_ts FROM {} ORDER BY {}",
        table.table_name(),
        table.order_by()
    ))?;
    let rows = stmt.query_map([], |row| required_ts(0, row.get(0)?))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Rows written by [`seed_synthetic`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub statement_rows: u64,
    pub transaction_rows: u64,
}

/// Write `fingerprints` statement and transaction rows into each of
/// `buckets` hourly buckets ending at `latest`.
pub fn seed_synthetic(
    conn: &mut Connection,
    latest: DateTime<Utc>,
    buckets: u32,
    fingerprints: u32,
) -> Result<SeedSummary> {
    let tx = conn.transaction()?;
    let mut summary = SeedSummary::default();
    for bucket in 0..buckets {
        let aggregated_ts = latest - TimeDelta::hours(i64::from(bucket));
        for fp in 0..fingerprints {
            let fingerprint_id = 0x5eed_0000_u64 + u64::from(fp);
            let statistics = json!({
                "count": u64::from(fp) + 1,
                "service_lat_ms": f64::from(fp).mul_add(0.5, 1.0),
            });
            insert_statement_stats(
                &tx,
                &StatementStatsRow {
                    aggregated_ts,
                    fingerprint_id,
                    transaction_fingerprint_id: fingerprint_id ^ 0xff,
                    plan_hash: 0,
                    app_name: "seed".to_string(),
                    node_id: 1,
                    agg_interval_secs: 3_600,
                    metadata: json!({ "query": format!("SELECT {fp}") }),
                    statistics: statistics.clone(),
                },
            )?;
            insert_transaction_stats(
                &tx,
                &TransactionStatsRow {
                    aggregated_ts,
                    fingerprint_id: fingerprint_id ^ 0xff,
                    app_name: "seed".to_string(),
                    node_id: 1,
                    agg_interval_secs: 3_600,
                    metadata: json!({ "stmt_fingerprint_ids": [encode_fingerprint(fingerprint_id)] }),
                    statistics,
                },
            )?;
            summary.statement_rows += 1;
            summary.transaction_rows += 1;
        }
    }
    tx.commit()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::make_test_db;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, hour, 0, 0).unwrap()
    }

    fn stmt_row(hour: u32, fingerprint_id: u64) -> StatementStatsRow {
        StatementStatsRow {
            aggregated_ts: ts(hour),
            fingerprint_id,
            transaction_fingerprint_id: 7,
            plan_hash: 0,
            app_name: "app".to_string(),
            node_id: 1,
            agg_interval_secs: 3_600,
            metadata: json!({}),
            statistics: json!({ "count": 1 }),
        }
    }

    #[test]
    fn insert_upserts_on_key() {
        let conn = make_test_db();
        insert_statement_stats(&conn, &stmt_row(1, 1)).unwrap();
        let mut again = stmt_row(1, 1);
        again.statistics = json!({ "count": 2 });
        insert_statement_stats(&conn, &again).unwrap();
        assert_eq!(count_rows(&conn, StatsTable::Statement).unwrap(), 1);

        let stored: String = conn
            .query_row("SELECT statistics FROM statement_statistics", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stored, r#"{"count":2}"#);
    }

    #[test]
    fn buckets_list_oldest_first() {
        let conn = make_test_db();
        for hour in [5, 1, 3] {
            insert_statement_stats(&conn, &stmt_row(hour, 1)).unwrap();
        }
        let buckets = list_buckets(&conn, StatsTable::Statement).unwrap();
        assert_eq!(buckets, vec![ts(1), ts(3), ts(5)]);
    }

    #[test]
    fn fingerprints_sort_numerically() {
        assert!(encode_fingerprint(9) < encode_fingerprint(10));
        assert!(encode_fingerprint(u64::MAX - 1) < encode_fingerprint(u64::MAX));
    }

    #[test]
    fn seed_fills_both_tables() {
        let mut conn = make_test_db();
        let summary = seed_synthetic(&mut conn, ts(12), 3, 4).unwrap();
        assert_eq!(summary.statement_rows, 12);
        assert_eq!(summary.transaction_rows, 12);
        assert_eq!(count_rows(&conn, StatsTable::Statement).unwrap(), 12);
        assert_eq!(count_rows(&conn, StatsTable::Transaction).unwrap(), 12);
        let buckets = list_buckets(&conn, StatsTable::Transaction).unwrap();
        assert_eq!(buckets.first(), Some(&ts(10)));
        assert_eq!(buckets.last(), Some(&ts(12)));
    }
}
