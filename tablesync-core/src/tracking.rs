//! `TrackingStore` — durable per-table progress.
//!
//! The REPLICA side (`etl_copy_status`) lives in the MySQL-family
//! replica; the ANALYTICS side (`etl_load_status`) lives in the
//! Postgres-family warehouse under the `raw` schema. Both sides share
//! the same conceptual shape (`TrackingRow`) but are persisted with
//! engine-specific upsert SQL, using the same `sqlx::Row` decoding
//! style as the `information_schema`-backed reads elsewhere, applied to
//! a small purpose-built tracking table instead of schema introspection.

use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, PgPool, Row as SqlxRow};

use crate::error::{Result, TableSyncError};
use crate::models::{TrackingRow, TrackingStatus};

/// DDL for the REPLICA-side tracking table. Run once by the
/// (out-of-scope) tracking-table bootstrap script; the core only ever
/// selects/upserts against it.
pub const ETL_COPY_STATUS_DDL: &str = r"
CREATE TABLE IF NOT EXISTS etl_copy_status (
    id                  BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
    table_name          VARCHAR(255) NOT NULL UNIQUE,
    last_copied         DATETIME NULL,
    last_primary_value  TEXT NULL,
    primary_column_name VARCHAR(255) NULL,
    rows_copied         BIGINT UNSIGNED NOT NULL DEFAULT 0,
    copy_status         VARCHAR(32) NOT NULL DEFAULT 'pending',
    created_at          DATETIME NOT NULL,
    updated_at          DATETIME NOT NULL,
    INDEX idx_etl_copy_status_table_name (table_name),
    INDEX idx_etl_copy_status_last_copied (last_copied)
)";

/// DDL for the ANALYTICS-side tracking table.
pub const ETL_LOAD_STATUS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS raw.etl_load_status (
    id                  SERIAL PRIMARY KEY,
    table_name          TEXT NOT NULL UNIQUE,
    last_loaded         TIMESTAMPTZ NULL,
    last_primary_value  TEXT NULL,
    primary_column_name TEXT NULL,
    rows_loaded         BIGINT NOT NULL DEFAULT 0,
    load_status         TEXT NOT NULL DEFAULT 'pending',
    loaded_at           TIMESTAMPTZ NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_etl_load_status_table_name ON raw.etl_load_status (table_name);
CREATE INDEX IF NOT EXISTS idx_etl_load_status_last_loaded ON raw.etl_load_status (last_loaded);
"#;

/// Snapshot handed to monitoring collaborators: per-phase counts,
/// durations, and last-updated timestamps.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub table_name: String,
    pub copy_status: Option<TrackingStatus>,
    pub rows_copied: u64,
    pub last_copied: Option<DateTime<Utc>>,
    pub load_status: Option<TrackingStatus>,
    pub rows_loaded: u64,
    pub last_loaded: Option<DateTime<Utc>>,
}

fn row_from_replica(row: &sqlx::mysql::MySqlRow) -> TrackingRow {
    TrackingRow {
        table_name: row.get("table_name"),
        last_processed: row.get("last_copied"),
        last_primary_value: row.get("last_primary_value"),
        primary_column_name: row.get("primary_column_name"),
        rows_processed: row.get::<i64, _>("rows_copied").max(0) as u64,
        status: TrackingStatus::parse(&row.get::<String, _>("copy_status")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_from_analytics(row: &sqlx::postgres::PgRow) -> TrackingRow {
    TrackingRow {
        table_name: row.get("table_name"),
        last_processed: row.get("last_loaded"),
        last_primary_value: row.get("last_primary_value"),
        primary_column_name: row.get("primary_column_name"),
        rows_processed: row.get::<i64, _>("rows_loaded").max(0) as u64,
        status: TrackingStatus::parse(&row.get::<String, _>("load_status")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// REPLICA-side tracking operations (`etl_copy_status`).
pub struct ReplicaTracking<'a> {
    pool: &'a MySqlPool,
}

impl<'a> ReplicaTracking<'a> {
    pub fn new(pool: &'a MySqlPool) -> Self {
        Self { pool }
    }

    /// Create-or-ignore a `status=pending` row.
    pub async fn ensure_row(&self, table_name: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO etl_copy_status (table_name, rows_copied, copy_status, created_at, updated_at)
            VALUES (?, 0, 'pending', NOW(), NOW())
            ON DUPLICATE KEY UPDATE table_name = table_name
            ",
        )
        .bind(table_name)
        .execute(self.pool)
        .await
        .map_err(|e| TableSyncError::ExtractInsert {
            table: table_name.to_string(),
            context: format!("ensure_row: {e}"),
        })?;
        Ok(())
    }

    pub async fn read_progress(&self, table_name: &str) -> Result<TrackingRow> {
        let row = sqlx::query("SELECT * FROM etl_copy_status WHERE table_name = ?")
            .bind(table_name)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| TableSyncError::ExtractQuery {
                table: table_name.to_string(),
                context: e.to_string(),
            })?;

        match row {
            Some(r) => Ok(row_from_replica(&r)),
            None => Ok(TrackingRow::pending(table_name)),
        }
    }

    /// Single-statement idempotent upsert.
    pub async fn update_progress(
        &self,
        table_name: &str,
        last_primary_value: Option<&str>,
        primary_column: Option<&str>,
        rows: u64,
        status: TrackingStatus,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO etl_copy_status
                (table_name, last_copied, last_primary_value, primary_column_name,
                 rows_copied, copy_status, created_at, updated_at)
            VALUES (?, NOW(), ?, ?, ?, ?, NOW(), NOW())
            ON DUPLICATE KEY UPDATE
                last_copied = NOW(),
                last_primary_value = VALUES(last_primary_value),
                primary_column_name = VALUES(primary_column_name),
                rows_copied = VALUES(rows_copied),
                copy_status = VALUES(copy_status),
                updated_at = NOW()
            ",
        )
        .bind(table_name)
        .bind(last_primary_value)
        .bind(primary_column)
        .bind(rows as i64)
        .bind(status.as_str())
        .execute(self.pool)
        .await
        .map_err(|e| TableSyncError::ExtractInsert {
            table: table_name.to_string(),
            context: format!("update_progress: {e}"),
        })?;
        Ok(())
    }

    pub async fn row_count(&self, table_name: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{table_name}`"))
            .fetch_one(self.pool)
            .await
            .map_err(|e| TableSyncError::ExtractQuery {
                table: table_name.to_string(),
                context: e.to_string(),
            })?;
        Ok(count.max(0) as u64)
    }
}

/// ANALYTICS-side tracking operations (`raw.etl_load_status`).
pub struct AnalyticsTracking<'a> {
    pool: &'a PgPool,
    schema: &'a str,
}

impl<'a> AnalyticsTracking<'a> {
    pub fn new(pool: &'a PgPool, schema: &'a str) -> Self {
        Self { pool, schema }
    }

    pub async fn ensure_row(&self, table_name: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO raw.etl_load_status (table_name, rows_loaded, load_status, created_at, updated_at)
            VALUES ($1, 0, 'pending', now(), now())
            ON CONFLICT (table_name) DO NOTHING
            ",
        )
        .bind(table_name)
        .execute(self.pool)
        .await
        .map_err(|e| TableSyncError::LoadInsert {
            table: table_name.to_string(),
            context: format!("ensure_row: {e}"),
        })?;
        Ok(())
    }

    pub async fn read_progress(&self, table_name: &str) -> Result<TrackingRow> {
        let row = sqlx::query("SELECT * FROM raw.etl_load_status WHERE table_name = $1")
            .bind(table_name)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| TableSyncError::LoadQuery {
                table: table_name.to_string(),
                context: e.to_string(),
            })?;

        match row {
            Some(r) => Ok(row_from_analytics(&r)),
            None => Ok(TrackingRow::pending(table_name)),
        }
    }

    /// Single-statement idempotent upsert.
    pub async fn update_progress(
        &self,
        table_name: &str,
        last_primary_value: Option<&str>,
        primary_column: Option<&str>,
        rows: u64,
        status: TrackingStatus,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO raw.etl_load_status
                (table_name, last_loaded, last_primary_value, primary_column_name,
                 rows_loaded, load_status, loaded_at, created_at, updated_at)
            VALUES ($1, now(), $2, $3, $4, $5, now(), now(), now())
            ON CONFLICT (table_name) DO UPDATE SET
                last_loaded = now(),
                last_primary_value = EXCLUDED.last_primary_value,
                primary_column_name = EXCLUDED.primary_column_name,
                rows_loaded = EXCLUDED.rows_loaded,
                load_status = EXCLUDED.load_status,
                loaded_at = now(),
                updated_at = now()
            ",
        )
        .bind(table_name)
        .bind(last_primary_value)
        .bind(primary_column)
        .bind(rows as i64)
        .bind(status.as_str())
        .execute(self.pool)
        .await
        .map_err(|e| TableSyncError::LoadInsert {
            table: table_name.to_string(),
            context: format!("update_progress: {e}"),
        })?;
        Ok(())
    }

    pub async fn row_count(&self, table_name: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\".\"{table_name}\"", self.schema))
                .fetch_one(self.pool)
                .await
                .map_err(|e| TableSyncError::LoadQuery {
                    table: table_name.to_string(),
                    context: e.to_string(),
                })?;
        Ok(count.max(0) as u64)
    }

    /// Monitoring snapshot for one table, joining both tracking sides.
    pub async fn snapshot(
        &self,
        replica: &ReplicaTracking<'_>,
        table_name: &str,
    ) -> Result<TableSnapshot> {
        let copy = replica.read_progress(table_name).await.ok();
        let load = self.read_progress(table_name).await?;
        Ok(TableSnapshot {
            table_name: table_name.to_string(),
            copy_status: copy.as_ref().map(|r| r.status),
            rows_copied: copy.as_ref().map(|r| r.rows_processed).unwrap_or(0),
            last_copied: copy.and_then(|r| r.last_processed),
            load_status: Some(load.status),
            rows_loaded: load.rows_processed,
            last_loaded: load.last_processed,
        })
    }

    /// Monitoring snapshot for every named table: per-phase counts,
    /// durations, and last-updated timestamps. A table whose ANALYTICS
    /// read fails is skipped
    /// rather than failing the whole batch — one bad row shouldn't hide
    /// the rest of the fleet from an operator running `status`.
    pub async fn snapshot_all(
        &self,
        replica: &ReplicaTracking<'_>,
        table_names: &[&str],
    ) -> Vec<TableSnapshot> {
        let mut snapshots = Vec::with_capacity(table_names.len());
        for name in table_names {
            match self.snapshot(replica, name).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(table = %name, error = %e, "skipping table in status snapshot"),
            }
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_defaults_when_no_copy_row() {
        // Pure-logic check on the struct's field semantics; the async
        // paths that hit real pools are covered by the testcontainers
        // integration suite in tests/.
        let snapshot = TableSnapshot {
            table_name: "ref_tiny".into(),
            copy_status: None,
            rows_copied: 0,
            last_copied: None,
            load_status: Some(TrackingStatus::Success),
            rows_loaded: 3,
            last_loaded: None,
        };
        assert!(snapshot.copy_status.is_none());
        assert_eq!(snapshot.rows_loaded, 3);
    }
}
