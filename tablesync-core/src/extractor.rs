//! `Extractor` — copies tables from SOURCE into REPLICA.
//!
//! Uses the same MySQL connection and `information_schema` query style
//! as the schema adapter, generalized from read-only metadata
//! collection into a batched, retried, rate-limited cross-server copy.

use std::time::Instant;

use crate::cancel::CancelHandle;
use crate::error::{Result, TableSyncError};
use crate::models::{
    ColumnValue, ExtractionStrategy, IncrementalStrategy, PhaseResult, Row, TableSpec,
    TrackingStatus,
};
use crate::pools::ConnectionPools;
use crate::schema::{ColumnDef, TableDefinition, bind_mysql, mysql_row_to_row, read_mysql_definition};
use crate::tracking::ReplicaTracking;

/// What to copy. Orthogonal to the size-selected load *method*, which
/// this extractor always expresses as `LIMIT`/`OFFSET` batching sized
/// by `TableSpec::batch_size`, applied uniformly regardless of table
/// size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    FullTable,
    Incremental,
    IncrementalChunked,
}

impl CopyStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CopyStrategy::FullTable => "full_table",
            CopyStrategy::Incremental => "incremental",
            CopyStrategy::IncrementalChunked => "incremental_chunked",
        }
    }

    pub fn resolve(spec: &TableSpec, force_full: bool) -> Self {
        if force_full || spec.incremental_columns.is_empty() {
            CopyStrategy::FullTable
        } else if spec.extraction_strategy == ExtractionStrategy::IncrementalChunked {
            CopyStrategy::IncrementalChunked
        } else {
            CopyStrategy::Incremental
        }
    }
}

/// SOURCE -> REPLICA copier. Holds borrowed pools only; never holds a
/// connection across a phase.
pub struct Extractor<'a> {
    pools: &'a ConnectionPools,
    tracking: ReplicaTracking<'a>,
}

impl<'a> Extractor<'a> {
    pub fn new(pools: &'a ConnectionPools) -> Self {
        Self {
            pools,
            tracking: ReplicaTracking::new(&pools.replica),
        }
    }

    /// Copies one table: resolves the strategy, rebuilds the REPLICA
    /// table if needed, then batches rows across in `batch_size` pages.
    ///
    /// Never returns `Err` for a per-table failure — every fallible step,
    /// including the initial tracking-row and schema reads, runs inside
    /// [`Self::copy_attempt`] so a missing-table or schema error comes
    /// back as a failed [`PhaseResult`] instead of escaping raw. Only
    /// cancellation propagates as `Err`.
    pub async fn copy(
        &self,
        spec: &TableSpec,
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Result<PhaseResult> {
        let start = Instant::now();
        match self.copy_attempt(spec, force_full, cancel, start).await {
            Ok(phase) => Ok(phase),
            Err(TableSyncError::Cancelled) => Err(TableSyncError::Cancelled),
            Err(e) => {
                let duration = start.elapsed().as_secs_f64();
                Ok(PhaseResult::failed("unresolved", duration, force_full, e.to_string()))
            }
        }
    }

    async fn copy_attempt(
        &self,
        spec: &TableSpec,
        force_full: bool,
        cancel: &CancelHandle,
        start: Instant,
    ) -> Result<PhaseResult> {
        self.tracking.ensure_row(&spec.name).await?;

        let source_def = self
            .pools
            .execute_with_retry(cancel, None, || {
                read_mysql_definition(&self.pools.source, &self.pools.source_database, &spec.name)
            })
            .await?;

        let mut strategy = CopyStrategy::resolve(spec, force_full);
        let mut force_full_applied = force_full;

        if strategy != CopyStrategy::FullTable {
            match read_mysql_definition(&self.pools.replica, &self.pools.replica_database, &spec.name)
                .await
            {
                Ok(replica_def) if replica_def.schema_hash() == source_def.schema_hash() => {}
                Ok(_) => {
                    tracing::warn!(
                        table = %spec.name,
                        "replica schema hash differs from source; rebuilding as full_table"
                    );
                    strategy = CopyStrategy::FullTable;
                    force_full_applied = true;
                }
                Err(_) => {
                    // replica table does not exist yet
                    strategy = CopyStrategy::FullTable;
                    force_full_applied = true;
                }
            }
        }

        match strategy {
            CopyStrategy::FullTable => {
                self.copy_full_table(spec, &source_def, cancel, start, force_full_applied).await
            }
            CopyStrategy::Incremental | CopyStrategy::IncrementalChunked => {
                self.copy_incremental(spec, &source_def, strategy, cancel, start, force_full_applied)
                    .await
            }
        }
    }

    async fn copy_full_table(
        &self,
        spec: &TableSpec,
        source_def: &TableDefinition,
        cancel: &CancelHandle,
        start: Instant,
        force_full_applied: bool,
    ) -> Result<PhaseResult> {
        self.recreate_replica_table(source_def, cancel).await?;

        let pagination_column = source_def
            .primary_key
            .first()
            .map_or(source_def.columns[0].name.as_str(), String::as_str);

        let (total, _) = self
            .batched_copy(spec, source_def, None, &[], pagination_column, None, cancel)
            .await?;

        let duration = start.elapsed().as_secs_f64();
        if total > 0 {
            self.tracking
                .update_progress(&spec.name, None, None, total, TrackingStatus::Success)
                .await?;
        }

        Ok(PhaseResult::ok(
            CopyStrategy::FullTable.as_str(),
            total,
            None,
            None,
            duration,
            force_full_applied,
        ))
    }

    async fn copy_incremental(
        &self,
        spec: &TableSpec,
        source_def: &TableDefinition,
        strategy: CopyStrategy,
        cancel: &CancelHandle,
        start: Instant,
        force_full_applied: bool,
    ) -> Result<PhaseResult> {
        let progress = self.tracking.read_progress(&spec.name).await?;
        let (where_sql, binds, tracking_column) = build_incremental_where(spec, &progress);

        let pagination_column = tracking_column
            .clone()
            .unwrap_or_else(|| spec.incremental_columns[0].clone());

        let (total, last_value) = self
            .batched_copy(
                spec,
                source_def,
                where_sql.as_deref(),
                &binds,
                &pagination_column,
                tracking_column.as_deref(),
                cancel,
            )
            .await?;

        let duration = start.elapsed().as_secs_f64();
        Ok(PhaseResult::ok(
            strategy.as_str(),
            total,
            tracking_column,
            last_value.as_ref().and_then(ColumnValue::to_tracking_string),
            duration,
            force_full_applied,
        ))
    }

    /// Drops and recreates the replica table from `source_def`, preserving
    /// the source column types verbatim (MySQL-family to MySQL-family:
    /// the source's own DDL is already valid for the replica).
    async fn recreate_replica_table(
        &self,
        source_def: &TableDefinition,
        cancel: &CancelHandle,
    ) -> Result<()> {
        let drop_sql = format!("DROP TABLE IF EXISTS `{}`", source_def.name);
        let create_sql = build_mysql_create_table_sql(source_def);

        self.pools
            .execute_with_retry(cancel, None, || async {
                sqlx::query(&drop_sql).execute(&self.pools.replica).await.map_err(|e| {
                    TableSyncError::ExtractQuery { table: source_def.name.clone(), context: e.to_string() }
                })?;
                sqlx::query(&create_sql).execute(&self.pools.replica).await.map_err(|e| {
                    TableSyncError::ExtractQuery { table: source_def.name.clone(), context: e.to_string() }
                })?;
                Ok(())
            })
            .await
    }

    /// Pages through SOURCE with `LIMIT`/`OFFSET`, inserting each batch
    /// into REPLICA and, when `tracking_column` is set, tracking the
    /// running max of that column across all processed rows.
    #[allow(clippy::too_many_arguments)]
    async fn batched_copy(
        &self,
        spec: &TableSpec,
        source_def: &TableDefinition,
        where_sql: Option<&str>,
        binds: &[String],
        pagination_column: &str,
        tracking_column: Option<&str>,
        cancel: &CancelHandle,
    ) -> Result<(u64, Option<ColumnValue>)> {
        let mut offset: u64 = 0;
        let mut total: u64 = 0;
        let mut last_value: Option<ColumnValue> = None;
        let batch_size = u64::from(spec.batch_size);

        loop {
            if cancel.is_cancelled() {
                return Err(TableSyncError::Cancelled);
            }

            let select_sql = format!(
                "SELECT * FROM `{}` {} ORDER BY `{pagination_column}` LIMIT {batch_size} OFFSET {offset}",
                source_def.name,
                where_sql.map(|w| format!("WHERE {w}")).unwrap_or_default(),
            );

            let rows = self
                .pools
                .execute_with_retry(cancel, Some(spec.performance_category), || async {
                    let mut query = sqlx::query(&select_sql);
                    for bind in binds {
                        query = query.bind(bind.as_str());
                    }
                    query.fetch_all(&self.pools.source).await.map_err(|e| {
                        TableSyncError::ExtractQuery { table: source_def.name.clone(), context: e.to_string() }
                    })
                })
                .await?;

            if rows.is_empty() {
                break;
            }
            let fetched = rows.len() as u64;

            let converted: Vec<Row> = rows
                .iter()
                .map(|r| mysql_row_to_row(r, &source_def.columns))
                .collect::<Result<_>>()?;

            if let Some(col) = tracking_column {
                for row in &converted {
                    if let Some(value) = row.get(col) {
                        last_value = Some(match &last_value {
                            Some(cur) => ColumnValue::partial_max(cur, value).clone(),
                            None => value.clone(),
                        });
                    }
                }
            }

            self.insert_batch_into_replica(source_def, &converted, cancel).await?;
            total += fetched;

            // Persist after every committed batch so a mid-run cancellation
            // leaves tracking at the last batch actually written.
            if tracking_column.is_some() {
                self.tracking
                    .update_progress(
                        &spec.name,
                        last_value.as_ref().and_then(ColumnValue::to_tracking_string).as_deref(),
                        tracking_column,
                        total,
                        TrackingStatus::Success,
                    )
                    .await?;
            }

            if fetched < batch_size {
                break;
            }
            offset += batch_size;
        }

        Ok((total, last_value))
    }

    async fn insert_batch_into_replica(
        &self,
        def: &TableDefinition,
        rows: &[Row],
        cancel: &CancelHandle,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = def.column_names();
        let col_list = columns.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ");
        let placeholder = format!("({})", vec!["?"; columns.len()].join(", "));
        let null = ColumnValue::Null;

        let max_rows = max_placeholders_per_statement(columns.len());
        for chunk in rows.chunks(max_rows) {
            let values_sql = vec![placeholder.clone(); chunk.len()].join(", ");
            let sql = format!("INSERT INTO `{}` ({col_list}) VALUES {values_sql}", def.name);
            self.pools
                .execute_with_retry(cancel, None, || async {
                    let mut query = sqlx::query(&sql);
                    for row in chunk {
                        for col in &columns {
                            let value = row.get(col).unwrap_or(&null);
                            query = bind_mysql(query, value);
                        }
                    }
                    query.execute(&self.pools.replica).await.map_err(|e| TableSyncError::ExtractInsert {
                        table: def.name.clone(),
                        context: e.to_string(),
                    })?;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }
}

/// MySQL caps prepared-statement placeholders at 65,535. Caps
/// rows-per-`INSERT` so `rows * columns` never crosses that, regardless
/// of the catalogued `batch_size`.
fn max_placeholders_per_statement(columns: usize) -> usize {
    const MYSQL_MAX_PLACEHOLDERS: usize = 65_535;
    (MYSQL_MAX_PLACEHOLDERS / columns.max(1)).max(1)
}

fn build_mysql_create_table_sql(def: &TableDefinition) -> String {
    let mut cols = Vec::with_capacity(def.columns.len());
    for c in &def.columns {
        let mut decl = format!("`{}` {}", c.name, mysql_column_ddl(c));
        if !c.nullable {
            decl.push_str(" NOT NULL");
        }
        cols.push(decl);
    }
    if !def.primary_key.is_empty() {
        let pk = def.primary_key.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ");
        cols.push(format!("PRIMARY KEY ({pk})"));
    }
    format!("CREATE TABLE `{}` ({})", def.name, cols.join(", "))
}

fn mysql_column_ddl(c: &ColumnDef) -> String {
    let lower = c.source_type.to_lowercase();
    if lower.contains("char") {
        format!("{} ({})", c.source_type, c.char_max_length.unwrap_or(255))
    } else if lower.contains("decimal") || lower.contains("numeric") {
        format!(
            "{} ({},{})",
            c.source_type,
            c.numeric_precision.unwrap_or(20),
            c.numeric_scale.unwrap_or(4)
        )
    } else {
        c.source_type.clone()
    }
}

/// Builds the incremental WHERE clause per `incremental_strategy`.
/// Returns the SQL fragment (placeholders only, no `WHERE` keyword),
/// its positional text binds in source order, and the column tracking
/// should advance (the primary incremental column when set, else the
/// first incremental column).
///
/// `or_logic`/`and_logic` compare every non-primary incremental column
/// against the prior run's last load timestamp, since tracking persists
/// only one cutoff value (the primary column's), not one per
/// incremental column.
pub(crate) fn build_incremental_where(
    spec: &TableSpec,
    progress: &crate::models::TrackingRow,
) -> (Option<String>, Vec<String>, Option<String>) {
    let tracking_column = spec.primary_column().map(str::to_string);
    let primary_cutoff = progress.last_primary_value.clone();
    let fallback_cutoff = progress.last_processed.map(|t| t.to_rfc3339());

    match spec.incremental_strategy {
        IncrementalStrategy::SingleColumn => {
            let Some(column) = tracking_column.clone() else {
                return (None, Vec::new(), None);
            };
            match primary_cutoff {
                Some(cutoff) => (Some(format!("`{column}` > ?")), vec![cutoff], Some(column)),
                None => (None, Vec::new(), Some(column)),
            }
        }
        IncrementalStrategy::OrLogic | IncrementalStrategy::AndLogic => {
            let joiner = if spec.incremental_strategy == IncrementalStrategy::OrLogic {
                " OR "
            } else {
                tracing::warn!(
                    table = %spec.name,
                    "and_logic combination strategy in use; every incremental column \
                     must advance past its cutoff in the same run or rows are skipped"
                );
                " AND "
            };
            let mut clauses = Vec::new();
            let mut binds = Vec::new();
            for column in &spec.incremental_columns {
                let cutoff = if Some(column) == tracking_column.as_ref() {
                    primary_cutoff.clone()
                } else {
                    fallback_cutoff.clone()
                };
                let Some(cutoff) = cutoff else { continue };
                clauses.push(format!("`{column}` > ?"));
                binds.push(cutoff);
            }
            if clauses.is_empty() {
                (None, Vec::new(), tracking_column)
            } else {
                (Some(format!("({})", clauses.join(joiner))), binds, tracking_column)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{PerformanceCategory, ProcessingPriority, TrackingRow};
    use chrono::Utc;

    fn spec(strategy: IncrementalStrategy, columns: &[&str], primary: Option<&str>) -> TableSpec {
        TableSpec {
            name: "adj".into(),
            extraction_strategy: ExtractionStrategy::Incremental,
            incremental_columns: columns.iter().map(|s| s.to_string()).collect(),
            primary_incremental_column: primary.map(str::to_string),
            incremental_strategy: strategy,
            primary_key: vec!["AdjNum".into()],
            batch_size: 1000,
            performance_category: PerformanceCategory::Small,
            processing_priority: ProcessingPriority::Medium,
            estimated_rows: 1000,
            estimated_size_mb: 1.0,
            time_gap_threshold_days: 30,
        }
    }

    #[test]
    fn copy_strategy_resolves_full_when_forced() {
        let s = spec(IncrementalStrategy::SingleColumn, &["DateTEntry"], Some("DateTEntry"));
        assert_eq!(CopyStrategy::resolve(&s, true), CopyStrategy::FullTable);
    }

    #[test]
    fn copy_strategy_resolves_full_when_no_incremental_columns() {
        let mut s = spec(IncrementalStrategy::SingleColumn, &[], None);
        s.extraction_strategy = ExtractionStrategy::FullTable;
        assert_eq!(CopyStrategy::resolve(&s, false), CopyStrategy::FullTable);
    }

    #[test]
    fn copy_strategy_resolves_incremental_chunked() {
        let mut s = spec(IncrementalStrategy::SingleColumn, &["DateTEntry"], Some("DateTEntry"));
        s.extraction_strategy = ExtractionStrategy::IncrementalChunked;
        assert_eq!(CopyStrategy::resolve(&s, false), CopyStrategy::IncrementalChunked);
    }

    #[test]
    fn max_placeholders_per_statement_stays_under_the_mysql_limit() {
        let columns = 66;
        let rows = max_placeholders_per_statement(columns);
        assert!(rows * columns <= 65_535);
        assert!(rows >= 1);
    }

    #[test]
    fn max_placeholders_per_statement_handles_a_single_column_table() {
        assert_eq!(max_placeholders_per_statement(1), 65_535);
    }

    #[test]
    fn single_column_where_uses_primary_cutoff() {
        let s = spec(IncrementalStrategy::SingleColumn, &["DateTEntry"], Some("DateTEntry"));
        let mut progress = TrackingRow::pending("adj");
        progress.last_primary_value = Some("2026-01-01T00:00:00Z".into());
        let (where_sql, binds, tracking_col) = build_incremental_where(&s, &progress);
        assert_eq!(where_sql.as_deref(), Some("`DateTEntry` > ?"));
        assert_eq!(binds, vec!["2026-01-01T00:00:00Z"]);
        assert_eq!(tracking_col.as_deref(), Some("DateTEntry"));
    }

    #[test]
    fn or_logic_combines_primary_and_fallback_cutoffs() {
        // S2: adj has SecDateTEdit + AdjDate under or_logic, no declared
        // primary_incremental_column; both compare against last run time.
        let s = spec(IncrementalStrategy::OrLogic, &["SecDateTEdit", "AdjDate"], None);
        let mut progress = TrackingRow::pending("adj");
        progress.last_processed = Some(Utc::now());
        let (where_sql, binds, _) = build_incremental_where(&s, &progress);
        let where_sql = where_sql.expect("or_logic with a known cutoff yields a WHERE clause");
        assert!(where_sql.contains("SecDateTEdit"));
        assert!(where_sql.contains("AdjDate"));
        assert!(where_sql.contains(" OR "));
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn and_logic_joins_with_and() {
        let s = spec(IncrementalStrategy::AndLogic, &["Col1", "Col2"], Some("Col1"));
        let mut progress = TrackingRow::pending("t");
        progress.last_primary_value = Some("5".into());
        progress.last_processed = Some(Utc::now());
        let (where_sql, _, _) = build_incremental_where(&s, &progress);
        assert!(where_sql.unwrap().contains(" AND "));
    }

    #[test]
    fn no_prior_progress_yields_unconditional_first_run() {
        let s = spec(IncrementalStrategy::SingleColumn, &["DateTEntry"], Some("DateTEntry"));
        let progress = TrackingRow::pending("adj");
        let (where_sql, binds, tracking_col) = build_incremental_where(&s, &progress);
        assert!(where_sql.is_none());
        assert!(binds.is_empty());
        assert_eq!(tracking_col.as_deref(), Some("DateTEntry"));
    }
}
