//! `Loader` — REPLICA -> ANALYTICS, the hardest subsystem.
//!
//! Five size-adaptive methods (standard/streaming/chunked/copy_bulk/
//! parallel) share one preflight, one upsert emission path, and one
//! stale-state recovery wrapper around a [`LoadPrep`] record. Builds on
//! the same Postgres connection/session handling as the schema
//! adapter, generalized from read-only collection into a batched
//! upsert writer.

use std::time::Instant;

use futures::future::join_all;

use crate::cancel::CancelHandle;
use crate::error::{Result, TableSyncError};
use crate::extractor::build_incremental_where;
use crate::models::{ColumnValue, PhaseResult, Row, TableSpec, TrackingStatus};
use crate::pools::ConnectionPools;
use crate::schema::{SchemaAdapter, TableDefinition, TargetSchema, bind_postgres, mysql_row_to_row, sample_integer_range};
use crate::tracking::{AnalyticsTracking, ReplicaTracking};

const STANDARD_BATCH: u32 = 10_000;
const STREAMING_BATCH: u32 = 10_000;
const CHUNKED_BATCH: u32 = 25_000;
const DEFAULT_WORKERS: usize = 5;
/// Tolerance for the post-load row-count verification: reports but
/// does not fail when the difference between REPLICA and ANALYTICS row
/// counts is within 0.1%.
const VERIFY_TOLERANCE: f64 = 0.001;

/// How a table is loaded, chosen by size. Boundaries are strict `>`:
/// `estimated_size_mb == 50.0` stays `streaming`, not `standard`;
/// `estimated_rows == 1_000_000` does not route to `parallel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMethod {
    Standard,
    Streaming,
    Chunked,
    CopyBulk,
    Parallel,
}

impl LoadMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMethod::Standard => "standard",
            LoadMethod::Streaming => "streaming",
            LoadMethod::Chunked => "chunked",
            LoadMethod::CopyBulk => "copy_bulk",
            LoadMethod::Parallel => "parallel",
        }
    }

    pub fn resolve(spec: &TableSpec) -> Self {
        if spec.estimated_rows > 1_000_000 {
            LoadMethod::Parallel
        } else if spec.estimated_size_mb > 500.0 {
            LoadMethod::CopyBulk
        } else if spec.estimated_size_mb > 200.0 {
            LoadMethod::Chunked
        } else if spec.estimated_size_mb > 50.0 {
            LoadMethod::Streaming
        } else {
            LoadMethod::Standard
        }
    }
}

/// Everything a load method needs to run: the resolved column/type
/// mapping, the query shape, and the column the batch loop orders by.
/// Built once per `Load` call; the stale-state recovery wrapper clones
/// it and clears the WHERE clause to retry unconditionally.
#[derive(Clone)]
struct LoadPrep {
    definition: TableDefinition,
    target: TargetSchema,
    target_columns: Vec<String>,
    where_sql: Option<String>,
    binds: Vec<String>,
    pagination_column: String,
    tracking_column: Option<String>,
}

/// REPLICA -> ANALYTICS loader. Holds borrowed pools and a
/// [`SchemaAdapter`] wired to read column definitions from REPLICA
/// (not a true upstream source — the replica's `information_schema` is
/// this subsystem's "source of truth" for what to load).
pub struct Loader<'a> {
    pools: &'a ConnectionPools,
    schema: SchemaAdapter<'a>,
    tracking: AnalyticsTracking<'a>,
    replica_tracking: ReplicaTracking<'a>,
}

impl<'a> Loader<'a> {
    pub fn new(pools: &'a ConnectionPools) -> Self {
        Self {
            pools,
            schema: SchemaAdapter::new(
                &pools.replica,
                &pools.replica,
                &pools.analytics,
                pools.replica_database.clone(),
                pools.analytics_schema.as_str(),
            ),
            tracking: AnalyticsTracking::new(&pools.analytics, pools.analytics_schema.as_str()),
            replica_tracking: ReplicaTracking::new(&pools.replica),
        }
    }

    /// Loads one table: preflight, stale-state recovery check, strategy
    /// dispatch, then post-load row-count verification.
    ///
    /// Never returns `Err` for a per-table failure — every fallible
    /// step, including `EnsureRow`, runs inside [`Self::load_inner`] so
    /// it comes back as a failed [`PhaseResult`] instead of escaping
    /// raw. Only cancellation propagates as `Err`.
    pub async fn load(&self, spec: &TableSpec, force_full: bool, cancel: &CancelHandle) -> Result<PhaseResult> {
        let start = Instant::now();
        match self.load_inner(spec, force_full, cancel).await {
            Ok(phase) => Ok(phase),
            Err(TableSyncError::Cancelled) => Err(TableSyncError::Cancelled),
            Err(e) => {
                let duration = start.elapsed().as_secs_f64();
                Ok(PhaseResult::failed("unresolved", duration, force_full, e.to_string()))
            }
        }
    }

    async fn load_inner(&self, spec: &TableSpec, force_full: bool, cancel: &CancelHandle) -> Result<PhaseResult> {
        let start = Instant::now();
        self.tracking.ensure_row(&spec.name).await?;
        let definition = self.schema.read_source_definition(&spec.name).await?;
        let target = self.schema.resolve_target_schema(&definition, true).await;
        self.schema.ensure_target(&target).await?;
        let target_columns = self.schema.target_columns(&target);

        let method = LoadMethod::resolve(spec);
        let has_valid_incremental = !spec.incremental_columns.is_empty();

        let (where_sql, binds, tracking_column) = if force_full || !has_valid_incremental {
            (None, Vec::new(), spec.primary_column().map(str::to_string))
        } else {
            let progress = self.tracking.read_progress(&spec.name).await?;
            build_incremental_where(spec, &progress)
        };

        let pagination_column = tracking_column
            .clone()
            .or_else(|| definition.primary_key.first().cloned())
            .unwrap_or_else(|| definition.columns[0].name.clone());

        let prep = LoadPrep {
            definition,
            target,
            target_columns,
            where_sql,
            binds,
            pagination_column,
            tracking_column,
        };

        let mut force_full_applied = force_full || prep.where_sql.is_none();
        let (mut total, mut last_value) = self.execute_strategy(spec, method, &prep, cancel).await?;
        let mut strategy_used = method.as_str().to_string();

        if total == 0 {
            let replica_count = self.replica_tracking.row_count(&spec.name).await?;
            let analytics_count = self.tracking.row_count(&spec.name).await?;
            if replica_count > analytics_count {
                tracing::warn!(
                    table = %spec.name,
                    replica_count,
                    analytics_count,
                    "stale-state recovery: incremental load query returned zero rows but the \
                     target is behind the replica; rebuilding as an unconditional select"
                );
                let mut recovery_prep = prep.clone();
                recovery_prep.where_sql = None;
                recovery_prep.binds = Vec::new();
                let (rows, lv) = self.execute_strategy(spec, method, &recovery_prep, cancel).await?;
                total = rows;
                last_value = lv;
                force_full_applied = true;
                strategy_used = format!("{}_recovered", method.as_str());
            }
        }

        if total > 0 {
            self.tracking
                .update_progress(
                    &spec.name,
                    last_value.as_ref().and_then(ColumnValue::to_tracking_string).as_deref(),
                    prep.tracking_column.as_deref(),
                    total,
                    TrackingStatus::Success,
                )
                .await?;
        }

        self.verify_row_counts(&spec.name).await;

        let duration = start.elapsed().as_secs_f64();
        Ok(PhaseResult::ok(
            strategy_used,
            total,
            prep.tracking_column,
            last_value.as_ref().and_then(ColumnValue::to_tracking_string),
            duration,
            force_full_applied,
        ))
    }

    /// Spec §4.6 "Verification": compares row counts and reports (never
    /// fails the phase) when the divergence exceeds tolerance.
    async fn verify_row_counts(&self, table_name: &str) {
        let Ok(replica_count) = self.replica_tracking.row_count(table_name).await else {
            return;
        };
        let Ok(analytics_count) = self.tracking.row_count(table_name).await else {
            return;
        };
        if replica_count == 0 {
            return;
        }
        let diff = (replica_count as f64 - analytics_count as f64).abs() / replica_count as f64;
        if diff > VERIFY_TOLERANCE {
            tracing::warn!(
                table = table_name,
                replica_count,
                analytics_count,
                diff_ratio = diff,
                "analytics row count diverges from replica beyond the 0.1% tolerance"
            );
        }
    }

    async fn execute_strategy(
        &self,
        spec: &TableSpec,
        method: LoadMethod,
        prep: &LoadPrep,
        cancel: &CancelHandle,
    ) -> Result<(u64, Option<ColumnValue>)> {
        match method {
            LoadMethod::Standard => self.paginated_upsert(spec, prep, STANDARD_BATCH, cancel).await,
            LoadMethod::Streaming => self.paginated_upsert(spec, prep, STREAMING_BATCH, cancel).await,
            LoadMethod::Chunked => self.paginated_upsert(spec, prep, CHUNKED_BATCH, cancel).await,
            LoadMethod::CopyBulk => self.copy_bulk(spec, prep, cancel).await,
            LoadMethod::Parallel => self.parallel(spec, prep, cancel).await,
        }
    }

    async fn fetch_replica_batch(
        &self,
        spec: &TableSpec,
        prep: &LoadPrep,
        offset: u64,
        limit: u32,
        cancel: &CancelHandle,
    ) -> Result<Vec<sqlx::mysql::MySqlRow>> {
        let sql = format!(
            "SELECT * FROM `{}` {} ORDER BY `{}` LIMIT {limit} OFFSET {offset}",
            prep.definition.name,
            prep.where_sql.as_ref().map(|w| format!("WHERE {w}")).unwrap_or_default(),
            prep.pagination_column,
        );
        self.pools
            .execute_with_retry(cancel, Some(spec.performance_category), || async {
                let mut query = sqlx::query(&sql);
                for bind in &prep.binds {
                    query = query.bind(bind.as_str());
                }
                query.fetch_all(&self.pools.replica).await.map_err(|e| TableSyncError::LoadQuery {
                    table: prep.definition.name.clone(),
                    context: e.to_string(),
                })
            })
            .await
    }

    /// Shared paging loop behind `standard`/`streaming`/`chunked` (spec
    /// §9 "five size-adaptive execution shapes sharing preflight...").
    /// Persists tracking after every committed batch, same as the
    /// Extractor, so cancellation never rewinds already-loaded rows.
    async fn paginated_upsert(
        &self,
        spec: &TableSpec,
        prep: &LoadPrep,
        batch_size: u32,
        cancel: &CancelHandle,
    ) -> Result<(u64, Option<ColumnValue>)> {
        let mut offset = 0u64;
        let mut total = 0u64;
        let mut last_value: Option<ColumnValue> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(TableSyncError::Cancelled);
            }
            let rows = self.fetch_replica_batch(spec, prep, offset, batch_size, cancel).await?;
            if rows.is_empty() {
                break;
            }
            let fetched = rows.len() as u64;

            let converted: Vec<Row> = rows
                .iter()
                .map(|r| mysql_row_to_row(r, &prep.definition.columns))
                .collect::<Result<_>>()?;
            let targeted: Vec<Row> = converted.iter().map(|r| self.schema.convert_row(r, &prep.target)).collect();

            if let Some(col) = &prep.tracking_column {
                for row in &targeted {
                    if let Some(v) = row.get(col) {
                        last_value = Some(match &last_value {
                            Some(cur) => ColumnValue::partial_max(cur, v).clone(),
                            None => v.clone(),
                        });
                    }
                }
            }

            self.upsert_batch_into_analytics(prep, &targeted, cancel).await?;
            total += fetched;

            if prep.tracking_column.is_some() {
                self.tracking
                    .update_progress(
                        &spec.name,
                        last_value.as_ref().and_then(ColumnValue::to_tracking_string).as_deref(),
                        prep.tracking_column.as_deref(),
                        total,
                        TrackingStatus::Success,
                    )
                    .await?;
            }

            if fetched < u64::from(batch_size) {
                break;
            }
            offset += u64::from(batch_size);
        }

        Ok((total, last_value))
    }

    async fn upsert_batch_into_analytics(&self, prep: &LoadPrep, rows: &[Row], cancel: &CancelHandle) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let null = ColumnValue::Null;
        let max_rows = max_rows_per_statement(prep.target_columns.len());
        for chunk in rows.chunks(max_rows) {
            let sql = build_upsert_sql(
                self.pools.analytics_schema.as_str(),
                &prep.definition.name,
                &prep.target_columns,
                &prep.target.primary_key,
                chunk.len(),
            );
            self.pools
                .execute_with_retry(cancel, None, || async {
                    let mut query = sqlx::query(&sql);
                    for row in chunk {
                        for col in &prep.target_columns {
                            let value = row.get(col).unwrap_or(&null);
                            query = bind_postgres(query, value);
                        }
                    }
                    query.execute(&self.pools.analytics).await.map_err(|e| TableSyncError::LoadInsert {
                        table: prep.definition.name.clone(),
                        context: e.to_string(),
                    })?;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// `copy_bulk` : writes batches into an `UNLOGGED`
    /// staging table via the Postgres `COPY` protocol, then merges into
    /// the target with one upsert statement. The staging table is
    /// truncated before and after use so the method is safely rerunnable.
    async fn copy_bulk(&self, spec: &TableSpec, prep: &LoadPrep, cancel: &CancelHandle) -> Result<(u64, Option<ColumnValue>)> {
        let schema = self.pools.analytics_schema.as_str();
        let staging = format!("stg_{}", prep.definition.name);

        let create_sql = format!(
            "CREATE UNLOGGED TABLE IF NOT EXISTS \"{schema}\".\"{staging}\" (LIKE \"{schema}\".\"{}\" INCLUDING DEFAULTS)",
            prep.definition.name
        );
        sqlx::query(&create_sql).execute(&self.pools.analytics).await.map_err(|e| TableSyncError::LoadQuery {
            table: prep.definition.name.clone(),
            context: e.to_string(),
        })?;
        sqlx::query(&format!("TRUNCATE \"{schema}\".\"{staging}\""))
            .execute(&self.pools.analytics)
            .await
            .map_err(|e| TableSyncError::LoadQuery { table: prep.definition.name.clone(), context: e.to_string() })?;

        let mut offset = 0u64;
        let mut total = 0u64;
        let mut last_value: Option<ColumnValue> = None;
        let batch_size = CHUNKED_BATCH;

        loop {
            if cancel.is_cancelled() {
                return Err(TableSyncError::Cancelled);
            }
            let rows = self.fetch_replica_batch(spec, prep, offset, batch_size, cancel).await?;
            if rows.is_empty() {
                break;
            }
            let fetched = rows.len() as u64;

            let converted: Vec<Row> = rows
                .iter()
                .map(|r| mysql_row_to_row(r, &prep.definition.columns))
                .collect::<Result<_>>()?;
            let targeted: Vec<Row> = converted.iter().map(|r| self.schema.convert_row(r, &prep.target)).collect();

            if let Some(col) = &prep.tracking_column {
                for row in &targeted {
                    if let Some(v) = row.get(col) {
                        last_value = Some(match &last_value {
                            Some(cur) => ColumnValue::partial_max(cur, v).clone(),
                            None => v.clone(),
                        });
                    }
                }
            }

            self.copy_batch_into_staging(&staging, prep, &targeted, cancel).await?;
            total += fetched;

            if fetched < u64::from(batch_size) {
                break;
            }
            offset += u64::from(batch_size);
        }

        if total > 0 {
            let col_list = prep.target_columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
            let pk_list = prep.target.primary_key.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
            let update_cols: Vec<String> = prep
                .target_columns
                .iter()
                .filter(|c| !prep.target.primary_key.contains(c))
                .map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\""))
                .collect();
            let conflict_action =
                if update_cols.is_empty() { "DO NOTHING".to_string() } else { format!("DO UPDATE SET {}", update_cols.join(", ")) };
            let merge_sql = format!(
                "INSERT INTO \"{schema}\".\"{}\" ({col_list}) SELECT {col_list} FROM \"{schema}\".\"{staging}\" \
                 ON CONFLICT ({pk_list}) {conflict_action}",
                prep.definition.name
            );
            self.pools
                .execute_with_retry(cancel, None, || async {
                    sqlx::query(&merge_sql).execute(&self.pools.analytics).await.map_err(|e| {
                        TableSyncError::LoadInsert { table: prep.definition.name.clone(), context: e.to_string() }
                    })?;
                    Ok(())
                })
                .await?;
        }

        let _ = sqlx::query(&format!("TRUNCATE \"{schema}\".\"{staging}\"")).execute(&self.pools.analytics).await;

        Ok((total, last_value))
    }

    async fn copy_batch_into_staging(&self, staging: &str, prep: &LoadPrep, rows: &[Row], cancel: &CancelHandle) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(TableSyncError::Cancelled);
        }
        let schema = self.pools.analytics_schema.as_str();
        let col_list = prep.target_columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
        let copy_sql = format!("COPY \"{schema}\".\"{staging}\" ({col_list}) FROM STDIN");

        let mut buffer = String::new();
        for row in rows {
            let fields: Vec<String> =
                prep.target_columns.iter().map(|c| copy_field(row.get(c).unwrap_or(&ColumnValue::Null))).collect();
            buffer.push_str(&fields.join("\t"));
            buffer.push('\n');
        }

        let mut conn = self
            .pools
            .analytics
            .acquire()
            .await
            .map_err(|e| TableSyncError::LoadInsert { table: prep.definition.name.clone(), context: e.to_string() })?;
        let mut copy_in = conn
            .copy_in_raw(&copy_sql)
            .await
            .map_err(|e| TableSyncError::LoadInsert { table: prep.definition.name.clone(), context: e.to_string() })?;
        copy_in
            .send(buffer.as_bytes())
            .await
            .map_err(|e| TableSyncError::LoadInsert { table: prep.definition.name.clone(), context: e.to_string() })?;
        copy_in
            .finish()
            .await
            .map_err(|e| TableSyncError::LoadInsert { table: prep.definition.name.clone(), context: e.to_string() })?;
        Ok(())
    }

    /// `parallel`: partitions the primary key's observed range into
    /// `DEFAULT_WORKERS` contiguous intervals and runs a chunked upsert
    /// per range concurrently. Falls back to a single chunked pass when
    /// the primary key isn't a sampleable integer — a non-numeric key
    /// can't be partitioned into ranges the way `MIN`/`MAX` requires.
    async fn parallel(&self, spec: &TableSpec, prep: &LoadPrep, cancel: &CancelHandle) -> Result<(u64, Option<ColumnValue>)> {
        let Some(pk_col) = prep.definition.primary_key.first().cloned() else {
            return Err(TableSyncError::LoadQuery {
                table: prep.definition.name.clone(),
                context: "parallel load requires a primary key column".into(),
            });
        };

        let Some(sample) = sample_integer_range(&self.pools.replica, &prep.definition.name, &pk_col).await else {
            tracing::warn!(
                table = %spec.name,
                "parallel load requested but primary key is not a sampleable integer; falling back to chunked"
            );
            return self.paginated_upsert(spec, prep, CHUNKED_BATCH, cancel).await;
        };

        let ranges = partition_ranges(sample.min, sample.max, DEFAULT_WORKERS);
        let futures = ranges.into_iter().map(|(lo, hi)| {
            let mut worker_prep = prep.clone();
            let range_clause = match hi {
                Some(hi) => format!("`{pk_col}` >= {lo} AND `{pk_col}` < {hi}"),
                None => format!("`{pk_col}` >= {lo}"),
            };
            worker_prep.where_sql = Some(match &prep.where_sql {
                Some(w) => format!("({w}) AND ({range_clause})"),
                None => range_clause,
            });
            async move { self.paginated_upsert(spec, &worker_prep, CHUNKED_BATCH, cancel).await }
        });

        let results = join_all(futures).await;

        let mut total = 0u64;
        let mut last_value: Option<ColumnValue> = None;
        for result in results {
            let (rows, lv) = result?;
            total += rows;
            last_value = match (last_value, lv) {
                (None, v) => v,
                (Some(cur), Some(v)) => Some(ColumnValue::partial_max(&cur, &v).clone()),
                (Some(cur), None) => Some(cur),
            };
        }
        Ok((total, last_value))
    }
}

/// Postgres hard-caps bind parameters at 65,535 per statement. Caps
/// rows-per-`INSERT` so `rows * columns` never crosses that, regardless
/// of how wide the configured batch size is.
fn max_rows_per_statement(columns: usize) -> usize {
    const POSTGRES_MAX_PARAMS: usize = 65_535;
    (POSTGRES_MAX_PARAMS / columns.max(1)).max(1)
}

fn build_upsert_sql(schema: &str, table: &str, columns: &[String], primary_key: &[String], row_count: usize) -> String {
    let col_list = columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
    let mut placeholders = Vec::with_capacity(row_count);
    let mut n = 1usize;
    for _ in 0..row_count {
        let group = (0..columns.len())
            .map(|_| {
                let p = format!("${n}");
                n += 1;
                p
            })
            .collect::<Vec<_>>()
            .join(", ");
        placeholders.push(format!("({group})"));
    }
    let pk_list = primary_key.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
    let update_cols: Vec<String> =
        columns.iter().filter(|c| !primary_key.contains(c)).map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\"")).collect();
    let conflict_action =
        if update_cols.is_empty() { "DO NOTHING".to_string() } else { format!("DO UPDATE SET {}", update_cols.join(", ")) };
    format!(
        "INSERT INTO \"{schema}\".\"{table}\" ({col_list}) VALUES {} ON CONFLICT ({pk_list}) {conflict_action}",
        placeholders.join(", ")
    )
}

/// Splits `[min, max]` into `workers` contiguous half-open intervals;
/// the last is unbounded above, to catch any rows inserted concurrently
/// at the tail of the range.
fn partition_ranges(min: i64, max: i64, workers: usize) -> Vec<(i64, Option<i64>)> {
    let workers = i64::try_from(workers.max(1)).unwrap_or(1);
    let span = (max - min + 1).max(1);
    let step = span.div_ceil(workers);
    let mut ranges = Vec::new();
    let mut lo = min;
    for i in 0..workers {
        if lo > max {
            break;
        }
        let hi = if i == workers - 1 { None } else { Some((lo + step).min(max + 1)) };
        ranges.push((lo, hi));
        match hi {
            Some(h) => lo = h,
            None => break,
        }
    }
    ranges
}

fn pg_copy_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn copy_field(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "\\N".to_string(),
        ColumnValue::Bool(b) => {
            if *b {
                "t".to_string()
            } else {
                "f".to_string()
            }
        }
        ColumnValue::Int64(n) => n.to_string(),
        ColumnValue::Float64(f) => f.to_string(),
        ColumnValue::Text(s) => pg_copy_escape(s),
        ColumnValue::Bytes(b) => format!("\\\\x{}", hex_encode(b)),
        ColumnValue::Time(t) => t.to_rfc3339(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{ExtractionStrategy, IncrementalStrategy, PerformanceCategory, ProcessingPriority};

    fn spec(rows: u64, size_mb: f64) -> TableSpec {
        TableSpec {
            name: "procedurelog".into(),
            extraction_strategy: ExtractionStrategy::Incremental,
            incremental_columns: vec!["ProcDate".into()],
            primary_incremental_column: Some("ProcDate".into()),
            incremental_strategy: IncrementalStrategy::SingleColumn,
            primary_key: vec!["ProcNum".into()],
            batch_size: 1000,
            performance_category: PerformanceCategory::Large,
            processing_priority: ProcessingPriority::Medium,
            estimated_rows: rows,
            estimated_size_mb: size_mb,
            time_gap_threshold_days: 30,
        }
    }

    #[test]
    fn size_boundary_50mb_routes_to_streaming_not_standard() {
        assert_eq!(LoadMethod::resolve(&spec(1000, 50.0)), LoadMethod::Standard);
        assert_eq!(LoadMethod::resolve(&spec(1000, 50.001)), LoadMethod::Streaming);
    }

    #[test]
    fn row_boundary_one_million_does_not_route_to_parallel() {
        assert_eq!(LoadMethod::resolve(&spec(1_000_000, 1.0)), LoadMethod::Standard);
        assert_eq!(LoadMethod::resolve(&spec(1_000_001, 1.0)), LoadMethod::Parallel);
    }

    #[test]
    fn size_boundaries_select_chunked_and_copy_bulk() {
        assert_eq!(LoadMethod::resolve(&spec(1000, 200.0)), LoadMethod::Streaming);
        assert_eq!(LoadMethod::resolve(&spec(1000, 200.001)), LoadMethod::Chunked);
        assert_eq!(LoadMethod::resolve(&spec(1000, 500.0)), LoadMethod::Chunked);
        assert_eq!(LoadMethod::resolve(&spec(1000, 500.001)), LoadMethod::CopyBulk);
    }

    #[test]
    fn rows_over_a_million_wins_over_small_size() {
        // estimated_rows > 1_000_000 routes to parallel regardless of
        // estimated_size_mb: the row condition is checked first.
        assert_eq!(LoadMethod::resolve(&spec(2_000_000, 1.0)), LoadMethod::Parallel);
    }

    #[test]
    fn build_upsert_sql_upserts_non_key_columns_only() {
        let sql = build_upsert_sql(
            "raw",
            "patient",
            &["PatNum".to_string(), "LName".to_string()],
            &["PatNum".to_string()],
            1,
        );
        assert!(sql.contains("ON CONFLICT (\"PatNum\")"));
        assert!(sql.contains("\"LName\" = EXCLUDED.\"LName\""));
        assert!(!sql.contains("\"PatNum\" = EXCLUDED"));
    }

    #[test]
    fn build_upsert_sql_placeholders_scale_with_row_count() {
        let sql = build_upsert_sql("raw", "t", &["a".to_string(), "b".to_string()], &["a".to_string()], 2);
        assert!(sql.contains("($1, $2), ($3, $4)"));
    }

    #[test]
    fn build_upsert_sql_falls_back_to_do_nothing_when_all_columns_are_keys() {
        let sql = build_upsert_sql("raw", "t", &["a".to_string()], &["a".to_string()], 1);
        assert!(sql.contains("DO NOTHING"));
    }

    #[test]
    fn max_rows_per_statement_stays_under_the_postgres_bind_limit() {
        let columns = 80;
        let rows = max_rows_per_statement(columns);
        assert!(rows * columns <= 65_535);
        assert!(rows >= 1);
    }

    #[test]
    fn max_rows_per_statement_handles_a_single_column_table() {
        assert_eq!(max_rows_per_statement(1), 65_535);
    }

    #[test]
    fn partition_ranges_covers_the_whole_domain_contiguously() {
        let ranges = partition_ranges(1, 1090, 5);
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[0].0, 1);
        assert!(ranges.last().unwrap().1.is_none());
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, Some(pair[1].0));
        }
    }

    #[test]
    fn partition_ranges_handles_a_domain_smaller_than_worker_count() {
        let ranges = partition_ranges(1, 3, 5);
        assert!(ranges.len() <= 5);
        assert_eq!(ranges[0].0, 1);
    }

    #[test]
    fn copy_field_escapes_null_and_tabs() {
        assert_eq!(copy_field(&ColumnValue::Null), "\\N");
        assert_eq!(copy_field(&ColumnValue::Text("a\tb".into())), "a\\tb");
        assert_eq!(copy_field(&ColumnValue::Bool(true)), "t");
    }

    #[test]
    fn copy_field_hex_encodes_bytes() {
        assert_eq!(copy_field(&ColumnValue::Bytes(vec![0xDE, 0xAD])), "\\\\xdead");
    }

    use proptest::prelude::*;

    proptest! {
        /// Spec §8 S4: partitioning a primary-key domain into worker ranges
        /// must stay contiguous and cover `[min, max]` regardless of the
        /// sampled bounds or worker count, so the `parallel` strategy's
        /// per-worker row counts always sum to the single-worker baseline.
        #[test]
        fn partition_ranges_is_always_contiguous_and_covers_the_domain(
            min in 0i64..1_000_000,
            span in 1i64..1_000_000,
            workers in 1usize..12,
        ) {
            let max = min + span;
            let ranges = partition_ranges(min, max, workers);
            prop_assert!(!ranges.is_empty());
            prop_assert_eq!(ranges[0].0, min);
            prop_assert!(ranges.last().unwrap().1.is_none());
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].1, Some(pair[1].0));
            }
            prop_assert!(ranges.len() <= workers);
        }
    }
}
