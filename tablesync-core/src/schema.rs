//! `SchemaAdapter` — converts source table definitions to warehouse
//! table definitions, converts row values between engine families, and
//! creates/verifies target tables idempotently.
//!
//! Uses the same `information_schema` column collection and `sqlx::Row`
//! decoding a read-only metadata collector would, generalized from
//! "collect into a report" to "map one engine's column definition
//! directly onto another's DDL and bind values into it".

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{MySqlPool, PgPool, Row as SqlxRow};

use crate::error::{Result, TableSyncError};
use crate::models::{ColumnValue, Row};

/// One column of a table definition, engine-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct ColumnDef {
    pub name: String,
    /// Lowercased source engine type name, e.g. `"varchar"`, `"tinyint"`.
    pub source_type: String,
    pub char_max_length: Option<u32>,
    pub numeric_precision: Option<u32>,
    pub numeric_scale: Option<u32>,
    pub nullable: bool,
}

/// A table's full column set plus primary key, as read from SOURCE and as
/// targeted at ANALYTICS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

impl TableDefinition {
    /// Stable hash over `(name, type, nullable)` tuples in column order,
    /// used by the Extractor to detect a drifted replica schema (spec
    /// §4.5: "if the replica table exists but its schema hash differs
    /// from the source, the extractor rebuilds it").
    pub fn schema_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for col in &self.columns {
            col.name.hash(&mut hasher);
            col.source_type.hash(&mut hasher);
            col.nullable.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Target (warehouse) column type, chosen by either the standard map or
/// the analyzed map 
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    SmallInt,
    Integer,
    BigInt,
    Boolean,
    DoublePrecision,
    Numeric { precision: u32, scale: u32 },
    Text,
    Varchar(u32),
    TimestampTz,
    Bytea,
}

impl TargetType {
    pub fn ddl(self) -> String {
        match self {
            TargetType::SmallInt => "SMALLINT".to_string(),
            TargetType::Integer => "INTEGER".to_string(),
            TargetType::BigInt => "BIGINT".to_string(),
            TargetType::Boolean => "BOOLEAN".to_string(),
            TargetType::DoublePrecision => "DOUBLE PRECISION".to_string(),
            TargetType::Numeric { precision, scale } => format!("NUMERIC({precision},{scale})"),
            TargetType::Text => "TEXT".to_string(),
            TargetType::Varchar(n) => format!("VARCHAR({n})"),
            TargetType::TimestampTz => "TIMESTAMPTZ".to_string(),
            TargetType::Bytea => "BYTEA".to_string(),
        }
    }
}

/// The standard per-source-type -> target-type table. Always safe
/// (never narrower than the source can hold); the analyzed map only
/// ever narrows starting from here.
pub fn standard_map(col: &ColumnDef) -> TargetType {
    let t = col.source_type.to_lowercase();
    let is_unsigned = t.contains("unsigned");
    let base = t.replace(" unsigned", "");
    let base = base.trim();

    match base {
        "tinyint" if col.char_max_length == Some(1) => TargetType::Boolean,
        "tinyint" | "smallint" => {
            if is_unsigned {
                TargetType::Integer
            } else {
                TargetType::SmallInt
            }
        }
        "mediumint" | "int" | "integer" => {
            if is_unsigned {
                TargetType::BigInt
            } else {
                TargetType::Integer
            }
        }
        "bigint" => TargetType::BigInt,
        "bool" | "boolean" => TargetType::Boolean,
        "float" | "double" | "double precision" | "real" => TargetType::DoublePrecision,
        "decimal" | "numeric" => TargetType::Numeric {
            precision: col.numeric_precision.unwrap_or(38),
            scale: col.numeric_scale.unwrap_or(10),
        },
        "char" | "varchar" | "character" | "character varying" => match col.char_max_length {
            Some(n) if n <= 10_485_760 => TargetType::Varchar(n),
            _ => TargetType::Text,
        },
        "tinytext" | "text" | "mediumtext" | "longtext" | "json" | "enum" | "set" => {
            TargetType::Text
        }
        "date" | "datetime" | "timestamp" | "time" => TargetType::TimestampTz,
        "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
            TargetType::Bytea
        }
        _ => TargetType::Text,
    }
}

/// Sampled min/max for a numeric column, used by the analyzed map.
#[derive(Debug, Clone, Copy)]
pub struct IntegerSample {
    pub min: i64,
    pub max: i64,
}

/// The analyzed map : narrows an integer column's target type
/// below what the standard map would pick, when the sampled range fits.
/// Used only for unclear integer widths (`int`/`mediumint`, unsigned
/// variants) and boolean-shaped tinyints; falls back to the standard map
/// when sampling is unavailable (§5 Open Question decision).
pub fn analyzed_map(col: &ColumnDef, sample: Option<IntegerSample>) -> TargetType {
    let standard = standard_map(col);
    let Some(sample) = sample else {
        return standard;
    };

    match standard {
        TargetType::Integer | TargetType::BigInt => {
            if sample.min >= i16::MIN as i64 && sample.max <= i16::MAX as i64 {
                TargetType::SmallInt
            } else if sample.min >= i32::MIN as i64 && sample.max <= i32::MAX as i64 {
                TargetType::Integer
            } else {
                TargetType::BigInt
            }
        }
        other => other,
    }
}

/// Converts a single source-engine value into a warehouse-bound value.
/// Total over every `ColumnValue` variant: unrecognized combinations
/// pass the value through unchanged rather than erroring.
pub fn convert_value(value: &ColumnValue, target: TargetType) -> ColumnValue {
    match (value, target) {
        (ColumnValue::Null, _) => ColumnValue::Null,
        (ColumnValue::Int64(n), TargetType::Boolean) => ColumnValue::Bool(*n != 0),
        (ColumnValue::Bool(b), TargetType::Boolean) => ColumnValue::Bool(*b),
        (v, _) => v.clone(),
    }
}

/// Converts an entire replica row into the analytics-bound row, routing
/// every value through `convert_value`, in `target_columns` order.
pub fn convert_row(row: &Row, definition: &[(String, TargetType)]) -> Row {
    let mut out = Row::new();
    for (name, target) in definition {
        let value = row.get(name).cloned().unwrap_or(ColumnValue::Null);
        out.push(name.clone(), convert_value(&value, *target));
    }
    out
}

/// Reads a table's column definitions from the SOURCE (MySQL-family)
/// `information_schema`.
pub async fn read_mysql_definition(
    pool: &MySqlPool,
    database: &str,
    table: &str,
) -> Result<TableDefinition> {
    let rows = sqlx::query(
        r"
        SELECT column_name, data_type, character_maximum_length,
               numeric_precision, numeric_scale, is_nullable
        FROM information_schema.columns
        WHERE table_schema = ? AND table_name = ?
        ORDER BY ordinal_position
        ",
    )
    .bind(database)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| TableSyncError::SchemaRead {
        table: table.to_string(),
        context: e.to_string(),
    })?;

    if rows.is_empty() {
        return Err(TableSyncError::SchemaRead {
            table: table.to_string(),
            context: "table has no columns (does it exist?)".into(),
        });
    }

    let columns = rows
        .iter()
        .map(|r| ColumnDef {
            name: r.get::<String, _>("column_name"),
            source_type: r.get::<String, _>("data_type"),
            char_max_length: r
                .try_get::<Option<i64>, _>("character_maximum_length")
                .ok()
                .flatten()
                .map(|v| v.max(0) as u32),
            numeric_precision: r
                .try_get::<Option<i64>, _>("numeric_precision")
                .ok()
                .flatten()
                .map(|v| v.max(0) as u32),
            numeric_scale: r
                .try_get::<Option<i64>, _>("numeric_scale")
                .ok()
                .flatten()
                .map(|v| v.max(0) as u32),
            nullable: r.get::<String, _>("is_nullable") == "YES",
        })
        .collect();

    let pk_rows = sqlx::query(
        r"
        SELECT column_name FROM information_schema.key_column_usage
        WHERE table_schema = ? AND table_name = ? AND constraint_name = 'PRIMARY'
        ORDER BY ordinal_position
        ",
    )
    .bind(database)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| TableSyncError::SchemaRead {
        table: table.to_string(),
        context: e.to_string(),
    })?;

    let primary_key = pk_rows
        .iter()
        .map(|r| r.get::<String, _>("column_name"))
        .collect();

    Ok(TableDefinition {
        name: table.to_string(),
        columns,
        primary_key,
    })
}

/// Builds the `raw.<table>` DDL for a source definition, given a choice
/// of target type per column (pre-resolved by the caller via
/// `standard_map`/`analyzed_map`).
pub fn build_create_table_sql(
    schema: &str,
    table: &str,
    columns: &[(String, TargetType, bool)],
    primary_key: &[String],
) -> String {
    let mut cols = Vec::with_capacity(columns.len());
    for (name, target, nullable) in columns {
        let null_clause = if *nullable { "" } else { " NOT NULL" };
        cols.push(format!("\"{name}\" {}{null_clause}", target.ddl()));
    }
    if !primary_key.is_empty() {
        let pk = primary_key
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        cols.push(format!("PRIMARY KEY ({pk})"));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS \"{schema}\".\"{table}\" ({})",
        cols.join(", ")
    )
}

/// Verifies that an already-existing target table's column set matches
/// the expected definition. Reports a mismatch rather than auto-altering
/// the table.
pub async fn verify_target_columns(
    pool: &PgPool,
    schema: &str,
    table: &str,
    expected: &[String],
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r"
        SELECT column_name FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| TableSyncError::SchemaVerify {
        table: table.to_string(),
        context: e.to_string(),
    })?;

    let actual: std::collections::HashSet<String> =
        rows.iter().map(|r| r.get::<String, _>("column_name")).collect();

    let missing: Vec<String> = expected
        .iter()
        .filter(|c| !actual.contains(*c))
        .cloned()
        .collect();

    Ok(missing)
}

/// A fully resolved target-side table: one `TargetType` per column (chosen
/// by the standard or analyzed map) plus the primary key, in source column
/// order. `SchemaAdapter::target_columns` and `::convert_row` both rely on
/// this ordering to bind positionally.
#[derive(Debug, Clone)]
pub struct TargetSchema {
    pub table: String,
    pub columns: Vec<(String, TargetType, bool)>,
    pub primary_key: Vec<String>,
}

impl TargetSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _, _)| n.clone()).collect()
    }

    fn as_type_list(&self) -> Vec<(String, TargetType)> {
        self.columns.iter().map(|(n, t, _)| (n.clone(), *t)).collect()
    }
}

/// Converts a MySQL-decoded row value into a [`ColumnValue`] according to
/// `col.source_type`. Unsigned integers wider than `i64::MAX` truncate;
/// clinical schemas in practice never carry counters anywhere near that
/// range, but a future caller working against a different source should
/// widen `ColumnValue` rather than assume this holds.
pub fn mysql_value(row: &sqlx::mysql::MySqlRow, col: &ColumnDef) -> Result<ColumnValue> {
    let name = col.name.as_str();
    let base = col.source_type.to_lowercase();
    let base = base.replace(" unsigned", "");
    let base = base.trim();

    let value = match base {
        "tinyint" if col.char_max_length == Some(1) => row
            .try_get::<Option<bool>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, ColumnValue::Bool)),
        "bool" | "boolean" => row
            .try_get::<Option<bool>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, ColumnValue::Bool)),
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => row
            .try_get::<Option<i64>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, ColumnValue::Int64)),
        "float" | "double" | "double precision" | "real" | "decimal" | "numeric" => row
            .try_get::<Option<f64>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, ColumnValue::Float64)),
        // sqlx only decodes a MySQL DATE column into NaiveDate, never
        // NaiveDateTime; lift it to midnight so it still round-trips
        // through the same ColumnValue::Time representation.
        "date" => row
            .try_get::<Option<NaiveDate>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, |naive| {
                let naive = naive.and_time(chrono::NaiveTime::MIN);
                ColumnValue::Time(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            })),
        "datetime" | "timestamp" => row
            .try_get::<Option<NaiveDateTime>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, |naive| {
                ColumnValue::Time(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            })),
        "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => row
            .try_get::<Option<Vec<u8>>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, ColumnValue::Bytes)),
        _ => row
            .try_get::<Option<String>, _>(name)
            .map(|v| v.map_or(ColumnValue::Null, ColumnValue::Text)),
    };

    value.map_err(|e| TableSyncError::TypeConversion {
        table: String::new(),
        column: col.name.clone(),
        context: e.to_string(),
    })
}

/// Reads an entire row out of a `MySqlRow` per `columns`, preserving order.
pub fn mysql_row_to_row(row: &sqlx::mysql::MySqlRow, columns: &[ColumnDef]) -> Result<Row> {
    let mut out = Row::new();
    for col in columns {
        out.push(col.name.clone(), mysql_value(row, col)?);
    }
    Ok(out)
}

/// Binds one [`ColumnValue`] into a MySQL query at the next positional
/// placeholder, used when inserting extracted rows into the REPLICA.
pub fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &'q ColumnValue,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        ColumnValue::Null => query.bind(None::<i64>),
        ColumnValue::Bool(b) => query.bind(*b),
        ColumnValue::Int64(n) => query.bind(*n),
        ColumnValue::Float64(f) => query.bind(*f),
        ColumnValue::Text(s) => query.bind(s.as_str()),
        ColumnValue::Bytes(b) => query.bind(b.as_slice()),
        ColumnValue::Time(t) => query.bind(*t),
    }
}

/// Binds one [`ColumnValue`] into a Postgres query, used by every Loader
/// strategy's upsert emission.
pub fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q ColumnValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        ColumnValue::Null => query.bind(None::<i64>),
        ColumnValue::Bool(b) => query.bind(*b),
        ColumnValue::Int64(n) => query.bind(*n),
        ColumnValue::Float64(f) => query.bind(*f),
        ColumnValue::Text(s) => query.bind(s.as_str()),
        ColumnValue::Bytes(b) => query.bind(b.as_slice()),
        ColumnValue::Time(t) => query.bind(*t),
    }
}

/// Samples a replica column's observed min/max, used by the analyzed
/// map to narrow an integer column's target width. Falls back to the
/// standard type map if sampling fails or the column is empty.
pub async fn sample_integer_range(
    pool: &MySqlPool,
    table: &str,
    column: &str,
) -> Option<IntegerSample> {
    let sql = format!("SELECT MIN(`{column}`), MAX(`{column}`) FROM `{table}`");
    let row = sqlx::query(&sql).fetch_one(pool).await.ok()?;
    let min: Option<i64> = row.try_get(0).ok()?;
    let max: Option<i64> = row.try_get(1).ok()?;
    match (min, max) {
        (Some(min), Some(max)) => Some(IntegerSample { min, max }),
        _ => None,
    }
}

/// Columns whose standard-map target type is ambiguous enough to
/// benefit from sampling: unclear integer widths and boolean-shaped
/// tinyints. `tinyint(1)` is already resolved to boolean by the
/// standard map, so it is excluded here rather than sampled again.
fn is_analyzable(col: &ColumnDef) -> bool {
    let base = col.source_type.to_lowercase();
    let base = base.replace(" unsigned", "");
    matches!(base.trim(), "int" | "integer" | "mediumint")
}

/// `SchemaAdapter` — the component that owns type mapping, target-table
/// creation/verification, and row conversion for one table at a time
///  Holds borrowed pools; it never owns a connection across a
/// phase.
pub struct SchemaAdapter<'a> {
    source: &'a MySqlPool,
    replica: &'a MySqlPool,
    analytics: &'a PgPool,
    source_database: String,
    analytics_schema: String,
}

impl<'a> SchemaAdapter<'a> {
    pub fn new(
        source: &'a MySqlPool,
        replica: &'a MySqlPool,
        analytics: &'a PgPool,
        source_database: impl Into<String>,
        analytics_schema: impl Into<String>,
    ) -> Self {
        Self {
            source,
            replica,
            analytics,
            source_database: source_database.into(),
            analytics_schema: analytics_schema.into(),
        }
    }

    /// Reads `table`'s definition from SOURCE's `information_schema`.
    pub async fn read_source_definition(&self, table: &str) -> Result<TableDefinition> {
        read_mysql_definition(self.source, &self.source_database, table).await
    }

    /// Resolves the target schema for `definition`, sampling REPLICA for
    /// ambiguous integer columns when `use_analyzed_map` is set (the
    /// analyzed map only ever narrows from the standard map's choice).
    pub async fn resolve_target_schema(
        &self,
        definition: &TableDefinition,
        use_analyzed_map: bool,
    ) -> TargetSchema {
        let mut columns = Vec::with_capacity(definition.columns.len());
        for col in &definition.columns {
            let target = if use_analyzed_map && is_analyzable(col) {
                let sample = sample_integer_range(self.replica, &definition.name, &col.name).await;
                analyzed_map(col, sample)
            } else {
                standard_map(col)
            };
            columns.push((col.name.clone(), target, col.nullable));
        }
        TargetSchema {
            table: definition.name.clone(),
            columns,
            primary_key: definition.primary_key.clone(),
        }
    }

    /// Creates `raw.<table>` if absent; if present, verifies its column
    /// set against `target` and logs a warning on mismatch rather than
    /// altering it.
    pub async fn ensure_target(&self, target: &TargetSchema) -> Result<()> {
        let ddl_columns: Vec<(String, TargetType, bool)> = target.columns.clone();
        let create_sql = build_create_table_sql(
            &self.analytics_schema,
            &target.table,
            &ddl_columns,
            &target.primary_key,
        );
        sqlx::query(&create_sql)
            .execute(self.analytics)
            .await
            .map_err(|e| TableSyncError::SchemaTransform {
                table: target.table.clone(),
                context: e.to_string(),
            })?;

        let expected = target.column_names();
        let missing =
            verify_target_columns(self.analytics, &self.analytics_schema, &target.table, &expected)
                .await?;
        if !missing.is_empty() {
            tracing::warn!(
                table = %target.table,
                missing = ?missing,
                "target table is missing columns present in the source definition; not auto-altering"
            );
        }
        Ok(())
    }

    /// The column order every upsert binds positionally against.
    pub fn target_columns(&self, target: &TargetSchema) -> Vec<String> {
        target.column_names()
    }

    /// Routes every value in `row` through `convert_value` in
    /// `target`'s column order, so bind placeholders line up with the
    /// column list `target_columns` returns.
    pub fn convert_row(&self, row: &Row, target: &TargetSchema) -> Row {
        convert_row(row, &target.as_type_list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, source_type: &str, char_len: Option<u32>) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            source_type: source_type.to_string(),
            char_max_length: char_len,
            numeric_precision: None,
            numeric_scale: None,
            nullable: true,
        }
    }

    #[test]
    fn tinyint_one_maps_to_boolean() {
        let c = col("IsHidden", "tinyint", Some(1));
        assert_eq!(standard_map(&c), TargetType::Boolean);
    }

    #[test]
    fn tinyint_wide_maps_to_smallint() {
        let c = col("Flags", "tinyint", Some(4));
        assert_eq!(standard_map(&c), TargetType::SmallInt);
    }

    #[test]
    fn unsigned_int_maps_to_bigint_for_headroom() {
        let c = col("Count", "int unsigned", None);
        assert_eq!(standard_map(&c), TargetType::BigInt);
    }

    #[test]
    fn varchar_with_length_maps_to_varchar() {
        let c = col("LName", "varchar", Some(255));
        assert_eq!(standard_map(&c), TargetType::Varchar(255));
    }

    #[test]
    fn analyzed_map_narrows_int_with_small_sample() {
        let c = col("ProcStatus", "int", None);
        let sample = IntegerSample { min: 1, max: 8 };
        assert_eq!(analyzed_map(&c, Some(sample)), TargetType::SmallInt);
    }

    #[test]
    fn analyzed_map_falls_back_without_sample() {
        let c = col("ProcStatus", "int", None);
        assert_eq!(analyzed_map(&c, None), standard_map(&c));
    }

    #[test]
    fn schema_hash_is_order_sensitive_and_stable() {
        let def_a = TableDefinition {
            name: "patient".into(),
            columns: vec![col("PatNum", "bigint", None), col("LName", "varchar", Some(100))],
            primary_key: vec!["PatNum".into()],
        };
        let def_b = def_a.clone();
        assert_eq!(def_a.schema_hash(), def_b.schema_hash());

        let mut def_c = def_a.clone();
        def_c.columns.swap(0, 1);
        assert_ne!(def_a.schema_hash(), def_c.schema_hash());
    }

    #[test]
    fn convert_row_nulls_missing_columns() {
        let mut row = Row::new();
        row.push("a", ColumnValue::Int64(1));
        let definition = vec![
            ("a".to_string(), TargetType::BigInt),
            ("b".to_string(), TargetType::Text),
        ];
        let converted = convert_row(&row, &definition);
        assert_eq!(converted.get("b"), Some(&ColumnValue::Null));
    }

    #[test]
    fn is_analyzable_excludes_already_resolved_tinyint() {
        let bool_col = col("IsHidden", "tinyint", Some(1));
        assert!(!is_analyzable(&bool_col));
        let int_col = col("ProcStatus", "int", None);
        assert!(is_analyzable(&int_col));
        let bigint_col = col("ProcNum", "bigint", None);
        assert!(!is_analyzable(&bigint_col));
    }

    #[test]
    fn target_schema_column_names_preserve_order() {
        let target = TargetSchema {
            table: "patient".into(),
            columns: vec![
                ("PatNum".into(), TargetType::BigInt, false),
                ("LName".into(), TargetType::Varchar(100), true),
            ],
            primary_key: vec!["PatNum".into()],
        };
        assert_eq!(target.column_names(), vec!["PatNum", "LName"]);
    }
}
