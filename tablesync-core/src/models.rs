//! Core data model shared by every component of the core: table
//! specifications read from the catalog, tracking rows persisted per
//! table/side, and the result types phases and the scheduler hand back.
//!
//! These types intentionally carry no behavior beyond small validating
//! constructors and accessors; the components own the logic that acts
//! on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, TableSyncError};

/// How a table is copied from SOURCE into REPLICA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    FullTable,
    Incremental,
    IncrementalChunked,
}

/// How multiple incremental columns are combined into a WHERE clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalStrategy {
    SingleColumn,
    OrLogic,
    AndLogic,
}

/// Scheduling bucket. Determines whether the Scheduler runs a table in
/// the worker pool (`Large`) or sequentially (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceCategory {
    Tiny,
    Small,
    Medium,
    Large,
}

impl PerformanceCategory {
    pub const ALL: [PerformanceCategory; 4] = [
        PerformanceCategory::Tiny,
        PerformanceCategory::Small,
        PerformanceCategory::Medium,
        PerformanceCategory::Large,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceCategory::Tiny => "tiny",
            PerformanceCategory::Small => "small",
            PerformanceCategory::Medium => "medium",
            PerformanceCategory::Large => "large",
        }
    }
}

impl std::fmt::Display for PerformanceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-assigned processing priority. Currently informational
/// (consumed by the Scheduler only for stable ordering within a
/// category); it does not change which worker pool a table lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPriority {
    Low,
    Medium,
    High,
}

/// Immutable per-table configuration loaded once from the catalog.
///
/// `validate` checks the invariants this type must uphold;
/// `ConfigCatalog` rejects any `TableSpec` that violates them at load
/// time, so code downstream of the catalog may assume they hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub extraction_strategy: ExtractionStrategy,
    #[serde(default)]
    pub incremental_columns: Vec<String>,
    #[serde(default)]
    pub primary_incremental_column: Option<String>,
    pub incremental_strategy: IncrementalStrategy,
    pub primary_key: Vec<String>,
    pub batch_size: u32,
    pub performance_category: PerformanceCategory,
    pub processing_priority: ProcessingPriority,
    pub estimated_rows: u64,
    pub estimated_size_mb: f64,
    pub time_gap_threshold_days: u32,
}

impl TableSpec {
    /// Validates the §3 invariants. Called once by `ConfigCatalog::load`.
    pub fn validate(&self) -> Result<()> {
        if self.incremental_columns.is_empty()
            && self.extraction_strategy != ExtractionStrategy::FullTable
        {
            return Err(TableSyncError::config_invalid(
                &self.name,
                "incremental_columns is empty but extraction_strategy is not full_table",
            ));
        }

        if let Some(primary) = &self.primary_incremental_column {
            if primary != "none" && !self.incremental_columns.contains(primary) {
                return Err(TableSyncError::config_invalid(
                    &self.name,
                    format!(
                        "primary_incremental_column '{primary}' is not listed in incremental_columns"
                    ),
                ));
            }
        }

        if self.batch_size == 0 {
            return Err(TableSyncError::config_invalid(
                &self.name,
                "batch_size must be greater than 0",
            ));
        }

        if self.primary_key.is_empty() {
            return Err(TableSyncError::config_invalid(
                &self.name,
                "primary_key must not be empty",
            ));
        }

        Ok(())
    }

    /// The column to prefer for bookkeeping `last_primary_value`, if any.
    pub fn primary_column(&self) -> Option<&str> {
        self.primary_incremental_column
            .as_deref()
            .filter(|c| *c != "none")
            .or_else(|| self.incremental_columns.first().map(String::as_str))
    }
}

/// Per-table, per-side progress row (§3 TrackingRow).
///
/// One instance represents either the REPLICA's `etl_copy_status` row or
/// the ANALYTICS `etl_load_status` row for a table; `TrackingStore`
/// distinguishes the two via `TrackingSide`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRow {
    pub table_name: String,
    pub last_processed: Option<DateTime<Utc>>,
    pub last_primary_value: Option<String>,
    pub primary_column_name: Option<String>,
    pub rows_processed: u64,
    pub status: TrackingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackingRow {
    /// A fresh, not-yet-run row, as created by `EnsureRow`.
    pub fn pending(table_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            table_name: table_name.into(),
            last_processed: None,
            last_primary_value: None,
            primary_column_name: None,
            rows_processed: 0,
            status: TrackingStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status recorded in a tracking row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    Success,
    Failed,
}

impl TrackingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::Success => "success",
            TrackingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => TrackingStatus::Success,
            "failed" => TrackingStatus::Failed,
            _ => TrackingStatus::Pending,
        }
    }
}

/// Which side of the pipeline a `TrackingStore` operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingSide {
    /// `etl_copy_status` in the REPLICA.
    Replica,
    /// `etl_load_status` in ANALYTICS.
    Analytics,
}

/// Result of a single Extract or Load phase (§3 PhaseResult).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub success: bool,
    pub rows_processed: u64,
    pub strategy_used: String,
    pub primary_column: Option<String>,
    pub last_primary_value: Option<String>,
    pub duration_seconds: f64,
    pub force_full_applied: bool,
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn ok(
        strategy_used: impl Into<String>,
        rows_processed: u64,
        primary_column: Option<String>,
        last_primary_value: Option<String>,
        duration_seconds: f64,
        force_full_applied: bool,
    ) -> Self {
        Self {
            success: true,
            rows_processed,
            strategy_used: strategy_used.into(),
            primary_column,
            last_primary_value,
            duration_seconds,
            force_full_applied,
            error: None,
        }
    }

    pub fn failed(
        strategy_used: impl Into<String>,
        duration_seconds: f64,
        force_full_applied: bool,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            rows_processed: 0,
            strategy_used: strategy_used.into(),
            primary_column: None,
            last_primary_value: None,
            duration_seconds,
            force_full_applied,
            error: Some(error.into()),
        }
    }
}

/// Per-table outcome returned by a `TableRunner`, serializable as-is
/// for handing to a monitoring collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRunResult {
    pub name: String,
    pub success: bool,
    pub extract: Option<PhaseResult>,
    pub load: Option<PhaseResult>,
}

/// Aggregated outcome for one performance category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryOutcome {
    pub success: Vec<String>,
    pub failed: Vec<String>,
    pub total: usize,
}

impl CategoryOutcome {
    /// True when `success.len() + failed.len() == total`.
    pub fn is_conserved(&self) -> bool {
        self.success.len() + self.failed.len() == self.total
    }
}

/// Map of category name to its outcome, as returned by the Scheduler.
pub type CategoryResult = BTreeMap<String, CategoryOutcome>;

/// A dynamically-typed column value shuttled between the source
/// driver, the replica driver, and the warehouse driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Serializes to the text form `TrackingRow::last_primary_value` is
    /// stored as, accepting both timestamps and integers. `Null`/`Bytes`
    /// have no meaningful cutoff value.
    pub fn to_tracking_string(&self) -> Option<String> {
        match self {
            ColumnValue::Null | ColumnValue::Bytes(_) => None,
            ColumnValue::Bool(b) => Some(b.to_string()),
            ColumnValue::Int64(n) => Some(n.to_string()),
            ColumnValue::Float64(f) => Some(f.to_string()),
            ColumnValue::Text(s) => Some(s.clone()),
            ColumnValue::Time(t) => Some(t.to_rfc3339()),
        }
    }

    /// The larger of `a`/`b` under same-variant ordering, used to track
    /// the running max of the primary incremental column across
    /// inserted batches. Mismatched variants keep `a` — comparing
    /// across types never legitimately happens for one column.
    pub fn partial_max<'a>(a: &'a ColumnValue, b: &'a ColumnValue) -> &'a ColumnValue {
        match (a, b) {
            (ColumnValue::Int64(x), ColumnValue::Int64(y)) => {
                if y > x {
                    b
                } else {
                    a
                }
            }
            (ColumnValue::Float64(x), ColumnValue::Float64(y)) => {
                if y > x {
                    b
                } else {
                    a
                }
            }
            (ColumnValue::Time(x), ColumnValue::Time(y)) => {
                if y > x {
                    b
                } else {
                    a
                }
            }
            (ColumnValue::Text(x), ColumnValue::Text(y)) => {
                if y > x {
                    b
                } else {
                    a
                }
            }
            _ => a,
        }
    }
}

/// An ordered column-name -> value row, preserving source column order.
///
/// A plain `Vec` rather than a hash map: row width is small (tens of
/// columns), insertion order must survive for positional binding, and a
/// hash map buys nothing at this scale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Row(pub Vec<(String, ColumnValue)>);

impl Row {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, column: impl Into<String>, value: ColumnValue) {
        self.0.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &ColumnValue> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> TableSpec {
        TableSpec {
            name: "patient".into(),
            extraction_strategy: ExtractionStrategy::Incremental,
            incremental_columns: vec!["DateTStamp".into()],
            primary_incremental_column: Some("DateTStamp".into()),
            incremental_strategy: IncrementalStrategy::SingleColumn,
            primary_key: vec!["PatNum".into()],
            batch_size: 1000,
            performance_category: PerformanceCategory::Medium,
            processing_priority: ProcessingPriority::Medium,
            estimated_rows: 50_000,
            estimated_size_mb: 40.0,
            time_gap_threshold_days: 30,
        }
    }

    #[test]
    fn full_table_requires_no_incremental_columns() {
        let mut spec = valid_spec();
        spec.extraction_strategy = ExtractionStrategy::FullTable;
        spec.incremental_columns.clear();
        spec.primary_incremental_column = None;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn empty_incremental_columns_rejects_non_full_table() {
        let mut spec = valid_spec();
        spec.incremental_columns.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn primary_incremental_column_must_be_listed() {
        let mut spec = valid_spec();
        spec.primary_incremental_column = Some("SecDateTEdit".into());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn primary_incremental_column_none_is_allowed() {
        let mut spec = valid_spec();
        spec.primary_incremental_column = Some("none".into());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut spec = valid_spec();
        spec.batch_size = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn batch_size_of_one_is_accepted() {
        let mut spec = valid_spec();
        spec.batch_size = 1;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn category_outcome_conservation() {
        let outcome = CategoryOutcome {
            success: vec!["a".into()],
            failed: vec!["b".into()],
            total: 2,
        };
        assert!(outcome.is_conserved());

        let bad = CategoryOutcome {
            success: vec!["a".into()],
            failed: vec![],
            total: 2,
        };
        assert!(!bad.is_conserved());
    }

    #[test]
    fn partial_max_picks_the_larger_value() {
        let a = ColumnValue::Int64(5);
        let b = ColumnValue::Int64(9);
        assert_eq!(ColumnValue::partial_max(&a, &b), &ColumnValue::Int64(9));
        assert_eq!(ColumnValue::partial_max(&b, &a), &ColumnValue::Int64(9));
    }

    #[test]
    fn to_tracking_string_renders_each_variant() {
        assert_eq!(ColumnValue::Int64(42).to_tracking_string(), Some("42".to_string()));
        assert_eq!(ColumnValue::Null.to_tracking_string(), None);
        assert_eq!(ColumnValue::Text("abc".into()).to_tracking_string(), Some("abc".to_string()));
    }

    #[test]
    fn row_preserves_insertion_order() {
        let mut row = Row::new();
        row.push("b", ColumnValue::Int64(2));
        row.push("a", ColumnValue::Int64(1));
        let cols: Vec<&str> = row.columns().collect();
        assert_eq!(cols, vec!["b", "a"]);
        assert_eq!(row.get("a"), Some(&ColumnValue::Int64(1)));
    }
}
