//! `TableRunner` — runs Extract then Load for one table.
//!
//! Resolves the `forceFull`/`time_gap_threshold_days` promotion before
//! invoking the Extractor, then runs the Loader, normalizing both
//! phases into a single JSON-serializable [`TableRunResult`] — the core
//! never hands opaque runtime objects across a process boundary.

use chrono::Utc;

use crate::cancel::CancelHandle;
use crate::error::Result;
use crate::extractor::Extractor;
use crate::loader::Loader;
use crate::models::{PhaseResult, TableRunResult, TableSpec, TrackingStatus};
use crate::pools::ConnectionPools;
use crate::tracking::{AnalyticsTracking, ReplicaTracking};

/// Runs the Extract -> Load pipeline for one table. Holds borrowed
/// pools only, same discipline as `Extractor`/`Loader`: no connection is
/// held across the two phases.
pub struct TableRunner<'a> {
    pools: &'a ConnectionPools,
}

impl<'a> TableRunner<'a> {
    pub fn new(pools: &'a ConnectionPools) -> Self {
        Self { pools }
    }

    /// Runs one table end to end: extract, then load.
    ///
    /// Never returns `Err` for a per-table failure: extract/load
    /// failures are folded into `TableRunResult::success = false`.
    /// Non-retryable errors propagate up from the extractor or loader
    /// and are caught here, which marks the table failed and returns.
    /// Only cancellation propagates as `Err`.
    pub async fn run(
        &self,
        spec: &TableSpec,
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Result<TableRunResult> {
        let force_full = self.resolve_force_full(spec, force_full).await;

        tracing::info!(table = %spec.name, force_full, "starting extract phase");
        let extractor = Extractor::new(self.pools);
        let extract = extractor.copy(spec, force_full, cancel).await?;

        if !extract.success {
            tracing::warn!(table = %spec.name, error = ?extract.error, "extract phase failed");
            self.mark_replica_failed(&spec.name).await;
            return Ok(TableRunResult {
                name: spec.name.clone(),
                success: false,
                extract: Some(extract),
                load: None,
            });
        }
        tracing::info!(table = %spec.name, rows = extract.rows_processed, "extract phase complete");

        tracing::info!(table = %spec.name, force_full, "starting load phase");
        let loader = Loader::new(self.pools);
        let load = loader.load(spec, force_full, cancel).await?;

        if !load.success {
            tracing::warn!(table = %spec.name, error = ?load.error, "load phase failed");
            self.mark_analytics_failed(&spec.name).await;
        } else {
            tracing::info!(table = %spec.name, rows = load.rows_processed, "load phase complete");
        }

        Ok(TableRunResult {
            name: spec.name.clone(),
            success: load.success,
            extract: Some(extract),
            load: Some(load),
        })
    }

    /// Promotes to a full refresh when `last_copied` is older than
    /// `time_gap_threshold_days`. A missing tracking row (first run) is
    /// not itself a promotion trigger —
    /// `Extractor::copy` already resolves `full_table` for that case via
    /// empty `incremental_columns`/missing replica table.
    async fn resolve_force_full(&self, spec: &TableSpec, force_full: bool) -> bool {
        if force_full {
            return true;
        }
        let tracking = ReplicaTracking::new(&self.pools.replica);
        let Ok(progress) = tracking.read_progress(&spec.name).await else {
            return force_full;
        };
        let Some(last_copied) = progress.last_processed else {
            return force_full;
        };
        let gap = Utc::now().signed_duration_since(last_copied);
        let threshold_days = i64::from(spec.time_gap_threshold_days);
        if gap.num_days() >= threshold_days {
            tracing::warn!(
                table = %spec.name,
                gap_days = gap.num_days(),
                threshold_days,
                "last_copied exceeds time_gap_threshold_days; promoting to full refresh"
            );
            true
        } else {
            force_full
        }
    }

    /// Marks the REPLICA tracking row `failed`, preserving every other
    /// field — the replica may be left in a partial state, but progress
    /// already recorded stays intact.
    async fn mark_replica_failed(&self, table_name: &str) {
        let tracking = ReplicaTracking::new(&self.pools.replica);
        let Ok(progress) = tracking.read_progress(table_name).await else {
            return;
        };
        if let Err(e) = tracking
            .update_progress(
                table_name,
                progress.last_primary_value.as_deref(),
                progress.primary_column_name.as_deref(),
                progress.rows_processed,
                TrackingStatus::Failed,
            )
            .await
        {
            tracing::warn!(table = table_name, error = %e, "failed to mark replica tracking as failed");
        }
    }

    /// Marks the ANALYTICS tracking row `failed`, preserving every other
    /// field.
    async fn mark_analytics_failed(&self, table_name: &str) {
        let tracking = AnalyticsTracking::new(&self.pools.analytics, self.pools.analytics_schema.as_str());
        let Ok(progress) = tracking.read_progress(table_name).await else {
            return;
        };
        if let Err(e) = tracking
            .update_progress(
                table_name,
                progress.last_primary_value.as_deref(),
                progress.primary_column_name.as_deref(),
                progress.rows_processed,
                TrackingStatus::Failed,
            )
            .await
        {
            tracing::warn!(table = table_name, error = %e, "failed to mark analytics tracking as failed");
        }
    }
}

/// Builds a failed `TableRunResult` without running any phase — used by
/// the Scheduler when cancellation is observed before a table's worker
/// starts, or when a table is missing from the catalog.
pub fn failed_result(name: impl Into<String>, reason: impl Into<String>) -> TableRunResult {
    TableRunResult {
        name: name.into(),
        success: false,
        extract: Some(PhaseResult::failed("unresolved", 0.0, false, reason)),
        load: None,
    }
}

/// Specialization of [`failed_result`] for the cancellation case.
pub fn cancelled_result(name: impl Into<String>) -> TableRunResult {
    failed_result(name, "run cancelled")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_result_is_unsuccessful() {
        let result = cancelled_result("patient");
        assert!(!result.success);
        assert_eq!(result.name, "patient");
        assert!(result.load.is_none());
    }

    #[test]
    fn failed_result_carries_the_reason_in_extract_error() {
        let result = failed_result("adj", "table not present in catalog");
        let extract = result.extract.expect("failed_result always sets extract");
        assert_eq!(extract.error.as_deref(), Some("table not present in catalog"));
    }
}
