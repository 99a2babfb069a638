//! `Scheduler` — size/priority-aware orchestration over every table in
//! the catalog.
//!
//! Groups tables by [`PerformanceCategory`]; the `large` category runs
//! through a bounded worker pool, everything else runs sequentially. A
//! `Scheduler` is constructed with borrowed references to its
//! collaborators and carries no process-global state of its own.

use futures::stream::{self, StreamExt};

use crate::cancel::CancelHandle;
use crate::catalog::ConfigCatalog;
use crate::error::Result;
use crate::models::{CategoryOutcome, CategoryResult, PerformanceCategory, TableRunResult};
use crate::pools::ConnectionPools;
use crate::runner::{self, TableRunner};

/// Default size of the worker pool used for the `large` category and
/// for the Loader's `parallel` strategy.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Selects which tables a grouped pass considers: all tables, or a
/// filtered subset. The grouped-by-category structure
/// itself — `large` concurrent, everything else sequential — applies
/// regardless of which filter is in effect.
#[derive(Debug, Clone)]
pub enum RunFilter {
    /// Every table in the catalog.
    All,
    /// Only tables in the given performance category.
    Category(PerformanceCategory),
    /// Only the named tables (unknown names are skipped, not failed —
    /// `run_table` is the entry point that treats a missing name as an
    /// error).
    Names(Vec<String>),
}

/// Size/priority-aware scheduler. Borrows its catalog and connection
/// pools rather than owning them, so a single `ConnectionPools` can be
/// shared across a CLI invocation that calls the Scheduler more than
/// once (e.g. `run-table` followed by `status`).
pub struct Scheduler<'a> {
    catalog: &'a ConfigCatalog,
    pools: &'a ConnectionPools,
}

impl<'a> Scheduler<'a> {
    pub fn new(catalog: &'a ConfigCatalog, pools: &'a ConnectionPools) -> Self {
        Self { catalog, pools }
    }

    /// Runs a single named table. Returns a `CategoryResult` with
    /// exactly one entry, keyed by that table's performance category,
    /// so every entry point shares the same return shape.
    pub async fn run_table(
        &self,
        name: &str,
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Result<CategoryResult> {
        let spec = self.catalog.get(name)?;
        let category = spec.performance_category;
        let result = self.run_one(name, force_full, cancel).await;

        let mut by_category = CategoryResult::new();
        by_category.insert(category.as_str().to_string(), outcome_of(&[result]));
        Ok(by_category)
    }

    /// Runs a grouped pass restricted to `filter`.
    pub async fn run_by_category(
        &self,
        filter: RunFilter,
        max_workers: usize,
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Result<CategoryResult> {
        self.run_grouped(&filter, max_workers.max(1), force_full, cancel).await
    }

    /// Runs every table in the catalog.
    pub async fn run_all(
        &self,
        force_full: bool,
        max_workers: usize,
        cancel: &CancelHandle,
    ) -> Result<CategoryResult> {
        self.run_grouped(&RunFilter::All, max_workers.max(1), force_full, cancel).await
    }

    async fn run_grouped(
        &self,
        filter: &RunFilter,
        max_workers: usize,
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Result<CategoryResult> {
        let mut result = CategoryResult::new();

        for category in PerformanceCategory::ALL {
            if let RunFilter::Category(wanted) = filter {
                if *wanted != category {
                    continue;
                }
            }

            let mut names: Vec<String> = self.catalog.by_category(category).to_vec();
            if let RunFilter::Names(wanted) = filter {
                names.retain(|n| wanted.iter().any(|w| w == n));
            }
            if names.is_empty() {
                continue;
            }

            tracing::info!(
                category = %category,
                table_count = names.len(),
                "starting category pass"
            );

            let outcomes = if category == PerformanceCategory::Large {
                self.run_concurrent(&names, max_workers, force_full, cancel).await
            } else {
                self.run_sequential(&names, force_full, cancel).await
            };

            let outcome = outcome_of(&outcomes);
            tracing::info!(
                category = %category,
                success = outcome.success.len(),
                failed = outcome.failed.len(),
                "category pass complete"
            );
            debug_assert!(outcome.is_conserved());
            result.insert(category.as_str().to_string(), outcome);
        }

        Ok(result)
    }

    /// Sequential pass: used for `tiny`/`small`/`medium`.
    /// Stops starting new tables once cancellation is observed — tables
    /// not yet started are recorded as failed so category totals stay
    /// conserved without ever touching the database for them.
    async fn run_sequential(
        &self,
        names: &[String],
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Vec<TableRunResult> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if cancel.is_cancelled() {
                results.push(runner::cancelled_result(name.clone()));
                continue;
            }
            results.push(self.run_one(name, force_full, cancel).await);
        }
        results
    }

    /// Bounded concurrent pass: used for `large`, a worker pool of
    /// `max_workers`. Tables already in flight when
    /// cancellation fires still run to their next safe boundary inside
    /// `TableRunner`/`Extractor`/`Loader`; tables not yet polled observe
    /// cancellation immediately and report as cancelled.
    async fn run_concurrent(
        &self,
        names: &[String],
        max_workers: usize,
        force_full: bool,
        cancel: &CancelHandle,
    ) -> Vec<TableRunResult> {
        stream::iter(names.iter().cloned())
            .map(|name| async move {
                if cancel.is_cancelled() {
                    return runner::cancelled_result(name);
                }
                self.run_one(&name, force_full, cancel).await
            })
            .buffer_unordered(max_workers)
            .collect()
            .await
    }

    /// Runs one table, normalizing a propagated cancellation into a
    /// failed result — the Scheduler itself never returns `Err` for a
    /// per-table outcome; a missing catalog entry or a cancelled run
    /// both become a failed `TableRunResult` instead.
    async fn run_one(&self, name: &str, force_full: bool, cancel: &CancelHandle) -> TableRunResult {
        let spec = match self.catalog.get(name) {
            Ok(spec) => spec,
            Err(e) => return runner::failed_result(name, e.to_string()),
        };
        let table_runner = TableRunner::new(self.pools);
        match table_runner.run(spec, force_full, cancel).await {
            Ok(result) => result,
            Err(_) => runner::cancelled_result(name),
        }
    }
}

/// Folds a list of per-table results into one `CategoryOutcome`,
/// conserving `success.len() + failed.len() == total` by construction.
fn outcome_of(results: &[TableRunResult]) -> CategoryOutcome {
    let mut outcome = CategoryOutcome {
        total: results.len(),
        ..CategoryOutcome::default()
    };
    for result in results {
        if result.success {
            outcome.success.push(result.name.clone());
        } else {
            outcome.failed.push(result.name.clone());
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PhaseResult;

    fn result(name: &str, success: bool) -> TableRunResult {
        TableRunResult {
            name: name.to_string(),
            success,
            extract: Some(PhaseResult::ok("full_table", 3, None, None, 0.1, false)),
            load: None,
        }
    }

    #[test]
    fn outcome_of_conserves_totals() {
        let results = vec![result("a", true), result("b", false), result("c", true)];
        let outcome = outcome_of(&results);
        assert!(outcome.is_conserved());
        assert_eq!(outcome.success, vec!["a", "c"]);
        assert_eq!(outcome.failed, vec!["b"]);
        assert_eq!(outcome.total, 3);
    }

    #[test]
    fn outcome_of_empty_input_is_conserved() {
        let outcome = outcome_of(&[]);
        assert!(outcome.is_conserved());
        assert_eq!(outcome.total, 0);
    }

    #[test]
    fn run_filter_category_variant_matches_by_value() {
        let filter = RunFilter::Category(PerformanceCategory::Large);
        assert!(matches!(filter, RunFilter::Category(PerformanceCategory::Large)));
    }
}
