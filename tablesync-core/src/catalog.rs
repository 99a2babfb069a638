//! `ConfigCatalog` — read-only, in-memory view of the static YAML table
//! catalog.
//!
//! The catalog is produced by an external schema analyzer (out of scope
//! here) and consumed as-is. Loading fails fast if any table violates
//! an invariant; after a successful load the catalog never changes, so
//! any number of readers may share an `Arc<Catalog>` without locking.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Result, TableSyncError};
use crate::models::{PerformanceCategory, TableSpec};

/// Free-form catalog metadata (generation timestamp, schema hash, …).
/// Fields beyond what the core reads are tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogMetadata {
    pub generated_at: Option<String>,
    pub schema_hash: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    metadata: CatalogMetadata,
    tables: BTreeMap<String, TableSpec>,
}

/// Read-only handle to every table's configuration.
#[derive(Debug, Clone)]
pub struct ConfigCatalog {
    inner: Arc<CatalogInner>,
}

#[derive(Debug)]
struct CatalogInner {
    metadata: CatalogMetadata,
    tables: BTreeMap<String, TableSpec>,
    by_category: BTreeMap<PerformanceCategory, Vec<String>>,
}

impl ConfigCatalog {
    /// Loads and validates the catalog at `path`.
    ///
    /// # Errors
    /// `ErrConfigMissing` if the file can't be read or parsed as YAML.
    /// `ErrConfigInvalid` if any table's `name` field doesn't match its
    /// map key, or any §3 invariant is violated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TableSyncError::config_missing(format!("cannot read {}: {e}", path.display()))
        })?;

        let file: CatalogFile = serde_yaml::from_str(&contents)
            .map_err(|e| TableSyncError::config_missing(format!("invalid catalog YAML: {e}")))?;

        Self::from_parts(file.metadata, file.tables)
    }

    /// Builds a catalog directly from already-parsed tables, validating
    /// the same invariants `load` does. Used by tests and by callers
    /// that already hold a deserialized catalog.
    pub fn from_tables(tables: BTreeMap<String, TableSpec>) -> Result<Self> {
        Self::from_parts(
            CatalogMetadata {
                generated_at: None,
                schema_hash: None,
                extra: BTreeMap::new(),
            },
            tables,
        )
    }

    fn from_parts(metadata: CatalogMetadata, tables: BTreeMap<String, TableSpec>) -> Result<Self> {
        let mut by_category: BTreeMap<PerformanceCategory, Vec<String>> = BTreeMap::new();

        for (key, spec) in &tables {
            if key != &spec.name {
                return Err(TableSyncError::config_invalid(
                    key,
                    format!("catalog key '{key}' does not match table name '{}'", spec.name),
                ));
            }
            spec.validate()?;
            by_category
                .entry(spec.performance_category)
                .or_default()
                .push(spec.name.clone());
        }

        for names in by_category.values_mut() {
            names.sort();
        }

        Ok(Self {
            inner: Arc::new(CatalogInner {
                metadata,
                tables,
                by_category,
            }),
        })
    }

    pub fn metadata(&self) -> &CatalogMetadata {
        &self.inner.metadata
    }

    /// Looks up a single table's spec.
    pub fn get(&self, name: &str) -> Result<&TableSpec> {
        self.inner
            .tables
            .get(name)
            .ok_or_else(|| TableSyncError::config_invalid(name, "table not present in catalog"))
    }

    /// All table names, in catalog order (BTreeMap: alphabetical).
    pub fn list(&self) -> Vec<&str> {
        self.inner.tables.keys().map(String::as_str).collect()
    }

    /// Table names in the given performance category, sorted.
    pub fn by_category(&self, category: PerformanceCategory) -> &[String] {
        self.inner
            .by_category
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.inner.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tables.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{ExtractionStrategy, IncrementalStrategy, ProcessingPriority};

    fn spec(name: &str, category: PerformanceCategory) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            extraction_strategy: ExtractionStrategy::FullTable,
            incremental_columns: vec![],
            primary_incremental_column: None,
            incremental_strategy: IncrementalStrategy::SingleColumn,
            primary_key: vec!["Id".into()],
            batch_size: 1000,
            performance_category: category,
            processing_priority: ProcessingPriority::Medium,
            estimated_rows: 10,
            estimated_size_mb: 0.01,
            time_gap_threshold_days: 30,
        }
    }

    #[test]
    fn loads_and_groups_by_category() {
        let mut tables = BTreeMap::new();
        tables.insert("ref_tiny".to_string(), spec("ref_tiny", PerformanceCategory::Tiny));
        tables.insert(
            "procedurelog".to_string(),
            spec("procedurelog", PerformanceCategory::Large),
        );

        let catalog = ConfigCatalog::from_tables(tables).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.by_category(PerformanceCategory::Tiny), &["ref_tiny"]);
        assert_eq!(
            catalog.by_category(PerformanceCategory::Large),
            &["procedurelog"]
        );
        assert!(catalog.by_category(PerformanceCategory::Small).is_empty());
    }

    #[test]
    fn rejects_invalid_table_invariant() {
        let mut bad = spec("adj", PerformanceCategory::Small);
        bad.extraction_strategy = ExtractionStrategy::Incremental;
        bad.incremental_columns.clear();

        let mut tables = BTreeMap::new();
        tables.insert("adj".to_string(), bad);

        assert!(ConfigCatalog::from_tables(tables).is_err());
    }

    #[test]
    fn get_missing_table_is_an_error() {
        let catalog = ConfigCatalog::from_tables(BTreeMap::new()).unwrap();
        assert!(catalog.get("nope").is_err());
    }

    #[test]
    fn missing_file_yields_config_missing() {
        let err = ConfigCatalog::load("/nonexistent/catalog.yml").unwrap_err();
        assert!(matches!(err, TableSyncError::ConfigMissing { .. }));
    }
}
