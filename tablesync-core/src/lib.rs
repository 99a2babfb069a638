//! Core of the clinical-database extract-load pipeline: a cross-server
//! copier from a remote SOURCE into a local REPLICA, a size-adaptive
//! loader from REPLICA into the ANALYTICS warehouse, and a
//! size/priority-aware scheduler over both.
//!
//! This crate is the CORE only. Schema discovery (the catalog's
//! producer), CLI/DAG entry points, secrets loading, and downstream
//! dbt modeling are external collaborators consumed through the
//! interfaces this crate exposes — see [`catalog`] for the catalog
//! contract and [`scheduler`] for the top-level run entry points.
//!
//! # Guarantees
//! - No process-global mutable state: every component is constructed
//!   with explicit dependencies ([`ConnectionPools`], [`ConfigCatalog`]).
//! - No application-level locking: mutual exclusion is delegated to
//!   row-level upserts on the tracking tables ([`tracking`]).
//! - Connection strings are redacted before they reach a log line, an
//!   error message, or a tracking-table field ([`error::redact`]).
//!
//! # Architecture
//! Control flow is `Scheduler -> TableRunner -> Extractor -> Loader`,
//! with every component borrowing connections from [`ConnectionPools`]
//! and reading table configuration from [`ConfigCatalog`].

pub mod cancel;
pub mod catalog;
pub mod error;
pub mod extractor;
pub mod loader;
pub mod logging;
pub mod models;
pub mod pools;
pub mod rate_limit;
pub mod runner;
pub mod scheduler;
pub mod schema;
pub mod tracking;

pub use cancel::CancelHandle;
pub use catalog::{CatalogMetadata, ConfigCatalog};
pub use error::{Result, TableSyncError};
pub use extractor::Extractor;
pub use loader::Loader;
pub use models::{
    CategoryOutcome, CategoryResult, ColumnValue, ExtractionStrategy, IncrementalStrategy,
    PerformanceCategory, PhaseResult, ProcessingPriority, Row, TableRunResult, TableSpec,
    TrackingRow, TrackingStatus,
};
pub use pools::{AnalyticsSchema, ConnectionPools, Environment, PoolConfig};
pub use runner::TableRunner;
pub use scheduler::{RunFilter, Scheduler};
pub use schema::SchemaAdapter;
pub use tracking::{AnalyticsTracking, ReplicaTracking, TableSnapshot};
