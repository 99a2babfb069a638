//! `ConnectionPools` — pooled database handles for SOURCE, REPLICA, and
//! ANALYTICS, plus the `execute_with_retry` helper every I/O call in
//! the core is wrapped in.
//!
//! Builds on `PgPoolOptions`/`MySqlPoolOptions` and connection-string
//! validation the way a single-adapter connection module would, but
//! generalized from "one adapter, one pool" to "three named pools, one
//! per pipeline role".

use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool};

use crate::cancel::CancelHandle;
use crate::error::{Result, TableSyncError};
use crate::models::PerformanceCategory;
use crate::rate_limit::RateLimiter;

/// Which deployment environment a pool was configured against. The spec
/// (§6) requires this be explicit and fail fast if unset or mismatched;
/// there is no "default" that silently falls back to production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Test,
}

impl Environment {
    /// Reads the `TABLESYNC_ENV` variable. Fails fast (`ErrEnvironment`)
    /// if unset or not one of `production`/`test`.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("TABLESYNC_ENV").map_err(|_| {
            TableSyncError::environment("TABLESYNC_ENV is not set; refusing to guess environment")
        })?;
        match raw.as_str() {
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(TableSyncError::environment(format!(
                "TABLESYNC_ENV must be 'production' or 'test', got '{other}'"
            ))),
        }
    }
}

/// The analytics warehouse carries four schemas; the core only ever
/// targets `raw` 
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsSchema {
    Raw,
    Staging,
    Intermediate,
    Marts,
}

impl AnalyticsSchema {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalyticsSchema::Raw => "raw",
            AnalyticsSchema::Staging => "staging",
            AnalyticsSchema::Intermediate => "intermediate",
            AnalyticsSchema::Marts => "marts",
        }
    }
}

/// Pool sizing/timeout knobs, tunable but defaulting to the spec's
/// nominal values (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub base_size: u32,
    pub overflow: u32,
    pub recycle: Duration,
    pub acquire_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_size: 20,
            overflow: 40,
            recycle: Duration::from_secs(1800),
            acquire_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    fn max_connections(&self) -> u32 {
        self.base_size + self.overflow
    }
}

/// Connection parameters for a single database family, read from
/// environment variables. Never derives `Debug`/`Display` in a way
/// that would print the password; callers redact the URL before
/// logging it.
#[derive(Clone)]
pub struct DbParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Drop for DbParams {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.password.zeroize();
    }
}

impl DbParams {
    /// Reads `{prefix}_HOST`, `{prefix}_PORT`, `{prefix}_DATABASE`,
    /// `{prefix}_USER`, `{prefix}_PASSWORD` (e.g. prefix `"SOURCE"`).
    pub fn from_env(prefix: &str) -> Result<Self> {
        let get = |suffix: &str| -> Result<String> {
            std::env::var(format!("{prefix}_{suffix}")).map_err(|_| {
                TableSyncError::environment(format!("{prefix}_{suffix} is not set"))
            })
        };
        let port: u16 = get("PORT")?
            .parse()
            .map_err(|_| TableSyncError::environment(format!("{prefix}_PORT is not numeric")))?;
        Ok(Self {
            host: get("HOST")?,
            port,
            database: get("DATABASE")?,
            user: get("USER")?,
            password: get("PASSWORD")?,
        })
    }

    fn mysql_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Holds the three pools that every other component borrows from.
pub struct ConnectionPools {
    pub environment: Environment,
    pub source: MySqlPool,
    pub source_database: String,
    pub replica: MySqlPool,
    pub replica_database: String,
    pub analytics: PgPool,
    pub analytics_schema: AnalyticsSchema,
    config: PoolConfig,
    rate_limiter: RateLimiter,
}

impl ConnectionPools {
    /// Builds all three pools from environment variables, applying
    /// per-engine session tuning on first acquisition.
    pub async fn connect(environment: Environment, config: PoolConfig) -> Result<Self> {
        let source_params = DbParams::from_env("SOURCE")?;
        let replica_params = DbParams::from_env("REPLICA")?;
        let analytics_params = DbParams::from_env("ANALYTICS")?;
        let analytics_schema = std::env::var("ANALYTICS_SCHEMA").unwrap_or_else(|_| "raw".into());
        let analytics_schema = match analytics_schema.as_str() {
            "raw" => AnalyticsSchema::Raw,
            "staging" => AnalyticsSchema::Staging,
            "intermediate" => AnalyticsSchema::Intermediate,
            "marts" => AnalyticsSchema::Marts,
            other => {
                return Err(TableSyncError::environment(format!(
                    "ANALYTICS_SCHEMA '{other}' is not one of raw/staging/intermediate/marts"
                )));
            }
        };

        let source = Self::build_mysql_pool(&source_params, &config).await?;
        apply_source_session_tuning(&source).await;

        let replica = Self::build_mysql_pool(&replica_params, &config).await?;
        apply_source_session_tuning(&replica).await;

        let analytics = Self::build_postgres_pool(&analytics_params, &config).await?;
        apply_analytics_session_tuning(&analytics).await;

        Ok(Self {
            environment,
            source,
            source_database: source_params.database.clone(),
            replica,
            replica_database: replica_params.database.clone(),
            analytics,
            analytics_schema,
            config,
            rate_limiter: RateLimiter::new(),
        })
    }

    /// Assembles pools already connected by the caller (testcontainers
    /// integration tests, mainly — constructing real pools from fixed
    /// container ports rather than environment variables).
    pub fn from_pools(
        environment: Environment,
        source: MySqlPool,
        source_database: impl Into<String>,
        replica: MySqlPool,
        replica_database: impl Into<String>,
        analytics: PgPool,
        analytics_schema: AnalyticsSchema,
        config: PoolConfig,
    ) -> Self {
        Self {
            environment,
            source,
            source_database: source_database.into(),
            replica,
            replica_database: replica_database.into(),
            analytics,
            analytics_schema,
            config,
            rate_limiter: RateLimiter::new(),
        }
    }

    async fn build_mysql_pool(params: &DbParams, config: &PoolConfig) -> Result<MySqlPool> {
        MySqlPoolOptions::new()
            .max_connections(config.max_connections())
            .min_connections(config.base_size.min(5))
            .acquire_timeout(config.acquire_timeout)
            .max_lifetime(Some(config.recycle))
            .connect(&params.mysql_url())
            .await
            .map_err(|e| TableSyncError::connect(crate::error::redact(&params.mysql_url()), e))
    }

    async fn build_postgres_pool(params: &DbParams, config: &PoolConfig) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(config.max_connections())
            .min_connections(config.base_size.min(5))
            .acquire_timeout(config.acquire_timeout)
            .max_lifetime(Some(config.recycle))
            .connect(&params.postgres_url())
            .await
            .map_err(|e| TableSyncError::connect(crate::error::redact(&params.postgres_url()), e))
    }

    /// Runs `op`, retrying transient failures with exponential backoff
    /// (default 3 attempts, 1s base). When `category` is `Some`,
    /// applies the per-category SOURCE rate limit before every attempt.
    /// Honors `cancel` between attempts and during backoff sleeps.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        cancel: &CancelHandle,
        category: Option<PerformanceCategory>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TableSyncError::Cancelled);
            }

            if let Some(category) = category {
                self.rate_limiter.throttle(category, cancel).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.retry_attempts => {
                    attempt += 1;
                    let backoff = self.config.retry_base * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.retry_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying transient error"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => return Err(TableSyncError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Applies bulk-optimized session settings on first acquisition of a
/// SOURCE/REPLICA session : large insert buffers, disabled
/// autocommit/FK/unique checks during bulk work. Privilege failures are
/// logged and skipped, never fatal.
async fn apply_source_session_tuning(pool: &MySqlPool) {
    let statements = [
        "SET SESSION bulk_insert_buffer_size = 256 * 1024 * 1024",
        "SET SESSION foreign_key_checks = 0",
        "SET SESSION unique_checks = 0",
        "SET SESSION autocommit = 0",
    ];
    for stmt in statements {
        if let Err(e) = sqlx::query(stmt).execute(pool).await {
            tracing::warn!(statement = stmt, error = %e, "skipping session tuning statement (likely insufficient privilege)");
        }
    }
}

/// Applies large working-memory settings on first acquisition of a
/// warehouse session 
async fn apply_analytics_session_tuning(pool: &PgPool) {
    let statements = ["SET work_mem = '256MB'", "SET maintenance_work_mem = '512MB'"];
    for stmt in statements {
        if let Err(e) = sqlx::query(stmt).execute(pool).await {
            tracing::warn!(statement = stmt, error = %e, "skipping session tuning statement (likely insufficient privilege)");
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults_match_nominal_values() {
        let config = PoolConfig::default();
        assert_eq!(config.base_size, 20);
        assert_eq!(config.overflow, 40);
        assert_eq!(config.max_connections(), 60);
        assert_eq!(config.recycle, Duration::from_secs(1800));
        assert_eq!(config.acquire_timeout, Duration::from_secs(300));
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn environment_rejects_unset_var() {
        // SAFETY-equivalent: tests run single-threaded per process for env
        // var mutation in this module; no other test reads TABLESYNC_ENV.
        unsafe {
            std::env::remove_var("TABLESYNC_ENV");
        }
        assert!(Environment::from_env().is_err());
    }

    #[test]
    fn environment_rejects_unknown_value() {
        unsafe {
            std::env::set_var("TABLESYNC_ENV", "staging");
        }
        assert!(Environment::from_env().is_err());
        unsafe {
            std::env::remove_var("TABLESYNC_ENV");
        }
    }

    #[test]
    fn environment_accepts_production_and_test() {
        unsafe {
            std::env::set_var("TABLESYNC_ENV", "production");
        }
        assert_eq!(Environment::from_env().unwrap(), Environment::Production);
        unsafe {
            std::env::set_var("TABLESYNC_ENV", "test");
        }
        assert_eq!(Environment::from_env().unwrap(), Environment::Test);
        unsafe {
            std::env::remove_var("TABLESYNC_ENV");
        }
    }
}
