//! Thin CLI front door over `tablesync-core`'s run/status interfaces.
//!
//! This binary is argument parsing and process exit-code mapping only —
//! no DAG orchestration, no environment-file loading, no secrets
//! handling. Those are external collaborators.

use clap::{Args, Parser, Subcommand, ValueEnum};
use tablesync_core::{
    CancelHandle, CategoryResult, ConfigCatalog, ConnectionPools, Environment, PerformanceCategory,
    PoolConfig, Result, RunFilter, Scheduler, logging,
};

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "Extract-load core for the clinical warehouse pipeline")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Path to the table catalog YAML file.
    #[arg(long, global = true, default_value = "catalog.yml")]
    pub catalog: std::path::PathBuf,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run Extract then Load for a single table.
    RunTable {
        /// Table name, as it appears in the catalog.
        name: String,
        /// Force a full-table refresh regardless of tracked progress.
        #[arg(long)]
        force_full: bool,
    },
    /// Run every table in one performance category.
    RunCategory {
        category: CategoryArg,
        /// Worker pool size for the `large` category.
        #[arg(long, default_value_t = tablesync_core::scheduler::DEFAULT_MAX_WORKERS)]
        max_workers: usize,
        #[arg(long)]
        force_full: bool,
    },
    /// Run every table in the catalog.
    RunAll {
        #[arg(long, default_value_t = tablesync_core::scheduler::DEFAULT_MAX_WORKERS)]
        max_workers: usize,
        #[arg(long)]
        force_full: bool,
    },
    /// Print per-table progress from the tracking tables.
    Status {
        /// Restrict to a single table; otherwise reports every
        /// catalogued table.
        table: Option<String>,
        /// Emit machine-readable JSON instead of an aligned table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CategoryArg {
    Tiny,
    Small,
    Medium,
    Large,
}

impl From<CategoryArg> for PerformanceCategory {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Tiny => PerformanceCategory::Tiny,
            CategoryArg::Small => PerformanceCategory::Small,
            CategoryArg::Medium => PerformanceCategory::Medium,
            CategoryArg::Large => PerformanceCategory::Large,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.global.verbose, cli.global.quiet) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run(&cli).await {
        Ok(result) => {
            print_result(&result, &cli.command);
            let exit_code = if result_has_failures(&result) { 1 } else { 0 };
            std::process::exit(exit_code);
        }
        Err(e) => {
            eprintln!("tablesync: {e}");
            std::process::exit(1);
        }
    }
}

/// Mirrors the Scheduler's return shape even for `status`, which has no
/// `CategoryResult` of its own — `None` signals "print the snapshot
/// table that `run` already wrote to stdout instead".
enum RunOutcome {
    Categories(CategoryResult),
    StatusPrinted,
}

async fn run(cli: &Cli) -> Result<RunOutcome> {
    let catalog = ConfigCatalog::load(&cli.global.catalog)?;
    let environment = Environment::from_env()?;
    let pools = ConnectionPools::connect(environment, PoolConfig::default()).await?;
    let cancel = CancelHandle::new();
    spawn_ctrl_c_handler(cancel.clone());

    match &cli.command {
        Command::RunTable { name, force_full } => {
            let scheduler = Scheduler::new(&catalog, &pools);
            let result = scheduler.run_table(name, *force_full, &cancel).await?;
            Ok(RunOutcome::Categories(result))
        }
        Command::RunCategory {
            category,
            max_workers,
            force_full,
        } => {
            let scheduler = Scheduler::new(&catalog, &pools);
            let filter = RunFilter::Category((*category).into());
            let result = scheduler
                .run_by_category(filter, *max_workers, *force_full, &cancel)
                .await?;
            Ok(RunOutcome::Categories(result))
        }
        Command::RunAll {
            max_workers,
            force_full,
        } => {
            let scheduler = Scheduler::new(&catalog, &pools);
            let result = scheduler.run_all(*force_full, *max_workers, &cancel).await?;
            Ok(RunOutcome::Categories(result))
        }
        Command::Status { table, json } => {
            print_status(&catalog, &pools, table.as_deref(), *json).await?;
            Ok(RunOutcome::StatusPrinted)
        }
    }
}

fn spawn_ctrl_c_handler(cancel: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling after the next safe boundary");
            cancel.cancel();
        }
    });
}

async fn print_status(
    catalog: &ConfigCatalog,
    pools: &ConnectionPools,
    table: Option<&str>,
    json: bool,
) -> Result<()> {
    let replica = tablesync_core::ReplicaTracking::new(&pools.replica);
    let analytics = tablesync_core::AnalyticsTracking::new(&pools.analytics, pools.analytics_schema.as_str());

    let names: Vec<String> = match table {
        Some(name) => vec![name.to_string()],
        None => catalog.list().into_iter().map(str::to_string).collect(),
    };
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let snapshots = analytics.snapshot_all(&replica, &name_refs).await;

    if json {
        let rendered: Vec<_> = snapshots
            .iter()
            .map(|s| {
                serde_json::json!({
                    "table_name": s.table_name,
                    "copy_status": s.copy_status.map(|st| st.as_str()),
                    "rows_copied": s.rows_copied,
                    "last_copied": s.last_copied,
                    "load_status": s.load_status.map(|st| st.as_str()),
                    "rows_loaded": s.rows_loaded,
                    "last_loaded": s.last_loaded,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered).unwrap_or_default());
    } else {
        println!(
            "{:<32} {:<10} {:>12} {:<10} {:>12}",
            "table", "copy", "rows_copied", "load", "rows_loaded"
        );
        for s in &snapshots {
            println!(
                "{:<32} {:<10} {:>12} {:<10} {:>12}",
                s.table_name,
                s.copy_status.map_or("-", |st| st.as_str()),
                s.rows_copied,
                s.load_status.map_or("-", |st| st.as_str()),
                s.rows_loaded,
            );
        }
    }

    Ok(())
}

fn result_has_failures(outcome: &RunOutcome) -> bool {
    match outcome {
        RunOutcome::Categories(result) => result.values().any(|o| !o.failed.is_empty()),
        RunOutcome::StatusPrinted => false,
    }
}

fn print_result(outcome: &RunOutcome, command: &Command) {
    let RunOutcome::Categories(result) = outcome else {
        return;
    };
    if matches!(command, Command::Status { .. }) {
        return;
    }
    match serde_json::to_string_pretty(result) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{result:?}"),
    }
}
