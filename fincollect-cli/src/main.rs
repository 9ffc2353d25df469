//! fincollect CLI: run collectors and inspect their output.
//!
//! Commands:
//! - `collect <provider>`: run one provider's collector
//! - `collect-all`: run every configured provider
//! - `summary`: show the latest system summary and recent runs
//! - `store status`: list stored partitions
//!
//! Exit codes: 0 all items succeeded, 1 any item failed, 2 a provider was unreachable.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fincollect_runner::{
    read_system_summary, run_all, write_system_summary, CollectProgress, CollectionConfig,
    Collector, RunLog, RunSummary, StdoutProgress, SystemSummary,
};

#[derive(Parser)]
#[command(
    name = "fincollect",
    version,
    about = "fincollect: financial data collection pipeline"
)]
struct Cli {
    /// Collection config file.
    #[arg(long, global = true, default_value = "config/collectors.toml")]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `fincollect_runner=debug`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one provider's collector.
    Collect {
        /// Provider name as configured under [providers.<name>].
        provider: String,

        /// Suppress per-item progress lines.
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
    /// Run every configured provider.
    CollectAll {
        /// Run providers in parallel.
        #[arg(long, default_value_t = false)]
        parallel: bool,

        /// Suppress per-item progress lines.
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
    /// Show the latest system summary and recent runs.
    Summary {
        /// Number of recent runs to list from the run log.
        #[arg(long, default_value_t = 10)]
        runs: usize,

        /// Only list runs of this provider.
        #[arg(long)]
        provider: Option<String>,
    },
    /// Storage inspection.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List stored partitions with record counts and time ranges.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    let config = CollectionConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let code = match cli.command {
        Commands::Collect { provider, quiet } => run_collect(&config, &provider, quiet)?,
        Commands::CollectAll { parallel, quiet } => run_collect_all(&config, parallel, quiet)?,
        Commands::Summary { runs, provider } => {
            run_summary(&config, runs, provider.as_deref())?;
            0
        }
        Commands::Store {
            action: StoreAction::Status,
        } => {
            run_store_status(&config)?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run_collect(config: &CollectionConfig, provider: &str, quiet: bool) -> Result<i32> {
    let collector = Collector::from_config(config, provider)?;
    let summary = collector.run_with_progress(progress(quiet));

    record_runs(config, std::slice::from_ref(&summary))?;
    print_runs(std::slice::from_ref(&summary));
    Ok(summary.exit_code())
}

fn run_collect_all(config: &CollectionConfig, parallel: bool, quiet: bool) -> Result<i32> {
    let collectors = config
        .provider_names()
        .map(|name| Collector::from_config(config, name))
        .collect::<Result<Vec<_>, _>>()?;

    let system = run_all(&collectors, parallel, progress(quiet));

    let runs: Vec<RunSummary> = system.per_provider.values().cloned().collect();
    record_runs(config, &runs)?;
    print_runs(&runs);
    println!(
        "\nOverall: {}/{} items succeeded ({:.1}%)",
        system.items_succeeded(),
        system.items_attempted(),
        system.overall_success_rate * 100.0
    );
    Ok(system.exit_code())
}

fn progress(quiet: bool) -> Option<&'static dyn CollectProgress> {
    if quiet {
        None
    } else {
        Some(&StdoutProgress)
    }
}

/// Append the runs to the run log and fold them into `system_summary.json`.
fn record_runs(config: &CollectionConfig, runs: &[RunSummary]) -> Result<()> {
    let log = RunLog::new(config.storage.run_log_path());
    for run in runs {
        log.append(run)?;
    }

    let summary_path = config.storage.system_summary_path();
    let previous = match read_system_summary(&summary_path) {
        Ok(previous) => previous,
        Err(e) => {
            warn!(error = %e, "replacing unreadable system summary");
            None
        }
    };
    let mut latest = previous.map(|s| s.per_provider).unwrap_or_default();
    for run in runs {
        latest.insert(run.provider.clone(), run.clone());
    }
    let system = SystemSummary::from_runs(latest.into_values(), Utc::now());
    write_system_summary(&summary_path, &system)?;
    info!(path = %summary_path.display(), "system summary updated");
    Ok(())
}

fn run_summary(config: &CollectionConfig, runs: usize, provider: Option<&str>) -> Result<()> {
    match read_system_summary(&config.storage.system_summary_path())? {
        None => println!("No runs recorded yet."),
        Some(system) => {
            println!("System summary ({})", system.generated_at.format("%Y-%m-%d %H:%M UTC"));
            let latest: Vec<RunSummary> = system.per_provider.into_values().collect();
            print_runs(&latest);
            println!(
                "\nOverall success rate: {:.1}%",
                system.overall_success_rate * 100.0
            );
        }
    }

    let recent = RunLog::new(config.storage.run_log_path()).recent(runs, provider)?;
    if recent.is_empty() {
        return Ok(());
    }
    println!("\nRecent runs:");
    for run in &recent {
        println!(
            "  {}  {:<16} {:<16} {}/{} ok, {} retries",
            run.finished_at.format("%Y-%m-%d %H:%M"),
            run.provider,
            run.status.to_string(),
            run.items_succeeded,
            run.items_attempted,
            run.retries.len()
        );
        for err in &run.errors {
            println!("      {} [{}/{}] {}", err.item, err.stage, err.kind, err.message);
        }
    }
    Ok(())
}

fn run_store_status(config: &CollectionConfig) -> Result<()> {
    let store = config.storage.store();
    let partitions = store.status()?;
    if partitions.is_empty() {
        println!("Store is empty: {}", store.root().display());
        return Ok(());
    }

    let total: usize = partitions.iter().map(|p| p.meta.record_count).sum();
    println!("Store: {}", store.root().display());
    println!("Partitions: {}  Records: {total}", partitions.len());
    println!();
    println!(
        "{:<20} {:<28} {:>8}  {:<25} {:<16}",
        "Dataset", "Partition", "Records", "Range", "Written"
    );
    println!("{}", "-".repeat(101));
    for p in &partitions {
        let m = &p.meta;
        println!(
            "{:<20} {:<28} {:>8}  {:<25} {:<16}",
            m.dataset_type.to_string(),
            m.partition_key,
            m.record_count,
            format!("{} to {}", m.start.format("%Y-%m-%d"), m.end.format("%Y-%m-%d")),
            m.written_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn print_runs(runs: &[RunSummary]) {
    println!();
    println!(
        "{:<16} {:<16} {:>6} {:>6} {:>6} {:>8}",
        "Provider", "Status", "Items", "OK", "Failed", "Quality"
    );
    println!("{}", "-".repeat(63));
    for run in runs {
        let quality = run
            .mean_quality_score()
            .map(|q| format!("{q:.0}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<16} {:>6} {:>6} {:>6} {:>8}",
            run.provider,
            run.status.to_string(),
            run.items_attempted,
            run.items_succeeded,
            run.items_failed,
            quality
        );
    }
    for run in runs {
        for err in &run.errors {
            eprintln!(
                "Error for {}/{} at {}: {}",
                run.provider, err.item, err.stage, err.message
            );
        }
    }
}
