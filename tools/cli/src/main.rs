//! intsync CLI - Drive the sync engine from a JSON fixture.
//!
//! Fixtures declare tasks, their conversion schemas and the records each
//! task's adapter serves. Everything runs against in-memory collaborators.

mod fixture;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use intsync_common::SyncExecution;
use intsync_sync::{EngineConfig, EngineStatistics, EXECUTION_DURATION_MS};

use fixture::{Fixture, Loaded};

#[derive(Parser)]
#[command(name = "intsync")]
#[command(about = "intsync - Integration sync execution engine")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Engine config file, overriding the fixture's config.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger tasks manually and wait for them to finish.
    Run {
        /// Path to the fixture.
        #[arg(short, long)]
        fixture: PathBuf,

        /// Only run the named task (default: all).
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Process due tasks as the scheduler would.
    Due {
        /// Path to the fixture.
        #[arg(short, long)]
        fixture: PathBuf,

        /// Number of scheduler passes.
        #[arg(short, long, default_value_t = 1)]
        passes: u32,
    },

    /// Print the effective engine configuration.
    Config {
        /// Fixture whose config to use.
        #[arg(short, long)]
        fixture: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_override = cli
        .config
        .as_deref()
        .map(load_config)
        .transpose()?;

    match cli.command {
        Commands::Run { fixture, task } => cmd_run(&fixture, task.as_deref(), config_override).await,

        Commands::Due { fixture, passes } => cmd_due(&fixture, passes, config_override).await,

        Commands::Config { fixture } => cmd_config(fixture.as_deref(), config_override),
    }
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::from_json_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))
}

/// Trigger tasks manually.
async fn cmd_run(
    fixture_path: &Path,
    task_name: Option<&str>,
    config_override: Option<EngineConfig>,
) -> Result<()> {
    let loaded = Fixture::from_file(fixture_path)?.install(config_override)?;

    let selected: Vec<_> = match task_name {
        Some(name) => {
            let task = loaded
                .task(name)
                .with_context(|| format!("No task named '{}' in fixture", name))?;
            vec![(name.to_string(), task.clone())]
        }
        None => loaded.tasks.clone(),
    };

    let mut started = Vec::new();
    for (name, task) in selected {
        info!("Triggering task: {}", name);
        match loaded.engine.trigger_sync(task.id, loaded.tenant, None).await {
            Ok(execution) => started.push((name, execution)),
            Err(e) => println!("{}: not started ({})", name, e),
        }
    }

    loaded.engine.drain().await;

    for (name, execution) in &started {
        let execution = loaded
            .engine
            .get_execution(execution.id, loaded.tenant)
            .await
            .context("Failed to reload execution")?;
        print_execution(name, &execution);
    }

    print_summary(&loaded).await
}

/// Process due tasks for a number of passes.
async fn cmd_due(
    fixture_path: &Path,
    passes: u32,
    config_override: Option<EngineConfig>,
) -> Result<()> {
    let loaded = Fixture::from_file(fixture_path)?.install(config_override)?;

    for pass in 1..=passes {
        let report = loaded
            .engine
            .process_due_tasks()
            .await
            .context("Failed to process due tasks")?;
        loaded.engine.drain().await;

        println!(
            "Pass {}: {} triggered, {} skipped",
            pass,
            report.triggered.len(),
            report.skipped.len()
        );
        for execution in &report.triggered {
            let execution = loaded
                .engine
                .get_execution(execution.id, loaded.tenant)
                .await
                .context("Failed to reload execution")?;
            print_execution(task_name(&loaded, &execution), &execution);
        }
        for (task_id, reason) in &report.skipped {
            println!("  skipped {}: {}", task_id, reason);
        }
    }

    print_summary(&loaded).await
}

/// Print the effective configuration as JSON.
fn cmd_config(fixture_path: Option<&Path>, config_override: Option<EngineConfig>) -> Result<()> {
    let config = match fixture_path {
        Some(path) => Fixture::from_file(path)?.engine_config(config_override),
        None => config_override.unwrap_or_default(),
    };
    config.validate().context("Invalid engine configuration")?;

    println!("{}", config.to_json()?);

    Ok(())
}

fn task_name<'a>(loaded: &'a Loaded, execution: &SyncExecution) -> &'a str {
    loaded
        .tasks
        .iter()
        .find(|(_, task)| task.id == execution.sync_task_id)
        .map(|(name, _)| name.as_str())
        .unwrap_or("?")
}

fn print_execution(name: &str, execution: &SyncExecution) {
    let progress = &execution.progress;
    println!("{}: {}", name, execution.status.as_str());
    println!("  Execution: {}", execution.id);
    println!(
        "  Records: {} processed ({} succeeded, {} failed, {} skipped)",
        execution.records_processed, progress.succeeded, progress.failed, progress.skipped
    );
    println!(
        "  Batches: {}/{}",
        progress.current_batch, progress.total_batches
    );
    if progress.conflicts > 0 {
        println!("  Conflicts: {}", progress.conflicts);
    }
    if let Some(duration) = execution.duration_ms {
        println!("  Duration: {} ms", duration);
    }
    if let Some(error) = &execution.error {
        println!("  Error: {}", error.message);
    }
    for failure in &execution.record_failures {
        println!("    record {}: {}", failure.index, failure.message);
    }
}

async fn print_summary(loaded: &Loaded) -> Result<()> {
    let stats: EngineStatistics = loaded.engine.get_statistics();

    println!("\nEngine Statistics:");
    println!("  Executions started: {}", stats.executions_started);
    println!(
        "  Completed: {} ({} success, {} partial, {} failed)",
        stats.executions_completed(),
        stats.executions_succeeded,
        stats.executions_partial,
        stats.executions_failed
    );
    println!(
        "  Records: {} fetched, {} succeeded, {} failed, {} skipped",
        stats.records_fetched, stats.records_succeeded, stats.records_failed, stats.records_skipped
    );
    println!(
        "  Conflicts: {} detected, {} auto-resolved, {} pending",
        stats.conflicts_detected, stats.conflicts_auto_resolved, stats.conflicts_pending
    );

    let durations = loaded.monitor.memory.metrics_named(EXECUTION_DURATION_MS);
    if !durations.is_empty() {
        let total: f64 = durations.iter().map(|metric| metric.value).sum();
        println!(
            "  Mean duration: {:.0} ms",
            total / durations.len() as f64
        );
    }
    println!("  Stored entities: {}", loaded.store.len());

    let pending = loaded
        .engine
        .list_pending_conflicts(loaded.tenant, None)
        .await
        .context("Failed to list conflicts")?;
    if !pending.is_empty() {
        println!("\nPending Conflicts:");
        for conflict in pending {
            println!(
                "  {} on {} (fields: {})",
                conflict.id,
                conflict.entity_id,
                conflict.fields.join(", ")
            );
        }
    }

    Ok(())
}
