//! Database backup orchestrator
//!
//! Runs scheduled backups of the configured databases, or a single command.

// dbvault/src/main.rs
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dbvault::backup::DumpRunner;
use dbvault::catalog::Catalog;
use dbvault::config::{AppConfig, EnvSecretResolver};
use dbvault::model::{FailureDetail, RecordStatus};
use dbvault::observer::{ObserverSet, StatsObserver, TracingObserver};
use dbvault::service::BackupService;
use dbvault::storage;

#[derive(Parser, Debug)]
#[command(name = "dbvault", version, about = "Scheduled database backups with retention and packaging")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "DBVAULT_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Back up one target now and wait for it to finish
    Backup {
        /// Id of a configured target
        target_id: String,
    },
    /// Build a package from the latest backups now
    Package,
    /// Apply every retention policy once
    Sweep,
    /// Print backup and package records
    List {
        /// Only backups of this target
        #[arg(long)]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let config = AppConfig::load_from_json(&cli.config).context(format!(
        "Failed to load application configuration from {}",
        cli.config.display()
    ))?;

    let storage = storage::from_config(&config.storage)
        .await
        .context("Failed to initialize artifact storage")?;
    let catalog = match &config.state_file {
        Some(path) => Catalog::open(path)
            .await
            .context(format!("Failed to open record catalog {}", path.display()))?,
        None => Catalog::in_memory(),
    };
    let catalog = Arc::new(catalog);
    let runner = Arc::new(
        DumpRunner::new(storage.clone()).with_scratch_root(config.temp_dump_root.clone()),
    );
    let stats = Arc::new(StatsObserver::new());
    let observers = ObserverSet::new()
        .with(Arc::new(TracingObserver))
        .with(stats.clone());

    let service = Arc::new(
        BackupService::from_config(
            &config,
            runner,
            catalog,
            storage,
            Arc::new(EnvSecretResolver),
            observers,
        )
        .await
        .context("Failed to start backup service")?,
    );

    match cli.command {
        Command::Run => {
            println!("🚀 Starting scheduler...");
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Ctrl-C received, draining running jobs"),
                    Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
                }
                signal.cancel();
            });
            service.run(shutdown).await;
        }
        Command::Backup { target_id } => {
            println!("🚀 Starting backup of {}...", target_id);
            let job = service
                .trigger_backup(&target_id)
                .await
                .context("Backup could not be submitted")?;
            service.executor().wait_idle().await;
            let record = service.get_backup(&job.id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status != RecordStatus::Completed {
                let reason = record.error.as_ref().map(describe).unwrap_or_default();
                bail!("Backup {} failed: {}", record.id, reason);
            }
        }
        Command::Package => {
            println!("📦 Building package...");
            let job = service
                .trigger_package()
                .await
                .context("Package build could not be submitted")?;
            service.executor().wait_idle().await;
            let record = service.get_package(&job.id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if record.status != RecordStatus::Completed {
                let reason = record.error.as_ref().map(describe).unwrap_or_default();
                bail!("Package {} failed: {}", record.id, reason);
            }
        }
        Command::Sweep => {
            println!("🧹 Applying retention policies...");
            let reports = service.run_retention_sweep().await;
            let mut failures = 0;
            for report in &reports {
                println!(
                    "{:?}: deleted {}, failed {}",
                    report.group,
                    report.deleted.len(),
                    report.failures.len()
                );
                for failure in &report.failures {
                    println!("  {} - {}", failure.record_id, describe(&failure.error));
                }
                failures += report.failures.len();
            }
            if failures > 0 {
                bail!("{} deletion(s) failed; they will be retried on the next sweep", failures);
            }
        }
        Command::List { target } => {
            let backups = service.list_backups(target.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&backups)?);
            if target.is_none() {
                let packages = service.list_packages().await;
                println!("{}", serde_json::to_string_pretty(&packages)?);
            }
        }
    }

    info!(stats = ?stats.snapshot(), "Session statistics");
    Ok(())
}

fn describe(detail: &FailureDetail) -> String {
    match &detail.hint {
        Some(hint) => format!("[{}] {} ({})", detail.kind.as_str(), detail.message, hint),
        None => format!("[{}] {}", detail.kind.as_str(), detail.message),
    }
}

/// Logs to stderr, or to the file named by `DBVAULT_LOG_FILE`.
fn setup_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Ok(log_file) = std::env::var("DBVAULT_LOG_FILE") {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context(format!("Failed to open log file {}", log_file))?;
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
    }
    Ok(())
}
