use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::load_job_config;
use crate::executor::{default_executor_factory, JobOrchestrator};

/// Run agent evaluation jobs in containerized environments.
#[derive(Parser, Debug)]
#[command(name = "rollout", version)]
pub struct Cli {
    /// Path to the job configuration file (YAML or JSON).
    pub config: PathBuf,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs one job and returns the process exit code: 0 on full success,
/// 1 when any trial failed or the job was cancelled.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    let cfg = load_job_config(&cli.config)?;

    // Priority: RUST_LOG env var > job-config log_level > "info".
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    // One cancellation signal threads through the feeder and every
    // in-flight provider operation.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down gracefully...");
            signal_cancel.cancel();
        }
    });

    let orchestrator = JobOrchestrator::new(cfg, default_executor_factory())?;
    let result = orchestrator.run(cancel).await?;

    println!();
    println!("Job: {}", result.job_name);
    println!("Total trials: {}", result.total_trials);
    println!("Completed: {}", result.completed_trials);
    println!("Failed: {}", result.failed_trials);
    if result.skipped_trials > 0 {
        println!("Skipped: {}", result.skipped_trials);
    }
    println!("Pass rate: {:.2}%", result.pass_rate * 100.0);
    println!("Mean reward: {:.4}", result.mean_reward);
    println!("Duration: {:.2}s", result.total_duration_sec);

    if result.failed_trials > 0 || result.cancelled {
        Ok(1)
    } else {
        Ok(0)
    }
}
