//! Jobline worker - runs user import batches from JSON files.
//!
//! ```text
//! jobline-worker --config jobline.toml users-1.json users-2.json
//! ```
//!
//! Each file holds either `{ "fileName": ..., "records": [...] }` or a bare
//! array of records. Every record is sent to the user service configured in
//! the `user_api` section.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use serde_json::{json, Value};

use jobline_core::{
    config::Config,
    jobs::{
        setup_user_processing, HttpUserExecutor, JobQueue, JobState, PROCESS_USERS_TASK,
        USER_PROCESSING_QUEUE,
    },
    telemetry::{init_telemetry, TelemetryConfig},
};

#[derive(Parser, Debug)]
#[command(
    name = "jobline-worker",
    version,
    about = "Import user batches through the jobline queue"
)]
struct Args {
    /// JSON files to import
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Configuration file (environment variables still override it)
    #[arg(short, long, env = "JOBLINE_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for all imports to finish
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    wait_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    init_telemetry(&TelemetryConfig {
        service_name: "jobline-worker".to_string(),
        logging: config.logging.clone(),
    })?;

    let executor = HttpUserExecutor::new(&config.user_api)?;
    tracing::info!(url = %executor.users_url(), "Using user service");

    let queue = JobQueue::new(config)?;
    setup_user_processing(&queue, executor);

    let mut job_ids = Vec::new();
    for path in &args.files {
        let file_name = path.display().to_string();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", file_name))?;
        let payload = match serde_json::from_str::<Value>(&raw)
            .with_context(|| format!("Failed to parse {}", file_name))?
        {
            Value::Array(records) => json!({ "fileName": file_name.clone(), "records": records }),
            object => object,
        };

        let job_id = queue.submit(USER_PROCESSING_QUEUE, PROCESS_USERS_TASK, payload)?.id;
        tracing::info!(job_id = %job_id, file = %file_name, "Queued import");
        job_ids.push(job_id);
    }

    let subscriptions: Vec<_> = job_ids
        .iter()
        .map(|id| {
            queue.subscribe(*id, |job| {
                tracing::info!(
                    job_id = %job.id,
                    state = %job.state,
                    progress = job.progress,
                    "Import update"
                );
            })
        })
        .collect();

    let waits = join_all(
        job_ids
            .iter()
            .map(|id| queue.wait_for_terminal(id, args.wait_timeout)),
    );

    tokio::select! {
        results = waits => {
            for result in results {
                let status = match result {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::error!(error = %e, "Lost track of import");
                        continue;
                    }
                };
                match status.state {
                    JobState::Completed => tracing::info!(
                        job_id = %status.id,
                        file = ?status.file_name,
                        result = ?status.result,
                        "Import finished"
                    ),
                    _ => tracing::error!(
                        job_id = %status.id,
                        file = ?status.file_name,
                        error = ?status.error,
                        "Import failed"
                    ),
                }
            }
        }
        _ = shutdown_signal() => {}
    }

    drop(subscriptions);
    queue.shutdown().await;
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
