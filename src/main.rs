//! simsweep - batch entry point.
//!
//! Loads a batch YAML document, runs its entries, and reports per-task
//! outcomes. Exit status is non-zero when any task failed.

use std::path::PathBuf;
use std::process::ExitCode;

use simsweep::batch::{BatchTaskManager, EntryDisposition};
use simsweep::config::BatchSpec;
use simsweep::resources::ResourceSampler;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simsweep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run()) {
        Ok(all_succeeded) => {
            if all_succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("Batch failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<bool> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("batch.yaml"));
    info!(config = %config_path.display(), "Loading batch configuration");

    let spec = BatchSpec::from_yaml_file(&config_path)?;
    let mut batch = BatchTaskManager::new(spec)?;
    batch.set_post_poll_factory(|| ResourceSampler::new().into_hook());

    let results = batch.perform_tasks().await?;

    let mut all_succeeded = true;
    for entry in &results {
        match &entry.disposition {
            EntryDisposition::Completed(outcomes) => {
                for outcome in outcomes {
                    info!(
                        entry = %entry.name,
                        task = %outcome.name,
                        exit_code = outcome.exit_code,
                        cause = ?outcome.cause,
                        "Task outcome"
                    );
                    if !outcome.success() {
                        all_succeeded = false;
                    }
                }
            }
            EntryDisposition::ExpectedFailure { kind, .. } => {
                info!(entry = %entry.name, kind = %kind, "Entry failed as expected");
            }
        }
    }
    Ok(all_succeeded)
}
