//! PostgreSQL to Cloudflare R2 backup
//!
//! Dumps one database with `pg_dump`, uploads the file to an R2 bucket and
//! removes the local copy. Meant to be started by an external scheduler.

// pg-r2-backup/src/main.rs
mod backup;
mod config;
mod errors;

use anyhow::Result;
use config::BackupConfig;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "pg_r2_backup=info";

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialise logging: {:?}", e);
        return ExitCode::FAILURE;
    }

    let config = match BackupConfig::load() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(stage = %error.stage(), %error, "Backup run failed");
            return ExitCode::FAILURE;
        }
    };

    let empty = config.empty_fields();
    if !empty.is_empty() {
        tracing::warn!(variables = ?empty, "Configuration variables are empty");
    }

    match backup::run_backup_flow(&config).await {
        Ok(report) => {
            tracing::info!(
                key = %report.object_key,
                bytes = report.bytes,
                elapsed_ms = report.elapsed.as_millis() as u64,
                local_removed = report.cleaned_up,
                "Database backup and R2 upload completed successfully"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(stage = %error.stage(), %error, "Backup run failed");
            ExitCode::FAILURE
        }
    }
}

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the filter.
fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }
    Ok(())
}
