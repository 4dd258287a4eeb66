//! Scheduled database backup tool
//!
//! Dumps MySQL/MariaDB, PostgreSQL and MongoDB, gzips the dumps and uploads
//! them to S3-compatible object storage. Configured through environment variables.

// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use config::Settings;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is normal in containers.
    dotenv::dotenv().ok();
    init_logging();

    match run_app().await {
        Ok(_) => {
            info!("✅ Backup run completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_app() -> Result<()> {
    info!("🚀 Starting backup run");
    let settings = Settings::from_env().context("Failed to load configuration from environment")?;

    let summary = backup::run_backup_flow(&settings)
        .await
        .context("Backup process failed")?;

    for uploaded in &summary.uploaded {
        info!(
            engine = %uploaded.engine,
            key = %uploaded.key,
            local = %uploaded.local_path.display(),
            "Backup stored"
        );
    }
    info!(
        "{} backup(s) uploaded, {} engine(s) skipped",
        summary.uploaded.len(),
        summary.skipped.len()
    );
    Ok(())
}
