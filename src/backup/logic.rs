use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::info;

use super::BackupJob;
use super::db_dump::Dumper;
use super::s3_upload::ObjectStore;
use crate::config::{Engine, Settings};
use crate::errors::{AppError, Result};
use crate::utils::date_stamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBackup {
    pub engine: Engine,
    pub local_path: PathBuf,
    pub key: String,
}

#[derive(Debug, Default)]
pub struct BackupSummary {
    pub uploaded: Vec<UploadedBackup>,
    pub skipped: Vec<Engine>,
}

fn is_configured(settings: &Settings, engine: Engine) -> bool {
    match engine {
        Engine::MySql => settings.mysql.credential.is_active(),
        Engine::Postgres => settings.postgres.credential.is_active(),
        Engine::Mongo => settings.mongo.is_active(),
    }
}

/// Creates the export directory
fn ensure_export_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        AppError::io(format!("creating export directory {}", dir.display()), e)
    })?;
    info!("📂 Export directory ready at {}", dir.display());
    Ok(())
}

/// Dumps and uploads every configured engine in fixed order.
///
/// The first failure aborts the run; later engines are not attempted and a
/// failed dump is never uploaded.
pub async fn perform_backup_orchestration<D, S>(
    settings: &Settings,
    dumper: &D,
    store: &S,
    date: NaiveDate,
) -> Result<BackupSummary>
where
    D: Dumper + ?Sized,
    S: ObjectStore + ?Sized,
{
    ensure_export_dir(&settings.export_dir)?;
    let stamp = date_stamp(date);
    let mut summary = BackupSummary::default();

    for engine in Engine::ALL {
        if !is_configured(settings, engine) {
            info!("{} is not configured, no backup will be done", engine);
            summary.skipped.push(engine);
            continue;
        }

        let job = BackupJob {
            engine,
            destination: settings.export_dir.join(engine.file_name(&stamp)),
        };
        info!("🔍 Backing up {} to {}", engine, job.destination.display());

        dumper.dump(&job).await?;
        let key = store.upload_file(engine.prefix(), &job.destination).await?;

        info!("✅ {} dump successful, uploaded as {}", engine, key);
        summary.uploaded.push(UploadedBackup {
            engine,
            local_path: job.destination,
            key,
        });
    }

    Ok(summary)
}
