mod logic;
pub(crate) mod db_dump;
pub(crate) mod s3_upload;

use std::path::PathBuf;

use crate::config::{Engine, Settings};
use crate::errors::Result;
use crate::utils;
use db_dump::ProcessDumper;
use s3_upload::S3Uploader;

pub use logic::{BackupSummary, perform_backup_orchestration};

/// One engine's dump-then-upload unit of work. Built fresh for every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    pub engine: Engine,
    pub destination: PathBuf,
}

/// Public entry point for the backup process: builds the uploader and the
/// process-backed dumper, then runs every configured engine in order.
pub async fn run_backup_flow(settings: &Settings) -> Result<BackupSummary> {
    let uploader = S3Uploader::new(&settings.storage).await?;
    let dumper = ProcessDumper::new(settings);
    perform_backup_orchestration(settings, &dumper, &uploader, utils::today()).await
}
