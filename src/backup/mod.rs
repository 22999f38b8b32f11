mod logic;
pub(crate) mod s3_upload; // Object store client and upload
pub(crate) mod db_dump; // pg_dump invocation and artifact checks

pub use logic::{BackupReport, perform_backup_orchestration};

use crate::config::BackupConfig;
use crate::errors::Result;
use db_dump::PgDumpExecutor;
use s3_upload::{R2Connector, UPLOAD_DEADLINE};

/// Public entry point for the backup process: `pg_dump` into the staging
/// directory, then upload to R2.
pub async fn run_backup_flow(config: &BackupConfig) -> Result<BackupReport> {
    let executor = PgDumpExecutor::locate()?;
    perform_backup_orchestration(config, &executor, &R2Connector, UPLOAD_DEADLINE).await
}
