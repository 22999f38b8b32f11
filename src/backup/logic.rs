// pg-r2-backup/src/backup/logic.rs
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::backup::db_dump::{DumpArtifact, DumpExecutor, create_postgres_backup};
use crate::backup::s3_upload::{StoreConnector, upload_artifact};
use crate::config::BackupConfig;
use crate::errors::{Result, Stage};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub artifact: PathBuf,
    pub object_key: String,
    pub bytes: u64,
    /// False when the local artifact could not be removed.
    pub cleaned_up: bool,
    pub elapsed: Duration,
}

/// Dump, then upload, then clean up. The first failing step ends the run and
/// leaves any artifact on disk.
pub async fn perform_backup_orchestration<D, C>(
    config: &BackupConfig,
    executor: &D,
    connector: &C,
    upload_deadline: Duration,
) -> Result<BackupReport>
where
    D: DumpExecutor,
    C: StoreConnector,
{
    let started = Instant::now();

    tracing::info!(stage = %Stage::Dumping, database = %config.db_name, "Starting database backup");
    let DumpArtifact {
        path: artifact,
        bytes,
    } = create_postgres_backup(config, executor).await?;

    tracing::info!(stage = %Stage::Uploading, bucket = %config.r2_bucket_name, "Connecting to object store");
    let store = connector.connect(config).await?;
    let object_key =
        upload_artifact(&store, &config.r2_bucket_name, &artifact, upload_deadline).await?;

    tracing::info!(stage = %Stage::CleaningUp, path = %artifact.display(), "Removing local backup");
    let cleaned_up = cleanup_backup(&artifact).await;

    Ok(BackupReport {
        artifact,
        object_key,
        bytes,
        cleaned_up,
        elapsed: started.elapsed(),
    })
}

/// Deletes the local artifact. Failure is logged, never returned.
pub async fn cleanup_backup(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "Failed to remove local backup file");
            false
        }
    }
}
