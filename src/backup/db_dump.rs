// pg-r2-backup/src/backup/db_dump.rs
use chrono::{Local, NaiveDateTime};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use which::which;

use crate::config::{BackupConfig, DatabaseTarget};
use crate::errors::{BackupError, Result};

const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Exit status and captured diagnostics of one dump invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr text.
    pub diagnostics: String,
}

impl DumpOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A validated dump file in the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Something that can write a plain SQL dump of a database to a file.
pub trait DumpExecutor {
    async fn execute(&self, target: DatabaseTarget<'_>, output_path: &Path) -> Result<DumpOutput>;
}

/// Runs the `pg_dump` client binary.
#[derive(Debug, Clone)]
pub struct PgDumpExecutor {
    program: PathBuf,
}

impl PgDumpExecutor {
    /// Finds `pg_dump` in PATH.
    pub fn locate() -> Result<Self> {
        let program = which("pg_dump")?;
        tracing::debug!(path = %program.display(), "Found pg_dump executable");
        Ok(Self::with_program(program))
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The password only travels through `PGPASSWORD` so it never shows up in
    /// the process list.
    fn command(&self, target: DatabaseTarget<'_>, output_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-h")
            .arg(target.host)
            .arg("-p")
            .arg(target.port)
            .arg("-U")
            .arg(target.user)
            .arg("-d")
            .arg(target.database)
            .arg("-f")
            .arg(output_path)
            .arg("--no-privileges")
            .arg("--no-tablespaces")
            .arg("--format=plain")
            .arg("--encoding=UTF8")
            .arg("--verbose")
            .env("PGPASSWORD", target.password)
            .stdin(Stdio::null());
        cmd
    }
}

impl DumpExecutor for PgDumpExecutor {
    async fn execute(&self, target: DatabaseTarget<'_>, output_path: &Path) -> Result<DumpOutput> {
        tracing::info!(
            database = target.database,
            host = target.host,
            output = %output_path.display(),
            "Running pg_dump"
        );

        let spawn_error = |source: std::io::Error| BackupError::DumpSpawn {
            program: self.program.display().to_string(),
            source,
        };

        // stdout and stderr share one pipe so the captured text keeps the
        // order the child wrote it in.
        let (mut reader, writer) = std::io::pipe().map_err(spawn_error)?;
        let mut cmd = self.command(target, output_path);
        cmd.stdout(writer.try_clone().map_err(spawn_error)?)
            .stderr(writer);
        let spawned = cmd.spawn();
        // The command still owns the parent's write ends; reading only sees
        // EOF once they are closed.
        drop(cmd);
        let mut child = spawned.map_err(spawn_error)?;

        let capture = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).map(|_| buf)
        });

        let status = child.wait().await.map_err(spawn_error)?;
        let combined = capture
            .await
            .map_err(std::io::Error::other)
            .and_then(|read| read)
            .map_err(spawn_error)?;

        Ok(DumpOutput {
            exit_code: status.code(),
            diagnostics: String::from_utf8_lossy(&combined).into_owned(),
        })
    }
}

/// Creates the staging directory and any missing parents.
pub async fn ensure_backup_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o777);

    builder
        .create(dir)
        .await
        .map_err(|source| BackupError::Directory {
            path: dir.to_path_buf(),
            source,
        })
}

pub fn artifact_path(dir: &Path, db_name: &str) -> PathBuf {
    artifact_path_at(dir, db_name, Local::now().naive_local())
}

/// `<dir>/<db_name>_<YYYY-MM-DD_HH-MM-SS>.sql`
pub fn artifact_path_at(dir: &Path, db_name: &str, at: NaiveDateTime) -> PathBuf {
    let timestamp = at.format(ARTIFACT_TIMESTAMP_FORMAT);
    dir.join(format!("{}_{}.sql", db_name, timestamp))
}

/// Checks the dump produced a non-empty file and returns its size.
pub async fn validate_backup_file(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| BackupError::ArtifactMissing {
            path: path.to_path_buf(),
            source,
        })?;

    if metadata.len() == 0 {
        return Err(BackupError::ArtifactEmpty {
            path: path.to_path_buf(),
        });
    }
    Ok(metadata.len())
}

/// Dumps the configured database into the staging directory.
///
/// Returns the validated artifact.
pub async fn create_postgres_backup<D: DumpExecutor>(
    config: &BackupConfig,
    executor: &D,
) -> Result<DumpArtifact> {
    ensure_backup_dir(&config.backup_dir).await?;

    let backup_path = artifact_path(&config.backup_dir, &config.db_name);

    let output = executor
        .execute(config.database_target(), &backup_path)
        .await?;
    if !output.succeeded() {
        return Err(BackupError::DumpExecution {
            exit_code: output.exit_code,
            output: output.diagnostics,
        });
    }
    if !output.diagnostics.is_empty() {
        tracing::debug!(diagnostics = %output.diagnostics, "pg_dump output");
    }

    let bytes = validate_backup_file(&backup_path).await?;

    tracing::info!(path = %backup_path.display(), bytes, "Backup created successfully");
    Ok(DumpArtifact {
        path: backup_path,
        bytes,
    })
}
