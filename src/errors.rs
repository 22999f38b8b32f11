use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStreamError;
use aws_smithy_types::error::display::DisplayErrorContext;
use thiserror::Error;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuring,
    Dumping,
    Uploading,
    CleaningUp,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configuring => "configuration",
            Stage::Dumping => "dump",
            Stage::Uploading => "upload",
            Stage::CleaningUp => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to create backup directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pg_dump executable not found in PATH: {0}")]
    DumpToolNotFound(#[from] which::Error),

    #[error("Failed to start {program}: {source}")]
    DumpSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup failed ({}), output: {output}", describe_exit(.exit_code))]
    DumpExecution {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Backup file not found at {}: {source}", .path.display())]
    ArtifactMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup file is empty: {}", .path.display())]
    ArtifactEmpty { path: PathBuf },

    #[error("Failed to initialise object store client: {0}")]
    ClientInit(String),

    #[error("Upload of {key} failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: UploadFailure,
    },
}

impl BackupError {
    pub fn stage(&self) -> Stage {
        match self {
            BackupError::Configuration(_) => Stage::Configuring,
            BackupError::Directory { .. }
            | BackupError::DumpToolNotFound(_)
            | BackupError::DumpSpawn { .. }
            | BackupError::DumpExecution { .. }
            | BackupError::ArtifactMissing { .. }
            | BackupError::ArtifactEmpty { .. } => Stage::Dumping,
            BackupError::ClientInit(_) | BackupError::Upload { .. } => Stage::Uploading,
        }
    }
}

/// Cause of a failed put-object call.
#[derive(Error, Debug)]
pub enum UploadFailure {
    #[error("deadline of {}s exceeded", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("could not read backup file: {0}")]
    Body(#[from] ByteStreamError),

    #[error("object store rejected the request: {}", DisplayErrorContext(.0.as_ref()))]
    Service(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("backup path has no file name: {}", .0.display())]
    InvalidKey(PathBuf),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
