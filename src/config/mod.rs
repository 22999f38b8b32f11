// pg-r2-backup/src/config/mod.rs
use std::env::VarError;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};

/// Staging directory for dump artifacts. Not configurable through the environment.
pub const DEFAULT_BACKUP_DIR: &str = "/tmp/postgres_backups";

const ENV_FILE: &str = ".env";

const DB_HOST: &str = "DB_HOST";
const DB_PORT: &str = "DB_PORT";
const DB_USER: &str = "DB_USER";
const DB_PASSWORD: &str = "DB_PASSWORD";
const DB_NAME: &str = "DB_NAME";
const R2_ACCOUNT_ID: &str = "R2_ACCOUNT_ID";
const R2_ACCESS_KEY: &str = "R2_ACCESS_KEY";
const R2_SECRET_KEY: &str = "R2_SECRET_KEY";
const R2_BUCKET_NAME: &str = "R2_BUCKET_NAME";
const R2_REGION: &str = "R2_REGION";

/// Everything a single backup run needs, read once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub db_host: String,
    pub db_port: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub r2_account_id: String,
    pub r2_access_key: String,
    pub r2_secret_key: String,
    pub r2_bucket_name: String,
    pub r2_region: String,
    pub backup_dir: PathBuf,
}

/// Connection parameters handed to a dump executor.
#[derive(Clone, Copy)]
pub struct DatabaseTarget<'a> {
    pub host: &'a str,
    pub port: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    pub database: &'a str,
}

impl BackupConfig {
    /// Seeds the environment from `./.env` and reads the configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(ENV_FILE))
    }

    /// The env file is required: a missing, unreadable or malformed file is a
    /// configuration error. Variables already set in the process win.
    pub fn load_from(env_file: &Path) -> Result<Self> {
        dotenv::from_path(env_file).map_err(|e| {
            BackupError::Configuration(format!(
                "error loading {} file: {}",
                env_file.display(),
                e
            ))
        })?;
        tracing::debug!(path = %env_file.display(), "Loaded env file");
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key))
    }

    /// Builds the configuration from an arbitrary variable source.
    ///
    /// Absent variables become empty strings. A value that is present but not
    /// valid Unicode is a configuration error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, VarError>,
    {
        let read = |key: &str| match lookup(key) {
            Ok(value) => Ok(value),
            Err(VarError::NotPresent) => Ok(String::new()),
            Err(VarError::NotUnicode(_)) => Err(BackupError::Configuration(format!(
                "environment variable {} is not valid unicode",
                key
            ))),
        };

        Ok(BackupConfig {
            db_host: read(DB_HOST)?,
            db_port: read(DB_PORT)?,
            db_user: read(DB_USER)?,
            db_password: read(DB_PASSWORD)?,
            db_name: read(DB_NAME)?,
            r2_account_id: read(R2_ACCOUNT_ID)?,
            r2_access_key: read(R2_ACCESS_KEY)?,
            r2_secret_key: read(R2_SECRET_KEY)?,
            r2_bucket_name: read(R2_BUCKET_NAME)?,
            r2_region: read(R2_REGION)?,
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
        })
    }

    pub fn database_target(&self) -> DatabaseTarget<'_> {
        DatabaseTarget {
            host: &self.db_host,
            port: &self.db_port,
            user: &self.db_user,
            password: &self.db_password,
            database: &self.db_name,
        }
    }

    /// Names of the variables that resolved to an empty value.
    pub fn empty_fields(&self) -> Vec<&'static str> {
        [
            (DB_HOST, &self.db_host),
            (DB_PORT, &self.db_port),
            (DB_USER, &self.db_user),
            (DB_PASSWORD, &self.db_password),
            (DB_NAME, &self.db_name),
            (R2_ACCOUNT_ID, &self.r2_account_id),
            (R2_ACCESS_KEY, &self.r2_access_key),
            (R2_SECRET_KEY, &self.r2_secret_key),
            (R2_BUCKET_NAME, &self.r2_bucket_name),
            (R2_REGION, &self.r2_region),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(key, _)| key)
        .collect()
    }
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("r2_account_id", &self.r2_account_id)
            .field("r2_access_key", &self.r2_access_key)
            .field("r2_secret_key", &"<redacted>")
            .field("r2_bucket_name", &self.r2_bucket_name)
            .field("r2_region", &self.r2_region)
            .field("backup_dir", &self.backup_dir)
            .finish()
    }
}
