//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use displaydoc::Display;

use chbackup::error::ChBackupError;

pub type EngineResult<T> = Result<T, EngineError>;

/// An error.
#[derive(Debug, Display)]
pub enum EngineError {
    /// Backup "{0}" was not found.
    BackupNotFound(String),

    /// No backup in created state exists.
    NoCreatedBackup,

    /// Operation is locked: {0}
    Locked(String),

    /// Storage error: {0}
    StorageError(AnyError),

    /// ClickHouse error: {0}
    ClickhouseError(AnyError),

    /// Integrity error: {0}
    IntegrityError(String),

    /// Configuration error: {0}
    ConfigError(String),

    /// Failed to attach part "{part}" of "{database}"."{table}": {reason}
    AttachFailure {
        database: String,
        table: String,
        part: String,
        reason: String,
    },

    /// Coordination error: {0}
    CoordinationError(AnyError),

    /// Error from the common components: {0}
    CommonError(ChBackupError),
}

impl EngineError {
    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn clickhouse_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::ClickhouseError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BackupNotFound(_) => "BackupNotFound",
            Self::NoCreatedBackup => "NoCreatedBackup",
            Self::Locked(_) => "Locked",
            Self::StorageError(_) => "StorageError",
            Self::ClickhouseError(_) => "ClickhouseError",
            Self::IntegrityError(_) => "IntegrityError",
            Self::ConfigError(_) => "ConfigError",
            Self::AttachFailure { .. } => "AttachFailure",
            Self::CoordinationError(_) => "CoordinationError",
            Self::CommonError(e) => e.name(),
        }
    }

    /// The process exit code reserved for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Locked(_) => 3,
            Self::BackupNotFound(_) | Self::NoCreatedBackup => 4,
            Self::ConfigError(_) => 2,
            _ => 1,
        }
    }
}

impl StdError for EngineError {}

impl From<ChBackupError> for EngineError {
    fn from(error: ChBackupError) -> Self {
        Self::CommonError(error)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        Self::CommonError(ChBackupError::IoError { error })
    }
}
