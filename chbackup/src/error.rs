//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type ChBackupResult<T> = Result<T, ChBackupError>;

/// An error.
#[derive(Debug, Display)]
pub enum ChBackupError {
    /// Invalid backup name "{name}": {reason}
    InvalidBackupName { name: String, reason: &'static str },

    /// Invalid part name "{name}"
    InvalidPartName { name: String },

    /// Checksum error: {0}
    ChecksumError(super::checksum::Error),

    /// I/O error: {error}
    IoError { error: io::Error },
}

impl ChBackupError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidBackupName { .. } => "InvalidBackupName",
            Self::InvalidPartName { .. } => "InvalidPartName",
            Self::ChecksumError(_) => "ChecksumError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for ChBackupError {}

impl From<io::Error> for ChBackupError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::checksum::Error> for ChBackupError {
    fn from(error: super::checksum::Error) -> Self {
        Self::ChecksumError(error)
    }
}
