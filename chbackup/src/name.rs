//! Backup names.
//!
//! ## Naming
//!
//! A backup name is either assigned by the tool (a UTC timestamp in the
//! `%Y%m%dT%H%M%S` form) or chosen by the caller. Names can be up to 128
//! characters long and can only consist of ASCII alphanumeric characters
//! (A-Za-z0-9), dashes ('-'), underscores ('_'), and dots ('.'). They must
//! start with an alphanumeric character.
//!
//! The literal token `{uuid}` inside a caller-chosen name is expanded to a
//! freshly generated UUID when the name is resolved.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChBackupError, ChBackupResult};

/// The maximum allowable length of a backup name.
pub const MAX_NAME_LENGTH: usize = 128;

/// The format of tool-assigned backup names.
pub const TIMESTAMP_NAME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// The token expanded to a generated UUID.
const UUID_TOKEN: &str = "{uuid}";

lazy_static! {
    static ref BACKUP_NAME_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap();
}

/// The name of a backup.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq)]
#[serde(transparent)]
pub struct BackupName(#[serde(deserialize_with = "BackupName::deserialize")] String);

/// A way to refer to a backup in a command.
///
/// `LAST` resolves to the most recent backup in `created` state at the
/// time the command runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackupTarget {
    /// A concrete backup name.
    Name(BackupName),

    /// The most recent successfully created backup.
    Last,
}

impl BackupName {
    /// Creates a backup name from a String, expanding the `{uuid}` token.
    pub fn new(name: String) -> ChBackupResult<Self> {
        let name = if name.contains(UUID_TOKEN) {
            name.replace(UUID_TOKEN, &Uuid::new_v4().to_string())
        } else {
            name
        };

        validate_backup_name(&name)?;
        Ok(Self(name))
    }

    /// Generates a timestamp name for a backup starting now.
    pub fn timestamp(now: DateTime<Utc>) -> Self {
        Self(now.format(TIMESTAMP_NAME_FORMAT).to_string())
    }

    /// Returns the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name ClickHouse uses for the shadow directory.
    ///
    /// '-' is replaced with '_' to avoid escaping on the ClickHouse side.
    pub fn sanitized(&self) -> String {
        self.0.replace('-', "_")
    }

    /// Deserializes a potentially-invalid backup name.
    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_backup_name(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl FromStr for BackupName {
    type Err = ChBackupError;

    fn from_str(name: &str) -> ChBackupResult<Self> {
        Self::new(name.to_owned())
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BackupTarget {
    type Err = ChBackupError;

    fn from_str(s: &str) -> ChBackupResult<Self> {
        if s == "LAST" {
            Ok(Self::Last)
        } else {
            Ok(Self::Name(BackupName::new(s.to_owned())?))
        }
    }
}

fn validate_backup_name(name: &str) -> ChBackupResult<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(ChBackupError::InvalidBackupName {
            name: name.to_owned(),
            reason: "name is too long",
        });
    }

    if !BACKUP_NAME_REGEX.is_match(name) {
        return Err(ChBackupError::InvalidBackupName {
            name: name.to_owned(),
            reason: "name contains invalid characters",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn test_backup_name() {
        let names = vec!["20240102T030405", "manual-backup", "weekly_2024.01"];

        for name in names {
            assert_eq!(name, BackupName::new(name.to_string()).unwrap().as_str());
        }

        let bad_names = vec!["", "-leading-dash", "has space", "каталог"];

        for name in bad_names {
            BackupName::new(name.to_string()).unwrap_err();
        }
    }

    #[test]
    fn test_uuid_expansion() {
        let name = BackupName::new("adhoc-{uuid}".to_string()).unwrap();
        assert!(name.as_str().starts_with("adhoc-"));
        assert!(!name.as_str().contains("{uuid}"));
        assert_ne!(
            name,
            BackupName::new("adhoc-{uuid}".to_string()).unwrap(),
            "each expansion must be unique"
        );
    }

    #[test]
    fn test_timestamp_name() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!("20240102T030405", BackupName::timestamp(now).as_str());
    }

    #[test]
    fn test_sanitized() {
        let name = BackupName::new("manual-backup".to_string()).unwrap();
        assert_eq!("manual_backup", name.sanitized());
    }

    #[test]
    fn test_target() {
        assert_eq!(BackupTarget::Last, "LAST".parse().unwrap());
        assert_eq!(
            BackupTarget::Name(BackupName::new("b1".to_string()).unwrap()),
            "b1".parse().unwrap()
        );
    }
}
