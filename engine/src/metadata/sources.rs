//! Source kinds included in a backup or restore.

use serde::{Deserialize, Serialize};

/// The set of source kinds an operation covers.
///
/// An operation with none of the flags given covers everything; schema
/// without data is the `schema_only` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSources {
    pub schema: bool,
    pub data: bool,
    pub access: bool,
    pub udf: bool,
    pub named_collections: bool,
}

impl BackupSources {
    /// Everything.
    pub fn all() -> Self {
        Self {
            schema: true,
            data: true,
            access: true,
            udf: true,
            named_collections: true,
        }
    }

    /// Schemas without data.
    pub fn schema_only() -> Self {
        Self {
            schema: true,
            data: false,
            access: false,
            udf: false,
            named_collections: false,
        }
    }

    /// Combines explicit CLI selection flags.
    ///
    /// No flags at all means a full backup; `schema_only` narrows data
    /// away while keeping schemas.
    pub fn from_flags(
        schema_only: bool,
        schema: bool,
        data: bool,
        access: bool,
        udf: bool,
        named_collections: bool,
    ) -> Self {
        if schema_only {
            return Self::schema_only();
        }

        if !(schema || data || access || udf || named_collections) {
            return Self::all();
        }

        Self {
            schema: schema || data,
            data,
            access,
            udf,
            named_collections,
        }
    }

    /// Returns whether database and table schemas are covered.
    pub fn schemas_included(&self) -> bool {
        self.schema
    }

    /// Returns whether this is a schema-without-data operation.
    pub fn is_schema_only(&self) -> bool {
        self.schema && !self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_everything() {
        let sources = BackupSources::from_flags(false, false, false, false, false, false);
        assert_eq!(BackupSources::all(), sources);
        assert!(!sources.is_schema_only());
    }

    #[test]
    fn test_schema_only() {
        let sources = BackupSources::from_flags(true, false, false, false, false, false);
        assert!(sources.schemas_included());
        assert!(sources.is_schema_only());
        assert!(!sources.access);
    }

    #[test]
    fn test_partial_selection() {
        let sources = BackupSources::from_flags(false, false, false, true, false, false);
        assert!(sources.access);
        assert!(!sources.schemas_included());
        assert!(!sources.data);
    }

    #[test]
    fn test_data_implies_schema() {
        let sources = BackupSources::from_flags(false, false, true, false, false, false);
        assert!(sources.schemas_included());
        assert!(sources.data);
    }
}
