//! Table catalog entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::part::{PartMetadata, PartRef};

/// Catalog entry for a table, holding its parts keyed by part name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    pub engine: String,

    #[serde(default)]
    pub uuid: Option<String>,

    /// Parts in name order.
    #[serde(default)]
    pub parts: BTreeMap<String, PartMetadata>,
}

impl TableMetadata {
    pub fn new(engine: String, uuid: Option<String>) -> Self {
        Self {
            engine,
            uuid,
            parts: BTreeMap::new(),
        }
    }

    /// Adds a part entry. Part names are unique within a table.
    pub fn add_part(&mut self, name: String, part: PartMetadata) {
        let existed = self.parts.insert(name, part).is_some();
        debug_assert!(!existed, "part names must be unique within a table");
    }

    /// Joins parts with their catalog position.
    pub fn part_refs(&self, database: &str, table: &str) -> Vec<PartRef> {
        self.parts
            .iter()
            .map(|(name, metadata)| PartRef {
                database: database.to_string(),
                table: table.to_string(),
                name: name.clone(),
                metadata: metadata.clone(),
            })
            .collect()
    }
}

/// Catalog entry for a database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    #[serde(default)]
    pub engine: Option<String>,

    #[serde(default)]
    pub uuid: Option<String>,

    /// Tables in name order.
    #[serde(default)]
    pub tables: BTreeMap<String, TableMetadata>,
}

impl DatabaseMetadata {
    pub fn new(engine: Option<String>, uuid: Option<String>) -> Self {
        Self {
            engine,
            uuid,
            tables: BTreeMap::new(),
        }
    }
}
