//! ClickHouse object models.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use chbackup::checksum::Checksum;

use super::schema;

/// A database on the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Full engine expression with parameters, e.g.
    /// `Replicated('/clickhouse/databases/{uuid}', '{shard}', '{replica}')`.
    #[serde(default)]
    pub engine_full: Option<String>,
}

/// A table on the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Table {
    pub database: String,
    pub name: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub create_table_query: String,
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    #[serde(default)]
    pub data_paths: Vec<PathBuf>,
}

/// A disk configured on the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Disk {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: DiskKind,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

/// Storage class of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    /// S3-backed object storage.
    ObjectStorage,

    /// Local block storage. Unrecognized disk types are treated as local.
    Local,
}

impl<'de> serde::Deserialize<'de> for DiskKind {
    /// Maps the `type` column of `system.disks` across server versions.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "s3" | "ObjectStorage" => Self::ObjectStorage,
            _ => Self::Local,
        })
    }
}

/// A data part found in the shadow directory after FREEZE.
#[derive(Debug, Clone)]
pub struct FrozenPart {
    pub database: String,
    pub table: String,
    pub name: String,
    pub disk_name: String,
    /// Absolute path of the frozen part directory.
    pub path: PathBuf,
    pub checksum: Checksum,
    pub size: u64,
    /// Paths of member files relative to the part directory, sorted.
    pub files: Vec<String>,
}

impl Database {
    pub fn is_atomic(&self) -> bool {
        matches!(self.engine.as_deref(), Some("Atomic") | Some("Replicated"))
    }

    pub fn is_replicated(&self) -> bool {
        self.engine.as_deref() == Some("Replicated")
    }

    /// External database engines hold no local data and are recreated
    /// from schema alone.
    pub fn is_external_engine(&self) -> bool {
        matches!(
            self.engine.as_deref(),
            Some("MySQL")
                | Some("MaterializedMySQL")
                | Some("PostgreSQL")
                | Some("MaterializedPostgreSQL")
        )
    }

    /// Derives the engine from a CREATE DATABASE statement.
    ///
    /// Older backup documents carry no engine field; it is recovered from
    /// the stored SQL.
    pub fn set_engine_from_sql(&mut self, sql: &str) {
        self.engine = schema::database_engine_from_sql(sql);
    }
}

impl Table {
    pub fn is_merge_tree(&self) -> bool {
        schema::is_merge_tree(&self.engine)
    }

    pub fn is_replicated(&self) -> bool {
        schema::is_replicated(&self.engine)
    }

    pub fn is_distributed(&self) -> bool {
        schema::is_distributed(&self.engine)
    }

    pub fn is_view(&self) -> bool {
        schema::is_view(&self.engine)
    }

    pub fn is_materialized_view(&self) -> bool {
        schema::is_materialized_view(&self.engine)
    }

    pub fn is_dictionary(&self) -> bool {
        self.engine == "Dictionary"
    }

    /// Engines backed by external services (queues, object stores, URLs).
    pub fn is_external_engine(&self) -> bool {
        schema::is_external_engine(&self.engine)
    }

    /// Returns the `detached` directory for the given data path.
    pub fn detached_path(data_path: &Path) -> PathBuf {
        data_path.join("detached")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_engine_classification() {
        let mut db = Database {
            name: "db1".to_string(),
            engine: Some("Atomic".to_string()),
            uuid: None,
            metadata_path: None,
            engine_full: None,
        };
        assert!(db.is_atomic());
        assert!(!db.is_replicated());
        assert!(!db.is_external_engine());

        db.engine = Some("MaterializedPostgreSQL".to_string());
        assert!(db.is_external_engine());

        db.engine = None;
        db.set_engine_from_sql("CREATE DATABASE db1 ENGINE = Replicated('/ch/db1', '{shard}', '{replica}')");
        assert!(db.is_replicated());
    }

    #[test]
    fn test_table_engine_classification() {
        let table = |engine: &str| Table {
            database: "db1".to_string(),
            name: "t1".to_string(),
            engine: engine.to_string(),
            uuid: None,
            create_table_query: String::new(),
            metadata_path: None,
            data_paths: vec![],
        };

        assert!(table("MergeTree").is_merge_tree());
        assert!(table("ReplicatedReplacingMergeTree").is_merge_tree());
        assert!(table("ReplicatedReplacingMergeTree").is_replicated());
        assert!(!table("MergeTree").is_replicated());
        assert!(table("Distributed").is_distributed());
        assert!(table("MaterializedView").is_view());
        assert!(table("View").is_view());
        assert!(table("Kafka").is_external_engine());
        assert!(!table("Kafka").is_merge_tree());
    }
}
