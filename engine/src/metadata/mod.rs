//! Backup documents.
//!
//! A backup is described by a single JSON document stored alongside its
//! data. The document is always replaced whole; readers must tolerate
//! documents written by older versions (missing fields) and unknown
//! lifecycle states, which collapse to `failed`.

pub mod cloud;
pub mod part;
pub mod sources;
pub mod table;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, FixedOffset, Local};
use serde::{de, ser, Deserialize, Serialize};

use chbackup::name::BackupName;

use crate::error::{EngineError, EngineResult};

pub use cloud::CloudStorageMetadata;
pub use part::{PartMetadata, PartRef, StorageClass};
pub use sources::BackupSources;
pub use table::{DatabaseMetadata, TableMetadata};

/// Version string recorded in documents written by this build.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lifecycle state of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Creating,
    Created,
    Deleting,
    PartiallyDeleted,
    Failed,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Deleting => "deleting",
            Self::PartiallyDeleted => "partially_deleted",
            Self::Failed => "failed",
        }
    }
}

impl Serialize for BackupState {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BackupState {
    /// Deserializes a state string; unknown strings collapse to `Failed`.
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "creating" => Self::Creating,
            "created" => Self::Created,
            "deleting" => Self::Deleting,
            "partially_deleted" => Self::PartiallyDeleted,
            _ => Self::Failed,
        })
    }
}

/// Access control section of the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessControlMetadata {
    /// UUIDs of the backed up access entities.
    #[serde(default)]
    pub acl_ids: Vec<String>,
}

/// A backup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawDocument", into = "RawDocument")]
pub struct BackupMetadata {
    pub name: BackupName,
    pub version: String,
    pub ch_version: String,
    pub hostname: String,
    pub time_format: String,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,

    /// Total size of all catalogued parts.
    pub bytes: u64,

    /// Size of the parts whose artifacts this backup owns.
    pub real_bytes: u64,

    pub state: BackupState,
    pub labels: HashMap<String, String>,
    pub schema_only: bool,
    pub encrypted: bool,
    pub sources: BackupSources,
    pub fail_reason: Option<String>,

    pub databases: BTreeMap<String, DatabaseMetadata>,
    pub access_control: AccessControlMetadata,
    pub user_defined_functions: Vec<String>,
    pub named_collections: Vec<String>,
    pub cloud_storage: CloudStorageMetadata,
}

/// On-the-wire document layout.
#[derive(Serialize, Deserialize)]
struct RawDocument {
    meta: RawMeta,
    #[serde(default)]
    databases: BTreeMap<String, DatabaseMetadata>,
    #[serde(default)]
    access_controls: AccessControlMetadata,
    #[serde(default)]
    user_defined_functions: Vec<String>,
    #[serde(default)]
    named_collections: Vec<String>,
    #[serde(default)]
    cloud_storage: CloudStorageMetadata,
}

#[derive(Serialize, Deserialize)]
struct RawMeta {
    name: BackupName,
    version: String,
    ch_version: String,
    hostname: String,
    time_format: String,
    start_time: String,
    #[serde(default)]
    end_time: Option<String>,
    bytes: u64,
    real_bytes: u64,
    state: BackupState,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    schema_only: bool,
    #[serde(default)]
    encrypted: bool,
    #[serde(default = "default_sources")]
    sources: BackupSources,
    #[serde(default)]
    fail_reason: Option<String>,
}

fn default_sources() -> BackupSources {
    BackupSources::all()
}

impl TryFrom<RawDocument> for BackupMetadata {
    type Error = String;

    fn try_from(raw: RawDocument) -> Result<Self, Self::Error> {
        let meta = raw.meta;
        let parse = |s: &str| {
            DateTime::parse_from_str(s, &meta.time_format)
                .map_err(|e| format!("invalid timestamp \"{}\": {}", s, e))
        };

        Ok(Self {
            start_time: parse(&meta.start_time)?,
            end_time: meta.end_time.as_deref().map(parse).transpose()?,
            name: meta.name,
            version: meta.version,
            ch_version: meta.ch_version,
            hostname: meta.hostname,
            time_format: meta.time_format,
            bytes: meta.bytes,
            real_bytes: meta.real_bytes,
            state: meta.state,
            labels: meta.labels,
            schema_only: meta.schema_only,
            encrypted: meta.encrypted,
            sources: meta.sources,
            fail_reason: meta.fail_reason,
            databases: raw.databases,
            access_control: raw.access_controls,
            user_defined_functions: raw.user_defined_functions,
            named_collections: raw.named_collections,
            cloud_storage: raw.cloud_storage,
        })
    }
}

impl From<BackupMetadata> for RawDocument {
    fn from(backup: BackupMetadata) -> Self {
        let format = |t: &DateTime<FixedOffset>| t.format(&backup.time_format).to_string();

        Self {
            meta: RawMeta {
                start_time: format(&backup.start_time),
                end_time: backup.end_time.as_ref().map(format),
                name: backup.name,
                version: backup.version,
                ch_version: backup.ch_version,
                hostname: backup.hostname,
                time_format: backup.time_format,
                bytes: backup.bytes,
                real_bytes: backup.real_bytes,
                state: backup.state,
                labels: backup.labels,
                schema_only: backup.schema_only,
                encrypted: backup.encrypted,
                sources: backup.sources,
                fail_reason: backup.fail_reason,
            },
            databases: backup.databases,
            access_controls: backup.access_control,
            user_defined_functions: backup.user_defined_functions,
            named_collections: backup.named_collections,
            cloud_storage: backup.cloud_storage,
        }
    }
}

impl BackupMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: BackupName,
        ch_version: String,
        hostname: String,
        time_format: String,
        labels: HashMap<String, String>,
        encrypted: bool,
        sources: BackupSources,
    ) -> Self {
        let start_time = Local::now().fixed_offset();

        Self {
            name,
            version: TOOL_VERSION.to_string(),
            ch_version,
            hostname,
            time_format,
            start_time,
            end_time: None,
            bytes: 0,
            real_bytes: 0,
            state: BackupState::Creating,
            labels,
            schema_only: sources.is_schema_only(),
            encrypted,
            sources,
            fail_reason: None,
            databases: BTreeMap::new(),
            access_control: AccessControlMetadata::default(),
            user_defined_functions: Vec::new(),
            named_collections: Vec::new(),
            cloud_storage: CloudStorageMetadata::default(),
        }
    }

    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self)
            .map_err(|e| EngineError::IntegrityError(format!("cannot serialize document: {}", e)))
    }

    /// Serializes the light form of the document: everything except the
    /// catalogs. Listing reads light documents to avoid pulling part
    /// catalogs it does not need.
    pub fn to_light_json(&self) -> EngineResult<String> {
        let mut light = self.clone();
        light.databases = BTreeMap::new();
        light.access_control = AccessControlMetadata::default();
        light.user_defined_functions = Vec::new();
        light.named_collections = Vec::new();
        light.to_json()
    }

    pub fn from_json(data: &str) -> EngineResult<Self> {
        serde_json::from_str(data)
            .map_err(|e| EngineError::IntegrityError(format!("cannot parse document: {}", e)))
    }

    pub fn set_end_time_now(&mut self) {
        self.end_time = Some(Local::now().fixed_offset());
    }

    pub fn add_database(&mut self, name: String, database: DatabaseMetadata) {
        self.databases.insert(name, database);
    }

    pub fn add_table(&mut self, database: &str, name: String, table: TableMetadata) {
        if let Some(db) = self.databases.get_mut(database) {
            db.tables.insert(name, table);
        }
    }

    /// Adds a part entry, maintaining the size accounting.
    pub fn add_part(&mut self, part: PartRef) {
        self.bytes += part.metadata.bytes;
        if part.metadata.link.is_none() {
            self.real_bytes += part.metadata.bytes;
        }

        if let Some(db) = self.databases.get_mut(&part.database) {
            if let Some(table) = db.tables.get_mut(&part.table) {
                table.add_part(part.name, part.metadata);
            }
        }
    }

    /// Removes part entries of a table, maintaining the size accounting.
    pub fn remove_parts(&mut self, database: &str, table: &str, names: &HashSet<String>) {
        if let Some(db) = self.databases.get_mut(database) {
            if let Some(t) = db.tables.get_mut(table) {
                for name in names {
                    if let Some(part) = t.parts.remove(name) {
                        self.bytes -= part.bytes;
                        if part.link.is_none() {
                            self.real_bytes -= part.bytes;
                        }
                    }
                }
            }
        }
    }

    /// All parts of all tables, joined with their catalog position.
    pub fn parts(&self) -> Vec<PartRef> {
        let mut parts = Vec::new();
        for (db_name, db) in &self.databases {
            for (table_name, table) in &db.tables {
                parts.extend(table.part_refs(db_name, table_name));
            }
        }
        parts
    }

    pub fn find_part(&self, database: &str, table: &str, part: &str) -> Option<&PartMetadata> {
        self.databases
            .get(database)?
            .tables
            .get(table)?
            .parts
            .get(part)
    }

    /// Number of parts whose artifacts this backup owns.
    pub fn data_count(&self) -> usize {
        self.parts()
            .iter()
            .filter(|p| p.metadata.link.is_none())
            .count()
    }

    /// Number of parts linked into other backups.
    pub fn link_count(&self) -> usize {
        self.parts()
            .iter()
            .filter(|p| p.metadata.link.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chbackup::checksum::Checksum;

    fn backup() -> BackupMetadata {
        BackupMetadata::new(
            "20240102T030405".parse().unwrap(),
            "23.8.2.7".to_string(),
            "clickhouse01".to_string(),
            crate::config::DEFAULT_TIME_FORMAT.to_string(),
            HashMap::new(),
            false,
            BackupSources::all(),
        )
    }

    fn part(link: Option<&str>, bytes: u64) -> PartMetadata {
        PartMetadata {
            checksum: Checksum::sha256_from_bytes(b"data"),
            bytes,
            raw_bytes: bytes,
            files: vec!["checksums.txt".to_string()],
            link: link.map(str::to_string),
            tarball: true,
            disk_name: "default".to_string(),
            storage_class: StorageClass::Local,
        }
    }

    #[test]
    fn test_document_round_trip() {
        let mut backup = backup();
        backup.add_database(
            "db1".to_string(),
            DatabaseMetadata::new(Some("Atomic".to_string()), None),
        );
        backup.add_table(
            "db1",
            "t1".to_string(),
            TableMetadata::new("MergeTree".to_string(), None),
        );
        backup.add_part(PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: "0_1_1_0".to_string(),
            metadata: part(None, 100),
        });
        backup.add_part(PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: "1_2_2_0".to_string(),
            metadata: part(Some("older"), 50),
        });
        backup.state = BackupState::Created;
        backup.set_end_time_now();

        let serialized = backup.to_json().unwrap();
        let parsed = BackupMetadata::from_json(&serialized).unwrap();

        assert_eq!(backup.name, parsed.name);
        assert_eq!(BackupState::Created, parsed.state);
        assert_eq!(150, parsed.bytes);
        assert_eq!(100, parsed.real_bytes);
        assert_eq!(1, parsed.data_count());
        assert_eq!(1, parsed.link_count());
        assert_eq!(backup.start_time, parsed.start_time);
        assert_eq!(backup.end_time, parsed.end_time);
        assert_eq!(
            Some("older"),
            parsed
                .find_part("db1", "t1", "1_2_2_0")
                .and_then(|p| p.link.as_deref())
        );
    }

    #[test]
    fn test_unknown_state_collapses_to_failed() {
        let mut backup = backup();
        backup.state = BackupState::Created;
        let serialized = backup.to_json().unwrap();
        let tampered = serialized.replace("\"created\"", "\"exotic_future_state\"");

        let parsed = BackupMetadata::from_json(&tampered).unwrap();
        assert_eq!(BackupState::Failed, parsed.state);
    }

    #[test]
    fn test_light_document_drops_catalog() {
        let mut backup = backup();
        backup.add_database(
            "db1".to_string(),
            DatabaseMetadata::new(Some("Atomic".to_string()), None),
        );
        backup.add_table(
            "db1",
            "t1".to_string(),
            TableMetadata::new("MergeTree".to_string(), None),
        );
        backup.add_part(PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: "0_1_1_0".to_string(),
            metadata: part(None, 100),
        });

        let light = BackupMetadata::from_json(&backup.to_light_json().unwrap()).unwrap();
        assert!(light.databases.is_empty());
        // size accounting survives the light form
        assert_eq!(100, light.bytes);
    }

    #[test]
    fn test_remove_parts_accounting() {
        let mut backup = backup();
        backup.add_database("db1".to_string(), DatabaseMetadata::new(None, None));
        backup.add_table(
            "db1",
            "t1".to_string(),
            TableMetadata::new("MergeTree".to_string(), None),
        );
        backup.add_part(PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: "0_1_1_0".to_string(),
            metadata: part(None, 100),
        });

        let mut removed = HashSet::new();
        removed.insert("0_1_1_0".to_string());
        backup.remove_parts("db1", "t1", &removed);

        assert_eq!(0, backup.bytes);
        assert_eq!(0, backup.real_bytes);
        assert!(backup.parts().is_empty());
    }
}
