//! Part catalog entries.

use serde::{Deserialize, Serialize};

use chbackup::checksum::Checksum;

use crate::clickhouse::FrozenPart;

/// Storage class of the disk a part was frozen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageClass {
    /// Local block storage; the part travels through the backup storage.
    #[default]
    #[serde(rename = "local")]
    Local,

    /// S3-backed disk; only the disk metadata files travel, the data
    /// objects stay in the cloud storage bucket.
    #[serde(rename = "object-storage")]
    ObjectStorage,
}

/// Catalog entry for a single data part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartMetadata {
    pub checksum: Checksum,

    /// Size of the packed artifact in bytes.
    pub bytes: u64,

    /// Size of the unpacked part in bytes.
    #[serde(rename = "raw_bytes")]
    pub raw_bytes: u64,

    /// Member files of the part, relative and sorted.
    pub files: Vec<String>,

    /// Name of the backup owning the artifact, or None for a fresh
    /// upload within this backup.
    #[serde(default)]
    pub link: Option<String>,

    /// Whether the artifact is a single TAR stream.
    #[serde(default = "default_tarball")]
    pub tarball: bool,

    #[serde(default = "default_disk_name")]
    pub disk_name: String,

    #[serde(default)]
    pub storage_class: StorageClass,
}

/// A part entry joined with its catalog position.
#[derive(Debug, Clone)]
pub struct PartRef {
    pub database: String,
    pub table: String,
    pub name: String,
    pub metadata: PartMetadata,
}

fn default_tarball() -> bool {
    false
}

fn default_disk_name() -> String {
    "default".to_string()
}

impl PartMetadata {
    /// Builds a fresh-upload entry from a frozen part.
    pub fn from_frozen_part(fpart: &FrozenPart, artifact_size: u64) -> Self {
        Self {
            checksum: fpart.checksum,
            bytes: artifact_size,
            raw_bytes: fpart.size,
            files: fpart.files.clone(),
            link: None,
            tarball: true,
            disk_name: fpart.disk_name.clone(),
            storage_class: StorageClass::Local,
        }
    }

    /// Builds an object-storage entry from a frozen part.
    ///
    /// No artifact is uploaded for these; the data objects remain in the
    /// cloud storage bucket at the captured revision.
    pub fn from_cloud_part(fpart: &FrozenPart) -> Self {
        Self {
            checksum: fpart.checksum,
            bytes: fpart.size,
            raw_bytes: fpart.size,
            files: fpart.files.clone(),
            link: None,
            tarball: false,
            disk_name: fpart.disk_name.clone(),
            storage_class: StorageClass::ObjectStorage,
        }
    }

    /// Builds a link entry pointing at an artifact owned by `backup`.
    pub fn linked_to(&self, backup: &str) -> Self {
        let mut linked = self.clone();
        // preserve the terminal owner when linking to an already-linked entry
        if linked.link.is_none() {
            linked.link = Some(backup.to_string());
        }
        linked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> PartMetadata {
        PartMetadata {
            checksum: Checksum::sha256_from_bytes(b"part"),
            bytes: 10,
            raw_bytes: 20,
            files: vec!["checksums.txt".to_string()],
            link: None,
            tarball: true,
            disk_name: "default".to_string(),
            storage_class: StorageClass::Local,
        }
    }

    #[test]
    fn test_linking_preserves_terminal_owner() {
        let fresh = entry();

        let first_link = fresh.linked_to("backup0");
        assert_eq!(Some("backup0"), first_link.link.as_deref());

        // linking against a link must keep pointing at the artifact owner
        let second_link = first_link.linked_to("backup1");
        assert_eq!(Some("backup0"), second_link.link.as_deref());
    }

    #[test]
    fn test_serde_defaults() {
        let parsed: PartMetadata = serde_json::from_str(
            r#"{
                "checksum": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                "bytes": 5,
                "raw_bytes": 5,
                "files": []
            }"#,
        )
        .unwrap();

        assert_eq!(None, parsed.link);
        assert!(!parsed.tarball);
        assert_eq!("default", parsed.disk_name);
        assert_eq!(StorageClass::Local, parsed.storage_class);
    }
}
