//! Cloud storage (object-storage disk) metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Object-storage disk section of the backup document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudStorageMetadata {
    /// Whether the disk metadata tarballs are enciphered.
    #[serde(default)]
    pub encryption: bool,

    /// Whether the disk metadata tarballs are compressed.
    #[serde(default)]
    pub compression: bool,

    /// Names of object-storage disks that contributed data.
    #[serde(default)]
    pub disks: Vec<String>,

    /// Disk name → revision counter captured at freeze time.
    ///
    /// The revision is a monotonically increasing marker provided by
    /// ClickHouse; restore seeks the source bucket to this revision to
    /// obtain a consistent snapshot.
    #[serde(default)]
    pub revisions: BTreeMap<String, u64>,
}

impl CloudStorageMetadata {
    /// Returns whether any object-storage disk contributed data.
    pub fn enabled(&self) -> bool {
        !self.disks.is_empty()
    }

    pub fn add_disk(&mut self, name: String, revision: u64) {
        if !self.disks.contains(&name) {
            self.disks.push(name.clone());
        }
        self.revisions.insert(name, revision);
    }
}
