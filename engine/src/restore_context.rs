//! Resumable restore state.
//!
//! The restore planner journals per-part progress into a local state
//! file. Re-running a restore against the same destination consumes the
//! journal and retries only parts that never reached `attached`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::metadata::PartRef;

/// Progress of a single part within a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartRestoreState {
    /// Not touched yet.
    #[default]
    #[serde(rename = "pending")]
    Pending,

    /// Artifact is unpacked into the detached directory.
    #[serde(rename = "downloaded")]
    Downloaded,

    /// ATTACH PART succeeded.
    #[serde(rename = "attached")]
    Attached,

    /// Failed to attach and skipped under `keep_going`.
    #[serde(rename = "skipped")]
    Skipped,
}

type PartStates = BTreeMap<String, BTreeMap<String, BTreeMap<String, PartRestoreState>>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    databases: PartStates,

    /// database → table → part → failure reason.
    #[serde(default)]
    failed: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
}

/// The per-destination restore journal.
#[derive(Debug)]
pub struct RestoreContext {
    path: PathBuf,
    state: PersistedState,

    /// Disk operations since the last flush.
    pending_ops: usize,

    /// Flush after this many recorded operations.
    sync_threshold: usize,
}

impl RestoreContext {
    /// Opens the journal, resuming existing state when present.
    pub fn open(path: &Path, sync_threshold: usize) -> EngineResult<Self> {
        let state = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Restore journal is unreadable, starting over: {}", e);
                    PersistedState::default()
                }
            }
        } else {
            PersistedState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state,
            pending_ops: 0,
            sync_threshold: sync_threshold.max(1),
        })
    }

    pub fn part_state(&self, part: &PartRef) -> PartRestoreState {
        self.state
            .databases
            .get(&part.database)
            .and_then(|tables| tables.get(&part.table))
            .and_then(|parts| parts.get(&part.name))
            .copied()
            .unwrap_or_default()
    }

    /// Records a state change, flushing when the threshold is reached.
    pub fn set_part_state(&mut self, part: &PartRef, state: PartRestoreState) -> EngineResult<()> {
        *self
            .state
            .databases
            .entry(part.database.clone())
            .or_default()
            .entry(part.table.clone())
            .or_default()
            .entry(part.name.clone())
            .or_default() = state;

        self.pending_ops += 1;
        if self.pending_ops >= self.sync_threshold {
            self.flush()?;
        }

        Ok(())
    }

    pub fn add_failed_part(&mut self, part: &PartRef, reason: String) {
        self.state
            .failed
            .entry(part.database.clone())
            .or_default()
            .entry(part.table.clone())
            .or_default()
            .insert(part.name.clone(), reason);
    }

    pub fn has_failed_parts(&self) -> bool {
        !self.state.failed.is_empty()
    }

    /// Persists the journal atomically (write-then-rename).
    pub fn flush(&mut self) -> EngineResult<()> {
        let serialized = serde_json::to_string(&self.state).map_err(|e| {
            crate::error::EngineError::IntegrityError(format!(
                "cannot serialize restore journal: {}",
                e
            ))
        })?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;

        self.pending_ops = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str) -> PartRef {
        PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: name.to_string(),
            metadata: crate::metadata::PartMetadata {
                checksum: chbackup::checksum::Checksum::sha256_from_bytes(b"x"),
                bytes: 1,
                raw_bytes: 1,
                files: vec![],
                link: None,
                tarball: true,
                disk_name: "default".to_string(),
                storage_class: crate::metadata::StorageClass::Local,
            },
        }
    }

    #[test]
    fn test_resume_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_state.json");

        {
            let mut ctx = RestoreContext::open(&path, 1).unwrap();
            ctx.set_part_state(&part("0_1_1_0"), PartRestoreState::Attached)
                .unwrap();
            ctx.set_part_state(&part("1_2_2_0"), PartRestoreState::Downloaded)
                .unwrap();
        }

        let ctx = RestoreContext::open(&path, 100).unwrap();
        assert_eq!(PartRestoreState::Attached, ctx.part_state(&part("0_1_1_0")));
        assert_eq!(
            PartRestoreState::Downloaded,
            ctx.part_state(&part("1_2_2_0"))
        );
        assert_eq!(PartRestoreState::Pending, ctx.part_state(&part("2_3_3_0")));
    }

    #[test]
    fn test_threshold_batches_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_state.json");

        let mut ctx = RestoreContext::open(&path, 10).unwrap();
        ctx.set_part_state(&part("0_1_1_0"), PartRestoreState::Downloaded)
            .unwrap();
        assert!(!path.exists(), "below the threshold nothing is flushed");

        ctx.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_failed_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_state.json");

        let mut ctx = RestoreContext::open(&path, 100).unwrap();
        assert!(!ctx.has_failed_parts());

        ctx.add_failed_part(&part("0_1_1_0"), "attach refused".to_string());
        assert!(ctx.has_failed_parts());
    }

    #[test]
    fn test_corrupted_journal_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restore_state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let ctx = RestoreContext::open(&path, 100).unwrap();
        assert_eq!(PartRestoreState::Pending, ctx.part_state(&part("0_1_1_0")));
    }
}
