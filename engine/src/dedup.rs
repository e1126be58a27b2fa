//! Data part deduplication.
//!
//! Prior backups are snapshotted at the start of a backup and indexed by
//! `(database, table, part, checksum)`. Candidate parts that hit the
//! index become link-only catalog entries instead of fresh uploads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use tokio::sync::{Mutex, OwnedMutexGuard};

use chbackup::checksum::Checksum;

use crate::clickhouse::FrozenPart;
use crate::config::BackupConfig;
use crate::error::EngineResult;
use crate::layout::BackupLayout;
use crate::metadata::{BackupMetadata, BackupState, PartMetadata, PartRef};

/// Index key identifying an interchangeable part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    database: String,
    table: String,
    part: String,
    checksum: Checksum,
}

/// An index entry pointing at a reusable artifact.
#[derive(Debug, Clone)]
struct DedupEntry {
    /// Backup whose catalog contributed the entry.
    backup: String,

    /// Whether the artifact presence is already established.
    ///
    /// Entries contributed through links of a `created` backup are
    /// verified by construction; own parts of `creating`/`failed`
    /// backups are verified lazily with a presence check.
    verified: bool,

    metadata: PartMetadata,
}

/// The deduplication index built from prior backups.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: HashMap<DedupKey, DedupEntry>,
}

/// Serializes uploads per checksum across the worker pool.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for a key, creating it on first use.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().expect("keyed lock map poisoned");
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        mutex.lock_owned().await
    }
}

impl DedupIndex {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Builds the deduplication index for a new backup.
///
/// The `backups` slice is the snapshot of prior backups (light form,
/// newest first) taken before the backup started; concurrent mutations
/// are fenced off by the locks, not observed here.
pub async fn collect_dedup_info(
    layout: &BackupLayout,
    config: &BackupConfig,
    databases: &[String],
    backups: &[BackupMetadata],
    now: DateTime<FixedOffset>,
) -> EngineResult<DedupIndex> {
    let mut index = DedupIndex::default();

    if !config.deduplicate_parts {
        return Ok(index);
    }

    let age_limit = now
        - ChronoDuration::from_std(config.deduplication_age_limit)
            .unwrap_or_else(|_| ChronoDuration::days(7));

    // a backup contributes only while its end time is within the age
    // limit; crashed backups never finished, their start time stands in
    let candidates: Vec<&BackupMetadata> = backups
        .iter()
        .take_while(|b| b.end_time.unwrap_or(b.start_time) >= age_limit)
        .filter(|b| !b.schema_only)
        .filter(|b| {
            !matches!(
                b.state,
                BackupState::Deleting | BackupState::PartiallyDeleted
            )
        })
        .collect();

    let candidate_names: HashSet<&str> = candidates.iter().map(|b| b.name.as_str()).collect();
    let requested: HashSet<&str> = databases.iter().map(String::as_str).collect();

    for backup in &candidates {
        let backup = layout.reload_backup(backup).await?;
        let verified_by_construction = backup.state == BackupState::Created;

        for part in backup.parts() {
            if !requested.contains(part.database.as_str()) {
                continue;
            }

            let key = DedupKey {
                database: part.database.clone(),
                table: part.table.clone(),
                part: part.name.clone(),
                checksum: part.metadata.checksum,
            };

            // newest backups are iterated first and win
            if index.entries.contains_key(&key) {
                continue;
            }

            let (owner, verified) = match &part.metadata.link {
                Some(target) => {
                    // a link is only usable if its artifact owner is
                    // itself in the candidate set
                    if !candidate_names.contains(target.as_str()) {
                        continue;
                    }
                    (target.clone(), true)
                }
                None => (backup.name.to_string(), verified_by_construction),
            };

            index.entries.insert(
                key,
                DedupEntry {
                    backup: owner,
                    verified,
                    metadata: part.metadata,
                },
            );
        }
    }

    tracing::debug!("Deduplication index holds {} entries", index.len());
    Ok(index)
}

/// Decides LINK vs UPLOAD for a batch of frozen parts.
///
/// Returns link-only catalog entries for the parts that deduplicate;
/// everything else must be uploaded fresh. Unverified entries are
/// presence-checked here, so a broken artifact never becomes a link
/// target.
pub async fn deduplicate_parts(
    layout: &BackupLayout,
    index: &DedupIndex,
    frozen_parts: &HashMap<String, FrozenPart>,
) -> EngineResult<HashMap<String, PartMetadata>> {
    let mut deduplicated = HashMap::new();

    for (name, fpart) in frozen_parts {
        let key = DedupKey {
            database: fpart.database.clone(),
            table: fpart.table.clone(),
            part: fpart.name.clone(),
            checksum: fpart.checksum,
        };

        let entry = match index.entries.get(&key) {
            Some(entry) => entry,
            None => continue,
        };

        if !entry.verified {
            let part_ref = PartRef {
                database: fpart.database.clone(),
                table: fpart.table.clone(),
                name: fpart.name.clone(),
                metadata: entry.metadata.clone(),
            };

            if !layout.check_data_part(&entry.backup, &part_ref).await? {
                tracing::debug!(
                    "Part \"{}\" found in \"{}\", but it's invalid, skipping",
                    name,
                    entry.backup
                );
                continue;
            }
        }

        tracing::debug!("Part \"{}\" found in \"{}\", reusing", name, entry.backup);
        deduplicated.insert(name.clone(), entry.metadata.linked_to(&entry.backup));
    }

    Ok(deduplicated)
}

/// Collects, per deleting backup, the parts that retained backups still
/// link to. Those artifacts must survive the deletion.
pub async fn collect_dedup_references_for_deletion(
    layout: &BackupLayout,
    retained: &[BackupMetadata],
    deleting: &[BackupMetadata],
) -> EngineResult<HashMap<String, HashMap<(String, String), HashSet<String>>>> {
    let deleting_names: HashSet<&str> = deleting.iter().map(|b| b.name.as_str()).collect();
    let mut references: HashMap<String, HashMap<(String, String), HashSet<String>>> =
        HashMap::new();

    for backup in retained {
        let backup = layout.reload_backup(backup).await?;
        for part in backup.parts() {
            let target = match &part.metadata.link {
                Some(target) if deleting_names.contains(target.as_str()) => target.clone(),
                _ => continue,
            };

            references
                .entry(target)
                .or_default()
                .entry((part.database, part.table))
                .or_default()
                .insert(part.name);
        }
    }

    Ok(references)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration as ChronoDuration, Local};
    use tokio_test::block_on;

    use chbackup::checksum::Checksum;

    use crate::config::Config;
    use crate::metadata::{
        BackupSources, DatabaseMetadata, PartMetadata, StorageClass, TableMetadata,
    };

    async fn test_layout() -> (tempfile::TempDir, BackupLayout) {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[storage]\ntype = \"local\"\npath = \"{}\"\n",
            dir.path().join("storage").display()
        ))
        .unwrap();
        let layout = BackupLayout::new(&config).await.unwrap();
        (dir, layout)
    }

    fn part_entry(checksum: &Checksum, link: Option<&str>) -> PartMetadata {
        PartMetadata {
            checksum: *checksum,
            bytes: 8,
            raw_bytes: 8,
            files: vec!["checksums.txt".to_string()],
            link: link.map(str::to_string),
            tarball: true,
            disk_name: "default".to_string(),
            storage_class: StorageClass::Local,
        }
    }

    /// Uploads a backup document holding one part of `db1.t1`, plus its
    /// artifact unless `broken`.
    async fn seed_backup(
        layout: &BackupLayout,
        name: &str,
        state: BackupState,
        part_name: &str,
        checksum: &Checksum,
        link: Option<&str>,
        broken: bool,
        age_hours: i64,
    ) -> BackupMetadata {
        let mut backup = BackupMetadata::new(
            name.parse().unwrap(),
            "23.8".to_string(),
            "host".to_string(),
            crate::config::DEFAULT_TIME_FORMAT.to_string(),
            Default::default(),
            false,
            BackupSources::all(),
        );
        backup.start_time = Local::now().fixed_offset() - ChronoDuration::hours(age_hours);
        backup.state = state;
        backup.add_database("db1".to_string(), DatabaseMetadata::new(None, None));
        backup.add_table(
            "db1",
            "t1".to_string(),
            TableMetadata::new("MergeTree".to_string(), None),
        );
        backup.add_part(PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: part_name.to_string(),
            metadata: part_entry(checksum, link),
        });

        layout.upload_backup_metadata(&backup).await.unwrap();

        if link.is_none() && !broken {
            layout
                .upload_data(
                    layout.part_key(name, "db1", "t1", part_name),
                    b"artifact".to_vec(),
                    false,
                )
                .await
                .unwrap();
        }

        backup
    }

    fn frozen(part_name: &str, checksum: &Checksum) -> FrozenPart {
        FrozenPart {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: part_name.to_string(),
            disk_name: "default".to_string(),
            path: std::path::PathBuf::from("/nonexistent"),
            checksum: *checksum,
            size: 8,
            files: vec!["checksums.txt".to_string()],
        }
    }

    fn config() -> crate::config::BackupConfig {
        crate::config::BackupConfig::default()
    }

    #[tokio::test]
    async fn test_index_skips_unusable_states() {
        let (_dir, layout) = test_layout().await;
        let now = Local::now().fixed_offset();
        let c1 = Checksum::sha256_from_bytes(b"p1");
        let c2 = Checksum::sha256_from_bytes(b"p2");
        let c3 = Checksum::sha256_from_bytes(b"p3");

        let deleting = seed_backup(
            &layout, "b0", BackupState::Deleting, "0_1_1_0", &c1, None, false, 3,
        )
        .await;
        let failed = seed_backup(
            &layout, "b1", BackupState::Failed, "1_1_1_0", &c2, None, false, 2,
        )
        .await;
        let created = seed_backup(
            &layout, "b2", BackupState::Created, "2_1_1_0", &c3, None, false, 1,
        )
        .await;

        let backups = vec![created, failed, deleting];
        let index = collect_dedup_info(
            &layout,
            &config(),
            &["db1".to_string()],
            &backups,
            now,
        )
        .await
        .unwrap();

        // the deleting backup contributes nothing; failed and created do
        assert_eq!(2, index.len());

        let parts: HashMap<String, FrozenPart> = [
            ("0_1_1_0".to_string(), frozen("0_1_1_0", &c1)),
            ("1_1_1_0".to_string(), frozen("1_1_1_0", &c2)),
            ("2_1_1_0".to_string(), frozen("2_1_1_0", &c3)),
        ]
        .into_iter()
        .collect();

        let decisions = deduplicate_parts(&layout, &index, &parts).await.unwrap();
        assert!(!decisions.contains_key("0_1_1_0"));
        assert_eq!(Some("b1"), decisions["1_1_1_0"].link.as_deref());
        assert_eq!(Some("b2"), decisions["2_1_1_0"].link.as_deref());
    }

    #[tokio::test]
    async fn test_broken_artifact_is_not_reused() {
        let (_dir, layout) = test_layout().await;
        let now = Local::now().fixed_offset();
        let c1 = Checksum::sha256_from_bytes(b"p1");

        // a crashed backup claims the part but its artifact is gone
        let creating = seed_backup(
            &layout, "b0", BackupState::Creating, "0_1_1_0", &c1, None, true, 1,
        )
        .await;

        let index = collect_dedup_info(
            &layout,
            &config(),
            &["db1".to_string()],
            &[creating],
            now,
        )
        .await
        .unwrap();
        assert_eq!(1, index.len());

        let parts: HashMap<String, FrozenPart> =
            [("0_1_1_0".to_string(), frozen("0_1_1_0", &c1))]
                .into_iter()
                .collect();

        // the presence check rejects the broken artifact
        let decisions = deduplicate_parts(&layout, &index, &parts).await.unwrap();
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_not_reused() {
        let (_dir, layout) = test_layout().await;
        let now = Local::now().fixed_offset();
        let c1 = Checksum::sha256_from_bytes(b"p1");

        let created = seed_backup(
            &layout, "b0", BackupState::Created, "0_1_1_0", &c1, None, false, 1,
        )
        .await;

        let index = collect_dedup_info(
            &layout,
            &config(),
            &["db1".to_string()],
            &[created],
            now,
        )
        .await
        .unwrap();

        // same part name, different content
        let other = Checksum::sha256_from_bytes(b"changed");
        let parts: HashMap<String, FrozenPart> =
            [("0_1_1_0".to_string(), frozen("0_1_1_0", &other))]
                .into_iter()
                .collect();

        let decisions = deduplicate_parts(&layout, &index, &parts).await.unwrap();
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn test_link_targets_resolve_to_artifact_owner() {
        let (_dir, layout) = test_layout().await;
        let now = Local::now().fixed_offset();
        let c1 = Checksum::sha256_from_bytes(b"p1");

        // b0 owns the artifact; b1 links to it
        let owner = seed_backup(
            &layout, "b0", BackupState::Created, "0_1_1_0", &c1, None, false, 2,
        )
        .await;
        let linker = seed_backup(
            &layout, "b1", BackupState::Created, "0_1_1_0", &c1, Some("b0"), false, 1,
        )
        .await;

        let backups = vec![linker, owner];
        let index = collect_dedup_info(
            &layout,
            &config(),
            &["db1".to_string()],
            &backups,
            now,
        )
        .await
        .unwrap();

        let parts: HashMap<String, FrozenPart> =
            [("0_1_1_0".to_string(), frozen("0_1_1_0", &c1))]
                .into_iter()
                .collect();

        // a third backup linking through b1 must still point at b0
        let decisions = deduplicate_parts(&layout, &index, &parts).await.unwrap();
        assert_eq!(Some("b0"), decisions["0_1_1_0"].link.as_deref());
    }

    #[tokio::test]
    async fn test_age_limit_cuts_off_old_backups() {
        let (_dir, layout) = test_layout().await;
        let now = Local::now().fixed_offset();
        let c1 = Checksum::sha256_from_bytes(b"p1");

        // 8 days old with a 7-day limit
        let old = seed_backup(
            &layout, "b0", BackupState::Created, "0_1_1_0", &c1, None, false, 8 * 24,
        )
        .await;

        let index = collect_dedup_info(
            &layout,
            &config(),
            &["db1".to_string()],
            &[old],
            now,
        )
        .await
        .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_dedup_disabled() {
        let (_dir, layout) = test_layout().await;
        let now = Local::now().fixed_offset();
        let c1 = Checksum::sha256_from_bytes(b"p1");

        let created = seed_backup(
            &layout, "b0", BackupState::Created, "0_1_1_0", &c1, None, false, 1,
        )
        .await;

        let mut config = config();
        config.deduplicate_parts = false;

        let index = collect_dedup_info(
            &layout,
            &config,
            &["db1".to_string()],
            &[created],
            now,
        )
        .await
        .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_references_protect_shared_parts() {
        let (_dir, layout) = test_layout().await;
        let c1 = Checksum::sha256_from_bytes(b"p1");
        let c2 = Checksum::sha256_from_bytes(b"p2");

        // b0 owns two parts; b1 links one of them
        let mut doomed = seed_backup(
            &layout, "b0", BackupState::Created, "0_1_1_0", &c1, None, false, 2,
        )
        .await;
        doomed.add_part(PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: "1_1_1_0".to_string(),
            metadata: part_entry(&c2, None),
        });
        layout.upload_backup_metadata(&doomed).await.unwrap();

        let survivor = seed_backup(
            &layout, "b1", BackupState::Created, "0_1_1_0", &c1, Some("b0"), false, 1,
        )
        .await;

        let references = collect_dedup_references_for_deletion(
            &layout,
            std::slice::from_ref(&survivor),
            std::slice::from_ref(&doomed),
        )
        .await
        .unwrap();

        // only the linked part must survive b0's deletion
        let preserved = &references["b0"][&("db1".to_string(), "t1".to_string())];
        assert!(preserved.contains("0_1_1_0"));
        assert!(!preserved.contains("1_1_1_0"));
    }

    #[test]
    fn test_keyed_locks_serialize_same_key() {
        block_on(async {
            let locks = Arc::new(KeyedLocks::new());

            let guard = locks.lock("abc").await;

            let locks2 = locks.clone();
            let contender = tokio::spawn(async move {
                let _guard = locks2.lock("abc").await;
            });

            // different key is immediately available
            let _other = locks.lock("def").await;

            // the contender can only finish once the guard is gone
            assert!(!contender.is_finished());
            drop(guard);
            contender.await.unwrap();
        });
    }
}
