//! The backup lifecycle manager.
//!
//! Composes the metadata store, the freeze pipeline and the restore
//! planner over the lock manager, and owns the state machine:
//!
//! ```text
//!          create         finalize
//!     ∅ ──────────▶ creating ──────▶ created
//!                     │                │
//!                     │fail            │delete
//!                     ▼                ▼
//!                   failed      partially_deleted
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local};

use chbackup::name::{BackupName, BackupTarget};
use chbackup::util::escape_for_key;

use crate::clickhouse::ClickhouseCtl;
use crate::cloud;
use crate::config::Config;
use crate::coordination::Coordinator;
use crate::dedup;
use crate::error::{EngineError, EngineResult};
use crate::freeze;
use crate::layout::BackupLayout;
use crate::lock::LockManager;
use crate::metadata::{BackupMetadata, BackupSources, BackupState, PartRef};
use crate::restore::{self, RestoreOptions, RestorePlanner};
use crate::restore_context::RestoreContext;

/// Options of a backup operation.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Caller-chosen name; a timestamp name is generated when absent.
    pub name: Option<String>,
    pub databases: Vec<String>,
    pub tables: Vec<(String, String)>,

    /// Ignore the min-interval policy.
    pub force: bool,
    pub labels: HashMap<String, String>,
    pub sources: BackupSources,
}

/// The outcome of a backup command.
#[derive(Debug)]
pub struct BackupOutcome {
    pub name: BackupName,

    /// Informational message when the command was a no-op.
    pub message: Option<String>,
}

/// The backup engine entry point.
pub struct BackupManager {
    config: Config,
    ctl: ClickhouseCtl,
    layout: Arc<BackupLayout>,
    locks: LockManager,
    hostname: String,
}

impl BackupManager {
    pub async fn new(
        config: Config,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> EngineResult<Self> {
        let ctl = ClickhouseCtl::new(&config.clickhouse)?;
        let layout = Arc::new(BackupLayout::new(&config).await?);
        let hostname = hostname();
        let locks = LockManager::new(config.lock.clone(), coordinator, hostname.clone());

        Ok(Self {
            config,
            ctl,
            layout,
            locks,
            hostname,
        })
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    /// Lists backups, newest first. Without `all`, only `created` ones.
    pub async fn list(&self, all: bool) -> EngineResult<Vec<BackupMetadata>> {
        let backups = self.layout.get_backups().await?;
        Ok(backups
            .into_iter()
            .filter(|b| all || b.state == BackupState::Created)
            .collect())
    }

    /// Fetches the full document of a backup.
    pub async fn get(&self, target: &BackupTarget) -> EngineResult<BackupMetadata> {
        let name = self.layout.resolve_target(target).await?;
        self.layout.get_backup(&name, false).await
    }

    // ---- create ----

    pub async fn backup(&self, options: BackupOptions) -> EngineResult<BackupOutcome> {
        let sources = options.sources;

        let mut labels = self.config.backup.labels.clone();
        labels.extend(options.labels.clone());

        let mut db_tables: HashMap<String, Vec<String>> = HashMap::new();
        let mut db_names = options.databases.clone();
        if !options.tables.is_empty() {
            for (db, table) in &options.tables {
                db_tables.entry(db.clone()).or_default().push(table.clone());
            }
            db_names = db_tables.keys().cloned().collect();
        }

        let mut databases = self
            .ctl
            .databases(&self.config.backup.exclude_dbs)
            .await?;
        if !db_names.is_empty() {
            databases.retain(|db| db_names.contains(&db.name));
        }

        // snapshot of prior backups; the locks fence off concurrent
        // mutations for the rest of the operation
        let prior_backups = self.layout.get_backups().await?;

        if let Some(last) = prior_backups
            .iter()
            .find(|b| b.state != BackupState::Failed)
        {
            if !self.check_min_interval(last, options.force) {
                let msg = "Backup is skipped per backup.min-interval config option.";
                tracing::info!("{}", msg);
                return Ok(BackupOutcome {
                    name: last.name.clone(),
                    message: Some(msg.to_string()),
                });
            }
        }

        let name = match &options.name {
            Some(name) => BackupName::new(name.clone())?,
            None => BackupName::timestamp(chrono::Utc::now()),
        };

        let mut backup = BackupMetadata::new(
            name,
            self.ctl.version().await?,
            self.hostname.clone(),
            self.config.backup.time_format.clone(),
            labels,
            self.layout.encryption_enabled(),
            sources,
        );

        let skip_distributed = sources.is_schema_only()
            && self.config.backup.skip_lock_for_schema_only.backup;
        let _lock = self.locks.acquire("BACKUP", !skip_distributed).await?;

        self.layout.upload_backup_metadata(&backup).await?;
        tracing::debug!(
            "Starting backup \"{}\" for databases: {}",
            backup.name,
            databases
                .iter()
                .map(|db| db.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let result = self
            .run_backup(&mut backup, &databases, &db_tables, &prior_backups)
            .await;

        match &result {
            Ok(()) => {
                backup.state = BackupState::Created;
            }
            Err(e) => {
                tracing::error!("Backup failed: {}", e);
                backup.state = BackupState::Failed;
                backup.fail_reason = Some(format!("{}: {}", e.name(), e));
            }
        }

        backup.set_end_time_now();
        self.layout.upload_backup_metadata(&backup).await?;

        if result.is_err() && !self.config.backup.keep_frozen_data_on_failure {
            if let Err(e) = freeze::cleanup_frozen_data(&self.ctl, &backup).await {
                tracing::warn!("Failed to release frozen data: {}", e);
            }
        }

        result?;
        Ok(BackupOutcome {
            name: backup.name,
            message: None,
        })
    }

    async fn run_backup(
        &self,
        backup: &mut BackupMetadata,
        databases: &[crate::clickhouse::Database],
        db_tables: &HashMap<String, Vec<String>>,
        prior_backups: &[BackupMetadata],
    ) -> EngineResult<()> {
        let sources = backup.sources;

        if sources.access {
            self.backup_access(backup).await?;
        }
        if sources.udf {
            self.backup_udfs(backup).await?;
        }
        if sources.named_collections {
            self.backup_named_collections(backup).await?;
        }

        if sources.schemas_included() {
            let dedup_index = if sources.is_schema_only() {
                Default::default()
            } else {
                let db_names: Vec<String> =
                    databases.iter().map(|db| db.name.clone()).collect();
                dedup::collect_dedup_info(
                    &self.layout,
                    &self.config.backup,
                    &db_names,
                    prior_backups,
                    Local::now().fixed_offset(),
                )
                .await?
            };

            freeze::backup_tables(
                &self.ctl,
                self.layout.clone(),
                &self.config,
                backup,
                databases,
                db_tables,
                &dedup_index,
                sources.is_schema_only(),
            )
            .await?;

            if !sources.is_schema_only() {
                freeze::cleanup_frozen_data(&self.ctl, backup).await?;
            }
        }

        Ok(())
    }

    async fn backup_access(&self, backup: &mut BackupMetadata) -> EngineResult<()> {
        let ids = self.ctl.access_control_ids().await?;
        if ids.is_empty() {
            tracing::debug!("No access control entities to back up");
            return Ok(());
        }

        let dir = &self.config.clickhouse.access_control_path;
        let files = crate::clickhouse::control::list_dir_files(dir).await?;

        tracing::debug!("Backing up {} access control entities", ids.len());
        self.layout
            .upload_files_tarball(
                dir.clone(),
                files,
                self.layout.access_control_key(&backup.name),
                backup.encrypted,
                false,
            )
            .await?;

        backup.access_control.acl_ids = ids;
        Ok(())
    }

    async fn backup_udfs(&self, backup: &mut BackupMetadata) -> EngineResult<()> {
        let udfs = self.ctl.udfs().await?;
        if udfs.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            "Performing UDF backup for: {}",
            udfs.keys().cloned().collect::<Vec<_>>().join(", ")
        );

        for (name, statement) in udfs {
            self.layout
                .upload_data(
                    self.layout.udf_key(&backup.name, &name),
                    statement.into_bytes(),
                    backup.encrypted,
                )
                .await?;
            backup.user_defined_functions.push(name);
        }

        backup.user_defined_functions.sort();
        Ok(())
    }

    async fn backup_named_collections(&self, backup: &mut BackupMetadata) -> EngineResult<()> {
        let collections = self.ctl.named_collections().await?;

        for name in collections {
            let local = self
                .config
                .clickhouse
                .named_collections_path
                .join(format!("{}.sql", escape_for_key(&name)));

            if !tokio::fs::try_exists(&local).await? {
                tracing::warn!("Named collection \"{}\" has no DDL file, skipping", name);
                continue;
            }

            let statement = tokio::fs::read(&local).await?;
            self.layout
                .upload_data(
                    self.layout.named_collection_key(&backup.name, &name),
                    statement,
                    backup.encrypted,
                )
                .await?;
            backup.named_collections.push(name);
        }

        backup.named_collections.sort();
        Ok(())
    }

    fn check_min_interval(&self, last: &BackupMetadata, force: bool) -> bool {
        if force {
            return true;
        }

        let min_interval = match self.config.backup.min_interval {
            Some(interval) => interval,
            None => return true,
        };
        let min_interval = match ChronoDuration::from_std(min_interval) {
            Ok(d) => d,
            Err(_) => return true,
        };

        Local::now().fixed_offset() - last.start_time >= min_interval
    }

    // ---- restore ----

    pub async fn restore(
        &self,
        target: &BackupTarget,
        options: RestoreOptions,
    ) -> EngineResult<()> {
        let name = self.layout.resolve_target(target).await?;
        let backup = self.layout.get_backup(&name, false).await?;
        restore::ensure_restorable(&backup)?;

        let skip_distributed = options.sources.is_schema_only()
            && self.config.backup.skip_lock_for_schema_only.restore;
        let _lock = self.locks.acquire("RESTORE", !skip_distributed).await?;

        let mut context = RestoreContext::open(
            &self.config.backup.restore_context_path,
            self.config
                .backup
                .restore_context_sync_on_disk_operation_threshold,
        )?;

        let planner = RestorePlanner {
            ctl: &self.ctl,
            layout: &self.layout,
            config: &self.config,
        };

        planner.restore(&backup, &options, &mut context).await
    }

    /// Copies schemas from a live source host onto this node.
    pub async fn restore_schema(
        &self,
        source_endpoint: &str,
        replica_name: Option<&str>,
    ) -> EngineResult<()> {
        let mut source_config = self.config.clickhouse.clone();
        source_config.endpoint = source_endpoint.to_string();
        let source = ClickhouseCtl::new(&source_config)?;

        let _lock = self.locks.acquire("RESTORE-SCHEMA", false).await?;

        restore::restore_schema_from_host(
            &source,
            &self.ctl,
            &self.config,
            &self.config.backup.exclude_dbs,
            replica_name,
        )
        .await
    }

    /// Downloads the object-storage disk metadata of a backup.
    pub async fn fetch_cloud_storage_metadata(
        &self,
        target: &BackupTarget,
        disk: &str,
        local_path: &Path,
    ) -> EngineResult<Vec<String>> {
        let name = self.layout.resolve_target(target).await?;
        let backup = self.layout.get_backup(&name, false).await?;

        cloud::fetch_disk_metadata(&self.layout, &backup, disk, local_path).await
    }

    // ---- delete / purge ----

    /// Deletes a backup, keeping artifacts that other backups link to.
    pub async fn delete(&self, name: &BackupName, purge_partial: bool) -> EngineResult<Option<String>> {
        let _lock = self.locks.acquire("DELETE", true).await?;

        let backups = self.layout.get_backups().await?;

        let mut deleting = Vec::new();
        let mut retained = Vec::new();
        let mut found = false;

        for (i, backup) in backups.into_iter().enumerate() {
            if &backup.name == name {
                found = true;
                deleting.push(backup);
            } else if purge_partial && backup.state != BackupState::Created && i != 0 {
                deleting.push(backup);
            } else {
                retained.push(backup);
            }
        }

        if !found {
            return Err(EngineError::BackupNotFound(name.to_string()));
        }

        let references =
            dedup::collect_dedup_references_for_deletion(&self.layout, &retained, &deleting)
                .await?;

        let mut message = None;
        for backup in deleting {
            let backup_name = backup.name.clone();
            let msg = self
                .delete_one(backup, references.get(backup_name.as_str()))
                .await?;
            if &backup_name == name {
                message = msg;
            }
        }

        Ok(message)
    }

    async fn delete_one(
        &self,
        backup_light: BackupMetadata,
        references: Option<&HashMap<(String, String), HashSet<String>>>,
    ) -> EngineResult<Option<String>> {
        tracing::info!(
            "Deleting backup {}, state: {}",
            backup_light.name,
            backup_light.state.as_str()
        );

        let mut backup = self.layout.reload_backup(&backup_light).await?;
        backup.state = BackupState::Deleting;
        self.layout.upload_backup_metadata(&backup).await?;

        let result: EngineResult<Option<String>> = async {
            match references.filter(|r| !r.is_empty()) {
                None => {
                    tracing::info!("Removing backup data entirely");
                    self.layout.delete_backup(&backup.name).await?;
                    self.ctl.system_unfreeze(&backup.name).await?;
                    Ok(None)
                }
                Some(references) => {
                    tracing::info!("Removing non-shared backup data parts");

                    let tables: Vec<(String, String)> = backup
                        .databases
                        .iter()
                        .flat_map(|(db, meta)| {
                            meta.tables
                                .keys()
                                .map(move |t| (db.clone(), t.clone()))
                        })
                        .collect();

                    for (db, table) in tables {
                        let shared = references.get(&(db.clone(), table.clone()));

                        let all_parts: Vec<PartRef> = backup
                            .databases
                            .get(&db)
                            .and_then(|d| d.tables.get(&table))
                            .map(|t| t.part_refs(&db, &table))
                            .unwrap_or_default();

                        let deletable: Vec<PartRef> = all_parts
                            .iter()
                            .filter(|p| shared.map_or(true, |s| !s.contains(&p.name)))
                            .cloned()
                            .collect();

                        self.layout.delete_data_parts(&backup, &deletable).await?;

                        let removed: HashSet<String> =
                            deletable.into_iter().map(|p| p.name).collect();
                        backup.remove_parts(&db, &table, &removed);
                    }

                    self.ctl.system_unfreeze(&backup.name).await?;
                    Ok(Some(
                        "Backup was partially deleted as its data is in use by subsequent backups \
                         per deduplication settings."
                            .to_string(),
                    ))
                }
            }
        }
        .await;

        match result {
            Ok(None) => Ok(None),
            Ok(Some(msg)) => {
                backup.state = BackupState::PartiallyDeleted;
                self.layout.upload_backup_metadata(&backup).await?;
                Ok(Some(msg))
            }
            Err(e) => {
                tracing::error!("Delete failed: {}", e);
                backup.state = BackupState::Failed;
                backup.fail_reason = Some(format!("{}: {}", e.name(), e));
                self.layout.upload_backup_metadata(&backup).await?;
                Err(e)
            }
        }
    }

    /// Applies the retention policy.
    ///
    /// A backup is deleted only when it is both beyond `retain-count`
    /// and older than `retain-time`; the policy that preserves more
    /// data wins.
    pub async fn purge(&self) -> EngineResult<Vec<BackupName>> {
        let retain_time = self.config.backup.retain_time;
        let mut retain_count = self.config.backup.retain_count;

        if retain_time.is_none() && retain_count.is_none() {
            tracing::info!("Retain policies are not specified");
            return Ok(vec![]);
        }

        let _lock = self.locks.acquire("PURGE", true).await?;

        let retain_time_limit = retain_time
            .and_then(|t| ChronoDuration::from_std(t).ok())
            .map(|t| Local::now().fixed_offset() - t);

        let backups = self.layout.get_backups().await?;

        // key spaces without a readable document are orphans
        let known: HashSet<&str> = backups.iter().map(|b| b.name.as_str()).collect();
        for dir in self.layout.get_backup_dir_names().await? {
            if !known.contains(dir.as_str()) {
                tracing::info!("Deleting backup without metadata: {}", dir);
                self.layout
                    .delete_prefix(format!(
                        "{}/{}/",
                        self.config.backup.path_root, dir
                    ))
                    .await?;
            }
        }

        let (retained, deleting) = partition_for_purge(backups, retain_count, retain_time_limit);

        let references =
            dedup::collect_dedup_references_for_deletion(&self.layout, &retained, &deleting)
                .await?;

        let mut deleted = Vec::new();
        for backup in deleting {
            let name = backup.name.clone();
            let refs = references.get(name.as_str());
            let fully_removed = self.delete_one(backup, refs).await?.is_none();
            if fully_removed {
                deleted.push(name);
            }
        }

        Ok(deleted)
    }
}

/// Splits backups into retained and deletable per the retention policy.
///
/// Backups arrive newest first. The first `retain_count` `created`
/// backups are protected (anything interleaved with them stays too);
/// beyond the count, a backup is deleted only when it is also older
/// than the retain-time limit, so the policy preserving more data wins.
fn partition_for_purge(
    backups: Vec<BackupMetadata>,
    mut retain_count: Option<usize>,
    retain_time_limit: Option<chrono::DateTime<chrono::FixedOffset>>,
) -> (Vec<BackupMetadata>, Vec<BackupMetadata>) {
    let mut retained = Vec::new();
    let mut deleting = Vec::new();

    for backup in backups {
        if let Some(count) = retain_count {
            if count > 0 {
                tracing::info!(
                    "Preserving backup per retain count policy: {}, state {}",
                    backup.name,
                    backup.state.as_str()
                );
                if backup.state == BackupState::Created {
                    retain_count = Some(count - 1);
                }
                retained.push(backup);
                continue;
            }
        }

        if let Some(limit) = retain_time_limit {
            if backup.start_time >= limit {
                tracing::info!(
                    "Preserving backup per retain time policy: {}, state {}",
                    backup.name,
                    backup.state.as_str()
                );
                retained.push(backup);
                continue;
            }
        }

        deleting.push(backup);
    }

    (retained, deleting)
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, FixedOffset, Local};

    fn backup(name: &str, state: BackupState, age_hours: i64) -> BackupMetadata {
        let mut backup = BackupMetadata::new(
            name.parse().unwrap(),
            "23.8".to_string(),
            "host".to_string(),
            crate::config::DEFAULT_TIME_FORMAT.to_string(),
            Default::default(),
            false,
            BackupSources::all(),
        );
        backup.state = state;
        backup.start_time = Local::now().fixed_offset() - ChronoDuration::hours(age_hours);
        backup
    }

    fn limit(hours: i64) -> DateTime<FixedOffset> {
        Local::now().fixed_offset() - ChronoDuration::hours(hours)
    }

    fn names(backups: &[BackupMetadata]) -> Vec<&str> {
        backups.iter().map(|b| b.name.as_str()).collect()
    }

    #[test]
    fn test_purge_both_policies_must_select() {
        // retain-time 1d, retain-count 2, backups aged 0h/25h/50h:
        // the two newest are count-protected, the 50h one fails both
        // policies and goes
        let backups = vec![
            backup("b2", BackupState::Created, 0),
            backup("b1", BackupState::Created, 25),
            backup("b0", BackupState::Created, 50),
        ];

        let (retained, deleting) = partition_for_purge(backups, Some(2), Some(limit(24)));
        assert_eq!(vec!["b2", "b1"], names(&retained));
        assert_eq!(vec!["b0"], names(&deleting));
    }

    #[test]
    fn test_purge_count_protects_beyond_time() {
        // everything is older than the time limit, but the count policy
        // still protects the two newest created backups
        let backups = vec![
            backup("b2", BackupState::Created, 48),
            backup("b1", BackupState::Created, 72),
            backup("b0", BackupState::Created, 96),
        ];

        let (retained, deleting) = partition_for_purge(backups, Some(2), Some(limit(24)));
        assert_eq!(vec!["b2", "b1"], names(&retained));
        assert_eq!(vec!["b0"], names(&deleting));
    }

    #[test]
    fn test_purge_time_protects_beyond_count() {
        // beyond the count, young backups survive through the time policy
        let backups = vec![
            backup("b2", BackupState::Created, 1),
            backup("b1", BackupState::Created, 2),
            backup("b0", BackupState::Created, 3),
        ];

        let (retained, deleting) = partition_for_purge(backups, Some(1), Some(limit(24)));
        assert_eq!(vec!["b2", "b1", "b0"], names(&retained));
        assert!(deleting.is_empty());
    }

    #[test]
    fn test_purge_partially_deleted_does_not_consume_count() {
        // a partially deleted backup between created ones is kept while
        // the count window is open, but does not use it up
        let backups = vec![
            backup("b3", BackupState::Created, 0),
            backup("b2", BackupState::PartiallyDeleted, 10),
            backup("b1", BackupState::Created, 30),
            backup("b0", BackupState::PartiallyDeleted, 50),
        ];

        let (retained, deleting) = partition_for_purge(backups, Some(2), Some(limit(24)));
        assert_eq!(vec!["b3", "b2", "b1"], names(&retained));
        assert_eq!(vec!["b0"], names(&deleting));
    }

    #[test]
    fn test_purge_count_only_policy() {
        let backups = vec![
            backup("b2", BackupState::Created, 0),
            backup("b1", BackupState::Created, 1),
            backup("b0", BackupState::Created, 2),
        ];

        let (retained, deleting) = partition_for_purge(backups, Some(1), None);
        assert_eq!(vec!["b2"], names(&retained));
        assert_eq!(vec!["b1", "b0"], names(&deleting));
    }
}
