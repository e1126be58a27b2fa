//! The freeze pipeline.
//!
//! freeze → walk → dedupe → pack+upload → unfreeze, with bounded worker
//! pools for freezing and uploading. The first unrecoverable error
//! cancels the pipeline; in-flight uploads drain and the error is
//! surfaced to the lifecycle manager, which marks the backup failed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel as channel;
use tokio::task::JoinHandle;

use crate::clickhouse::{ClickhouseCtl, Database, Disk, DiskKind, FrozenPart, Table};
use crate::config::Config;
use crate::dedup::{self, DedupIndex, KeyedLocks};
use crate::error::{EngineError, EngineResult};
use crate::layout::BackupLayout;
use crate::metadata::{
    BackupMetadata, DatabaseMetadata, PartMetadata, PartRef, TableMetadata,
};

/// Queue depth per upload worker.
const QUEUE_DEPTH_FACTOR: usize = 2;

type UploadJob = FrozenPart;
type UploadResult = EngineResult<(FrozenPart, PartMetadata)>;

/// Pool of workers packing and uploading frozen parts.
///
/// Results stream back to the caller in completion order; catalog
/// entries are appended by the single driver, keeping the catalog
/// monotone.
struct Uploader {
    workers: Vec<JoinHandle<()>>,
    jobs: channel::Sender<UploadJob>,
    results: channel::Receiver<UploadResult>,
    cancelled: Arc<AtomicBool>,
}

impl Uploader {
    fn new(layout: Arc<BackupLayout>, backup: BackupMetadata, num_workers: usize) -> Self {
        // the job queue is the backpressure point; results are small
        // catalog entries and must never block a worker, or a full
        // result queue could wedge the driver against a full job queue
        let (jobs, job_receiver) = channel::bounded(num_workers * QUEUE_DEPTH_FACTOR);
        let (result_sender, results) = channel::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let locks = Arc::new(KeyedLocks::new());

        let mut workers = Vec::new();
        for _ in 0..num_workers {
            workers.push(tokio::spawn(upload_worker(
                job_receiver.clone(),
                result_sender.clone(),
                layout.clone(),
                backup.clone(),
                locks.clone(),
                cancelled.clone(),
            )));
        }

        Self {
            workers,
            jobs,
            results,
            cancelled,
        }
    }

    async fn submit(&self, fpart: FrozenPart) -> EngineResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            // a worker already hit an unrecoverable error; the real
            // cause is surfaced by finish()
            return Ok(());
        }

        self.jobs.send(fpart).await.map_err(|_| {
            EngineError::IntegrityError("upload workers exited prematurely".to_string())
        })
    }

    /// Closes the queue and drains all results into the catalog.
    async fn finish(self, backup: &mut BackupMetadata) -> EngineResult<()> {
        drop(self.jobs);

        let mut first_error = None;
        while let Ok(result) = self.results.recv().await {
            match result {
                Ok((fpart, metadata)) => {
                    backup.add_part(PartRef {
                        database: fpart.database,
                        table: fpart.table,
                        name: fpart.name,
                        metadata,
                    });
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        for worker in self.workers {
            let _ = worker.await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn upload_worker(
    jobs: channel::Receiver<UploadJob>,
    results: channel::Sender<UploadResult>,
    layout: Arc<BackupLayout>,
    backup: BackupMetadata,
    locks: Arc<KeyedLocks>,
    cancelled: Arc<AtomicBool>,
) {
    while let Ok(fpart) = jobs.recv().await {
        if cancelled.load(Ordering::SeqCst) {
            // drain without starting new uploads
            continue;
        }

        // at most one concurrent upload per checksum
        let _guard = locks.lock(&fpart.checksum.to_hex()).await;

        let result = layout
            .upload_data_part(&backup, &fpart)
            .await
            .map(|metadata| (fpart, metadata));

        if result.is_err() {
            // stop the driver from queueing further work
            cancelled.store(true, Ordering::SeqCst);
        }

        if results.send(result).await.is_err() {
            break;
        }
    }
}

/// Backs up schemas and data of the given databases.
#[allow(clippy::too_many_arguments)]
pub async fn backup_tables(
    ctl: &ClickhouseCtl,
    layout: Arc<BackupLayout>,
    config: &Config,
    backup: &mut BackupMetadata,
    databases: &[Database],
    db_tables: &HashMap<String, Vec<String>>,
    dedup_index: &DedupIndex,
    schema_only: bool,
) -> EngineResult<()> {
    let disks = ctl.disks().await?;

    for db in databases {
        backup.add_database(
            db.name.clone(),
            DatabaseMetadata::new(db.engine.clone(), db.uuid.clone()),
        );
        upload_database_schema(&layout, backup, db).await?;

        if db.is_external_engine() {
            // external databases hold no local tables to freeze
            continue;
        }

        let table_filter = db_tables.get(&db.name).cloned().unwrap_or_default();
        let tables = ctl.tables(&db.name, &table_filter).await?;

        let mtimes = collect_metadata_mtimes(&tables).await;
        let tables: Vec<Table> = tables
            .into_iter()
            .filter(|t| mtimes.contains_key(&t.name))
            .collect();

        ctl.create_shadow_increment().await?;
        let frozen = freeze_tables(ctl, config, backup, &tables, schema_only).await?;

        for table in frozen {
            backup_frozen_table(
                ctl,
                &layout,
                config,
                backup,
                table,
                &mtimes,
                &disks,
                dedup_index,
                schema_only,
            )
            .await?;
        }
    }

    Ok(())
}

/// Releases the shadow data of this backup.
pub async fn cleanup_frozen_data(ctl: &ClickhouseCtl, backup: &BackupMetadata) -> EngineResult<()> {
    ctl.system_unfreeze(&backup.name).await
}

async fn upload_database_schema(
    layout: &BackupLayout,
    backup: &BackupMetadata,
    db: &Database,
) -> EngineResult<()> {
    let sql = match &db.metadata_path {
        Some(path) if tokio::fs::try_exists(path).await? => tokio::fs::read(path).await?,
        _ => {
            // databases created before Atomic keep no metadata file
            let engine = db.engine.as_deref().unwrap_or("Atomic");
            format!("CREATE DATABASE `{}` ENGINE = {}", db.name, engine).into_bytes()
        }
    };

    layout
        .upload_data(
            layout.database_sql_key(&backup.name, &db.name),
            sql,
            backup.encrypted,
        )
        .await
}

async fn collect_metadata_mtimes(tables: &[Table]) -> HashMap<String, std::time::SystemTime> {
    let mut mtimes = HashMap::new();

    for table in tables {
        let path = match &table.metadata_path {
            Some(path) => path,
            None => continue,
        };

        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(mtime) => {
                mtimes.insert(table.name.clone(), mtime);
            }
            Err(_) => {
                tracing::warn!(
                    "Cannot get metadata mtime for table \"{}\".\"{}\". Skipping it",
                    table.database,
                    table.name
                );
            }
        }
    }

    mtimes
}

/// Freezes MergeTree tables with a bounded worker pool.
///
/// A table dropped while the backup is running is skipped, not fatal.
async fn freeze_tables(
    ctl: &ClickhouseCtl,
    config: &Config,
    backup: &BackupMetadata,
    tables: &[Table],
    schema_only: bool,
) -> EngineResult<Vec<Table>> {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(
        config.multiprocessing.freeze_threads.max(1),
    ));

    let futures = tables
        .iter()
        .cloned()
        .map(|table| {
            let ctl = ctl.clone();
            let semaphore = semaphore.clone();
            let backup_name = backup.name.clone();
            let retries = config.backup.retry_on_existing_dir;

            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("freeze semaphore closed");

                if schema_only || !table.is_merge_tree() {
                    return Ok(Some(table));
                }

                tracing::debug!("Trying to freeze \"{}\".\"{}\"", table.database, table.name);

                let mut attempt = 0;
                loop {
                    match ctl.freeze_table(&backup_name, &table).await {
                        Ok(()) => return Ok(Some(table)),
                        Err(e) => {
                            if !ctl.table_exists(&table.database, &table.name).await? {
                                tracing::warn!(
                                    "Table \"{}\".\"{}\" was removed by a user during backup",
                                    table.database,
                                    table.name
                                );
                                return Ok(None);
                            }

                            // a shadow left behind by an unrelated FREEZE
                            // with the same name is retried
                            if attempt < retries {
                                attempt += 1;
                                tracing::warn!(
                                    "Freeze of \"{}\".\"{}\" failed (attempt {}), retrying: {}",
                                    table.database,
                                    table.name,
                                    attempt,
                                    e
                                );
                                continue;
                            }

                            tracing::error!(
                                "Cannot freeze table \"{}\".\"{}\"",
                                table.database,
                                table.name
                            );
                            return Err(e);
                        }
                    }
                }
            }
        })
        .collect::<Vec<_>>();

    let results = futures::future::join_all(futures).await;

    let mut frozen = Vec::new();
    for result in results {
        if let Some(table) = result? {
            frozen.push(table);
        }
    }

    Ok(frozen)
}

#[allow(clippy::too_many_arguments)]
async fn backup_frozen_table(
    ctl: &ClickhouseCtl,
    layout: &Arc<BackupLayout>,
    config: &Config,
    backup: &mut BackupMetadata,
    table: Table,
    mtimes: &HashMap<String, std::time::SystemTime>,
    disks: &[Disk],
    dedup_index: &DedupIndex,
    schema_only: bool,
) -> EngineResult<()> {
    // optimistic concurrency control: a table altered between
    // enumeration and now would make schema and data inconsistent
    let current_mtime = match &table.metadata_path {
        Some(path) => tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok(),
        None => None,
    };
    if current_mtime.as_ref() != mtimes.get(&table.name) {
        tracing::warn!(
            "Skipping table backup for \"{}\".\"{}\". The metadata file was updated or removed during backup",
            table.database,
            table.name
        );
        return Ok(());
    }

    tracing::debug!(
        "Performing table backup for \"{}\".\"{}\"",
        table.database,
        table.name
    );

    let create_statement = match &table.metadata_path {
        Some(path) if tokio::fs::try_exists(path).await? => tokio::fs::read(path).await?,
        _ => table.create_table_query.clone().into_bytes(),
    };

    backup.add_table(
        &table.database,
        table.name.clone(),
        TableMetadata::new(table.engine.clone(), table.uuid.clone()),
    );
    layout
        .upload_data(
            layout.table_sql_key(&backup.name, &table.database, &table.name),
            create_statement,
            backup.encrypted,
        )
        .await?;

    if schema_only || !table.is_merge_tree() {
        if !table.is_merge_tree() {
            tracing::debug!(
                "Skipping table data backup for non MergeTree table \"{}\".\"{}\"",
                table.database,
                table.name
            );
        }
        return Ok(());
    }

    backup_frozen_table_data(ctl, layout, config, backup, &table, disks, dedup_index).await
}

async fn backup_frozen_table_data(
    ctl: &ClickhouseCtl,
    layout: &Arc<BackupLayout>,
    config: &Config,
    backup: &mut BackupMetadata,
    table: &Table,
    disks: &[Disk],
    dedup_index: &DedupIndex,
) -> EngineResult<()> {
    tracing::debug!(
        "Uploading table data for \"{}\".\"{}\"",
        table.database,
        table.name
    );

    let uploader = Uploader::new(
        layout.clone(),
        backup.clone(),
        config.multiprocessing.upload_threads.max(1),
    );

    let mut cloud_disks_seen = Vec::new();
    let mut batch: HashMap<String, FrozenPart> = HashMap::new();
    let batch_size = config.backup.deduplication_batch_size.max(1);

    let result: EngineResult<()> = async {
        for data_path in &table.data_paths {
            let disk = match disks.iter().find(|d| data_path.starts_with(&d.path)) {
                Some(disk) => disk,
                None => continue,
            };

            for fpart in ctl
                .scan_frozen_parts(table, disk, data_path, &backup.name)
                .await?
            {
                tracing::debug!("Working on part {} of {:?}", fpart.name, disk.name);

                if disk.kind == DiskKind::ObjectStorage {
                    backup.add_part(PartRef {
                        database: fpart.database.clone(),
                        table: fpart.table.clone(),
                        name: fpart.name.clone(),
                        metadata: PartMetadata::from_cloud_part(&fpart),
                    });
                    if !cloud_disks_seen.contains(&disk.name) {
                        cloud_disks_seen.push(disk.name.clone());
                    }
                    continue;
                }

                batch.insert(fpart.name.clone(), fpart);
                if batch.len() >= batch_size {
                    process_dedup_batch(ctl, layout, backup, dedup_index, &uploader, &mut batch)
                        .await?;
                }
            }
        }

        if !batch.is_empty() {
            process_dedup_batch(ctl, layout, backup, dedup_index, &uploader, &mut batch).await?;
        }

        Ok(())
    }
    .await;

    // always drain the pool, then surface the first error
    let drain_result = uploader.finish(backup).await;
    result?;
    drain_result?;

    for disk_name in cloud_disks_seen {
        let disk = disks
            .iter()
            .find(|d| d.name == disk_name)
            .expect("disk came from this slice");
        backup_cloud_storage_metadata(ctl, layout, config, backup, table, disk).await?;
    }

    Ok(())
}

/// Runs one dedup batch: linked parts go straight into the catalog and
/// their shadow data is released; the rest are queued for upload.
async fn process_dedup_batch(
    ctl: &ClickhouseCtl,
    layout: &Arc<BackupLayout>,
    backup: &mut BackupMetadata,
    dedup_index: &DedupIndex,
    uploader: &Uploader,
    batch: &mut HashMap<String, FrozenPart>,
) -> EngineResult<()> {
    tracing::debug!("Working on deduplication of {} frozen parts", batch.len());

    let deduplicated = dedup::deduplicate_parts(layout, dedup_index, batch).await?;
    tracing::debug!(
        "{} out of {} parts are deduplicated",
        deduplicated.len(),
        batch.len()
    );

    for (name, fpart) in batch.drain() {
        match deduplicated.get(&name) {
            Some(metadata) => {
                ctl.remove_frozen_part(&fpart).await?;
                backup.add_part(PartRef {
                    database: fpart.database,
                    table: fpart.table,
                    name: fpart.name,
                    metadata: metadata.clone(),
                });
            }
            None => {
                uploader.submit(fpart).await?;
            }
        }
    }

    Ok(())
}

/// Uploads the shadow metadata of an object-storage disk and records
/// its revision in the document.
async fn backup_cloud_storage_metadata(
    ctl: &ClickhouseCtl,
    layout: &Arc<BackupLayout>,
    config: &Config,
    backup: &mut BackupMetadata,
    table: &Table,
    disk: &Disk,
) -> EngineResult<()> {
    tracing::debug!(
        "Backing up object-storage disk \"{}\" shadow of \"{}\".\"{}\"",
        disk.name,
        table.database,
        table.name
    );

    let data_path = table
        .data_paths
        .iter()
        .find(|p| p.starts_with(&disk.path))
        .ok_or_else(|| {
            EngineError::IntegrityError(format!(
                "table \"{}\".\"{}\" has no data path on disk \"{}\"",
                table.database, table.name, disk.name
            ))
        })?;

    let relative: PathBuf = data_path
        .strip_prefix(&disk.path)
        .map_err(|_| {
            EngineError::IntegrityError(format!(
                "data path {:?} is outside disk {:?}",
                data_path, disk.path
            ))
        })?
        .to_path_buf();

    let shadow_path = disk
        .path
        .join("shadow")
        .join(backup.name.sanitized())
        .join(&relative);

    let files = crate::clickhouse::control::list_dir_files(&shadow_path).await?;
    let files: Vec<String> = files
        .into_iter()
        .filter(|f| f != "frozen_metadata.txt")
        .collect();

    if files.is_empty() {
        tracing::debug!("No data frozen on disk \"{}\", skipping", disk.name);
        return Ok(());
    }

    layout
        .upload_files_tarball(
            shadow_path,
            files,
            layout.cloud_storage_key(&backup.name, &disk.name, &table.database, &table.name),
            config.cloud_storage.encryption && layout.encryption_enabled(),
            config.cloud_storage.compression,
        )
        .await?;

    let revision = ctl
        .read_disk_revision(disk, &backup.name)
        .await?
        .unwrap_or(0);
    backup.cloud_storage.encryption =
        config.cloud_storage.encryption && layout.encryption_enabled();
    backup.cloud_storage.compression = config.cloud_storage.compression;
    backup.cloud_storage.add_disk(disk.name.clone(), revision);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clickhouse::control::{list_dir_files, part_checksum};
    use crate::config::Config;
    use crate::metadata::BackupSources;

    async fn test_layout(dir: &std::path::Path) -> Arc<BackupLayout> {
        let config: Config = toml::from_str(&format!(
            "[storage]\ntype = \"local\"\npath = \"{}\"\n",
            dir.join("storage").display()
        ))
        .unwrap();
        Arc::new(BackupLayout::new(&config).await.unwrap())
    }

    fn test_backup() -> BackupMetadata {
        let mut backup = BackupMetadata::new(
            "b1".parse().unwrap(),
            "23.8".to_string(),
            "host".to_string(),
            crate::config::DEFAULT_TIME_FORMAT.to_string(),
            Default::default(),
            false,
            BackupSources::all(),
        );
        backup.add_database("db1".to_string(), DatabaseMetadata::new(None, None));
        backup.add_table(
            "db1",
            "t1".to_string(),
            TableMetadata::new("MergeTree".to_string(), None),
        );
        backup
    }

    async fn frozen_part(dir: &std::path::Path, name: &str, payload: &[u8]) -> FrozenPart {
        let part_path = dir.join(name);
        std::fs::create_dir_all(&part_path).unwrap();
        std::fs::write(part_path.join("checksums.txt"), payload).unwrap();
        std::fs::write(part_path.join("n.bin"), payload).unwrap();

        let files = list_dir_files(&part_path).await.unwrap();
        let checksum = part_checksum(&part_path, &files).await.unwrap();

        FrozenPart {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: name.to_string(),
            disk_name: "default".to_string(),
            path: part_path,
            checksum,
            size: payload.len() as u64 * 2,
            files,
        }
    }

    #[tokio::test]
    async fn test_uploader_fills_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path()).await;
        let mut backup = test_backup();

        let uploader = Uploader::new(layout.clone(), backup.clone(), 2);
        for name in ["0_1_1_0", "1_2_2_0", "2_3_3_0"] {
            let fpart = frozen_part(dir.path(), name, name.as_bytes()).await;
            uploader.submit(fpart).await.unwrap();
        }

        uploader.finish(&mut backup).await.unwrap();

        assert_eq!(3, backup.data_count());
        assert_eq!(0, backup.link_count());

        for part in backup.parts() {
            assert!(layout.check_data_part("b1", &part).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_uploader_surfaces_part_errors() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path()).await;
        let mut backup = test_backup();

        let good = frozen_part(dir.path(), "0_1_1_0", b"good").await;
        let mut bad = frozen_part(dir.path(), "1_2_2_0", b"bad").await;
        std::fs::remove_dir_all(&bad.path).unwrap();
        bad.files = vec!["checksums.txt".to_string()];

        let uploader = Uploader::new(layout.clone(), backup.clone(), 2);
        uploader.submit(good).await.unwrap();
        uploader.submit(bad).await.unwrap();

        uploader.finish(&mut backup).await.unwrap_err();

        // the healthy part still made it into the catalog
        assert_eq!(1, backup.data_count());
    }
}
