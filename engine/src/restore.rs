//! The restore planner.
//!
//! Restores a backup onto the local node in phases: access/UDF/named
//! collections, databases, table objects, then data parts. Progress of
//! the data phase is journaled into the restore context, making a rerun
//! resume instead of repeating work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;

use crate::clickhouse::{schema, ClickhouseCtl, Disk, DiskKind, Table};
use crate::cloud::{CloudRestoreParams, CloudStorageRestorer};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::layout::BackupLayout;
use crate::metadata::{BackupMetadata, PartRef, StorageClass};
use crate::restore_context::{PartRestoreState, RestoreContext};

/// Which replica entries are purged from the coordination service
/// before recreating Replicated objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanZookeeperMode {
    /// Only the entries of the current replica.
    ReplicaOnly,

    /// Entries of every replica under the object's path.
    AllReplicas,
}

impl FromStr for CleanZookeeperMode {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "replica-only" => Ok(Self::ReplicaOnly),
            "all-replicas" => Ok(Self::AllReplicas),
            other => Err(EngineError::ConfigError(format!(
                "unknown clean-zookeeper mode \"{}\"",
                other
            ))),
        }
    }
}

/// A fully qualified table selector.
pub type TableSelector = (String, String);

/// Options of a restore operation.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub sources: crate::metadata::BackupSources,
    pub databases: Vec<String>,
    pub exclude_databases: Vec<String>,
    pub tables: Vec<TableSelector>,
    pub exclude_tables: Vec<TableSelector>,
    pub override_replica_name: Option<String>,
    pub force_non_replicated: bool,
    pub replica_name: Option<String>,
    pub clean_zookeeper_mode: Option<CleanZookeeperMode>,
    pub cloud: Option<CloudRestoreParams>,
    pub keep_going: bool,
    pub restore_tables_in_replicated_database: bool,
}

/// A table scheduled for restoration.
#[derive(Debug, Clone)]
struct RestoreTable {
    database: String,
    name: String,
    engine: String,
    create_statement: String,
}

impl RestoreTable {
    fn is_merge_tree(&self) -> bool {
        schema::is_merge_tree(&self.engine)
    }

    fn is_replicated(&self) -> bool {
        schema::is_replicated(&self.engine)
    }

    fn is_dictionary(&self) -> bool {
        self.engine == "Dictionary"
    }

    /// Engines restored through their ATTACH form to keep UUIDs and
    /// avoid re-running DDL side effects.
    fn attaches(&self) -> bool {
        self.is_merge_tree()
            || schema::is_materialized_view(&self.engine)
            || schema::is_distributed(&self.engine)
            || schema::is_external_engine(&self.engine)
    }
}

/// Drives a restore against the local node.
pub struct RestorePlanner<'a> {
    pub ctl: &'a ClickhouseCtl,
    pub layout: &'a BackupLayout,
    pub config: &'a Config,
}

impl<'a> RestorePlanner<'a> {
    pub async fn restore(
        &self,
        backup: &BackupMetadata,
        options: &RestoreOptions,
        context: &mut RestoreContext,
    ) -> EngineResult<()> {
        let databases = select_databases(backup, options)?;

        if options.sources.access {
            self.restore_access(backup).await?;
        }
        if options.sources.udf {
            self.restore_udfs(backup).await?;
        }
        if options.sources.named_collections {
            self.restore_named_collections(backup).await?;
        }

        if options.sources.schemas_included() {
            let macros = self.ctl.macros().await?;

            self.restore_databases(backup, &databases, options, &macros)
                .await?;

            let tables = self
                .collect_tables(backup, &databases, options)
                .await?;

            if let Some(mode) = options.clean_zookeeper_mode {
                self.clean_table_replicas(&tables, mode, options, &macros)
                    .await?;
            }

            let failed = self.restore_table_objects(&tables, options.keep_going).await?;

            if options.sources.data {
                let failed_names: HashSet<(String, String)> = failed
                    .iter()
                    .map(|t| (t.database.clone(), t.name.clone()))
                    .collect();

                let data_tables: Vec<&RestoreTable> = tables
                    .iter()
                    .filter(|t| !failed_names.contains(&(t.database.clone(), t.name.clone())))
                    .collect();

                self.restore_data(backup, &data_tables, options, context)
                    .await?;
            }
        }

        context.flush()?;

        if options.sources.data && context.has_failed_parts() {
            let msg = "Some parts failed to attach";
            tracing::warn!("{}", msg);
            if self.config.backup.restore_fail_on_attach_error {
                return Err(EngineError::IntegrityError(msg.to_string()));
            }
        }

        Ok(())
    }

    // ---- phase 1: access / UDF / named collections ----

    async fn restore_access(&self, backup: &BackupMetadata) -> EngineResult<()> {
        if backup.access_control.acl_ids.is_empty() {
            tracing::debug!("Backup carries no access control entities");
            return Ok(());
        }

        tracing::info!(
            "Restoring {} access control entities",
            backup.access_control.acl_ids.len()
        );

        let key = self.layout.access_control_key(&backup.name);
        self.layout
            .download_files_tarball(
                key,
                self.config.clickhouse.access_control_path.clone(),
                backup.encrypted,
                false,
            )
            .await?;

        tracing::warn!(
            "Access entities are restored on disk; they apply after the server restarts"
        );
        Ok(())
    }

    async fn restore_udfs(&self, backup: &BackupMetadata) -> EngineResult<()> {
        if backup.user_defined_functions.is_empty() {
            return Ok(());
        }

        tracing::info!("Restoring UDFs: {}", backup.user_defined_functions.join(", "));
        let existing = self.ctl.udfs().await?;

        for udf in &backup.user_defined_functions {
            tracing::debug!("Restoring UDF {}", udf);
            let key = self.layout.udf_key(&backup.name, udf);
            let statement = String::from_utf8(
                self.layout.download_data(key, backup.encrypted).await?,
            )
            .map_err(|e| EngineError::IntegrityError(format!("UDF SQL is not UTF-8: {}", e)))?;

            match existing.get(udf) {
                Some(current) if schema::schemas_equal(current, &statement) => continue,
                Some(_) => {
                    self.ctl.drop_udf(udf).await?;
                    self.ctl.execute_ddl(&statement).await?;
                }
                None => {
                    self.ctl.execute_ddl(&statement).await?;
                }
            }
        }

        tracing::info!("All UDFs restored");
        Ok(())
    }

    async fn restore_named_collections(&self, backup: &BackupMetadata) -> EngineResult<()> {
        for collection in &backup.named_collections {
            tracing::debug!("Restoring named collection {}", collection);
            let key = self.layout.named_collection_key(&backup.name, collection);
            let statement = String::from_utf8(
                self.layout.download_data(key, backup.encrypted).await?,
            )
            .map_err(|e| {
                EngineError::IntegrityError(format!("named collection SQL is not UTF-8: {}", e))
            })?;

            self.ctl
                .execute_ddl(&format!(
                    "DROP NAMED COLLECTION IF EXISTS `{}`",
                    collection.replace('`', "\\`")
                ))
                .await?;
            self.ctl.execute_ddl(&statement).await?;
        }

        Ok(())
    }

    // ---- phase 2: databases ----

    async fn restore_databases(
        &self,
        backup: &BackupMetadata,
        databases: &[String],
        options: &RestoreOptions,
        macros: &HashMap<String, String>,
    ) -> EngineResult<()> {
        let existing: HashSet<String> = self
            .ctl
            .databases(&[])
            .await?
            .into_iter()
            .map(|db| db.name)
            .collect();

        for db_name in databases {
            let mut db_meta = backup
                .databases
                .get(db_name)
                .cloned()
                .ok_or_else(|| EngineError::BackupNotFound(db_name.clone()))?;

            let sql_key = self.layout.database_sql_key(&backup.name, db_name);
            let sql = String::from_utf8(
                self.layout.download_data(sql_key, backup.encrypted).await?,
            )
            .map_err(|e| {
                EngineError::IntegrityError(format!("database SQL is not UTF-8: {}", e))
            })?;

            // older documents carry no engine; recover it from the SQL
            if db_meta.engine.is_none() {
                db_meta.engine = schema::database_engine_from_sql(&sql);
            }

            let replicated = db_meta.engine.as_deref() == Some("Replicated");

            if replicated {
                if let Some(mode) = options.clean_zookeeper_mode {
                    self.clean_database_replicas(&sql, db_meta.uuid.as_deref(), mode, options, macros)
                        .await?;
                }
            }

            if existing.contains(db_name) {
                tracing::debug!("Database \"{}\" already exists", db_name);
                continue;
            }

            tracing::debug!("Restoring database \"{}\"", db_name);
            self.ctl
                .execute_ddl(&schema::to_create_query(&sql))
                .await?;
        }

        Ok(())
    }

    async fn clean_database_replicas(
        &self,
        create_sql: &str,
        uuid: Option<&str>,
        mode: CleanZookeeperMode,
        options: &RestoreOptions,
        macros: &HashMap<String, String>,
    ) -> EngineResult<()> {
        // Replicated('/zk/path', '{shard}', '{replica}')
        let args = database_engine_args(create_sql);
        let (zk_path, shard) = match args {
            Some(args) => args,
            None => return Ok(()),
        };

        let mut macros = macros.clone();
        if let Some(uuid) = uuid {
            macros.insert("uuid".to_string(), uuid.to_string());
        }
        let path = schema::replace_macros(&zk_path, &macros);
        let shard = schema::replace_macros(&shard, &macros);

        match mode {
            CleanZookeeperMode::ReplicaOnly => {
                let replica = self.replica_identity(options, &macros)?;
                let full = format!("{}|{}", shard, replica);
                tracing::debug!("Dropping database replica {} under {}", full, path);
                self.system_drop_database_replica_tolerant(&full, &path).await?;
            }
            CleanZookeeperMode::AllReplicas => {
                let replicas = self
                    .ctl
                    .zookeeper_children(&format!("{}/replicas", path))
                    .await?;
                for full in replicas {
                    tracing::debug!("Dropping database replica {} under {}", full, path);
                    self.system_drop_database_replica_tolerant(&full, &path).await?;
                }
            }
        }

        Ok(())
    }

    async fn system_drop_database_replica_tolerant(
        &self,
        replica: &str,
        path: &str,
    ) -> EngineResult<()> {
        if let Err(e) = self.ctl.system_drop_database_replica(replica, path).await {
            // absent entries are fine; the goal is a clean slate
            tracing::warn!("Dropping database replica failed, ignoring: {}", e);
        }
        Ok(())
    }

    // ---- phase 3: table objects ----

    async fn collect_tables(
        &self,
        backup: &BackupMetadata,
        databases: &[String],
        options: &RestoreOptions,
    ) -> EngineResult<Vec<RestoreTable>> {
        tracing::debug!("Retrieving tables metadata");

        let requested: HashSet<&TableSelector> = options.tables.iter().collect();
        let excluded: HashSet<&TableSelector> = options.exclude_tables.iter().collect();

        let mut tables = Vec::new();
        for db_name in databases {
            let db_meta = match backup.databases.get(db_name) {
                Some(db) => db,
                None => continue,
            };

            let replicated_db = db_meta.engine.as_deref() == Some("Replicated");
            if replicated_db && !options.restore_tables_in_replicated_database {
                tracing::debug!(
                    "Leaving tables of Replicated database \"{}\" to replication",
                    db_name
                );
                continue;
            }

            for (table_name, table_meta) in &db_meta.tables {
                let selector = (db_name.clone(), table_name.clone());
                if !requested.is_empty() && !requested.contains(&selector) {
                    continue;
                }
                if excluded.contains(&selector) {
                    continue;
                }

                let key = self.layout.table_sql_key(&backup.name, db_name, table_name);
                let sql = String::from_utf8(
                    self.layout.download_data(key, backup.encrypted).await?,
                )
                .map_err(|e| {
                    EngineError::IntegrityError(format!("table SQL is not UTF-8: {}", e))
                })?;

                let create_statement = self.rewrite_table_schema(&sql, options);

                tables.push(RestoreTable {
                    database: db_name.clone(),
                    name: table_name.clone(),
                    engine: table_meta.engine.clone(),
                    create_statement,
                });
            }
        }

        // verify explicitly requested tables are all present
        if !requested.is_empty() {
            let present: HashSet<TableSelector> = tables
                .iter()
                .map(|t| (t.database.clone(), t.name.clone()))
                .collect();
            let missed: Vec<String> = requested
                .iter()
                .filter(|s| !present.contains(**s))
                .map(|s| format!("{}.{}", s.0, s.1))
                .collect();
            if !missed.is_empty() {
                return Err(EngineError::BackupNotFound(format!(
                    "tables not found in backup: {}",
                    missed.join(", ")
                )));
            }
        }

        Ok(tables)
    }

    fn rewrite_table_schema(&self, sql: &str, options: &RestoreOptions) -> String {
        let force_non_replicated =
            options.force_non_replicated || self.config.backup.force_non_replicated;

        if force_non_replicated {
            return schema::force_non_replicated(sql);
        }

        let override_replica = options
            .override_replica_name
            .clone()
            .or_else(|| self.config.backup.override_replica_name.clone());

        match override_replica {
            Some(replica) => schema::override_replica_name(sql, &replica),
            None => sql.to_string(),
        }
    }

    async fn clean_table_replicas(
        &self,
        tables: &[RestoreTable],
        mode: CleanZookeeperMode,
        options: &RestoreOptions,
        macros: &HashMap<String, String>,
    ) -> EngineResult<()> {
        for table in tables.iter().filter(|t| t.is_replicated()) {
            let (zk_path, _) = match schema::replicated_engine_args(&table.create_statement) {
                Some(args) => args,
                None => continue,
            };

            let mut macros = macros.clone();
            macros.insert("database".to_string(), table.database.clone());
            macros.insert("table".to_string(), table.name.clone());
            if let Some(uuid) = schema::uuid_from_sql(&table.create_statement) {
                macros.insert("uuid".to_string(), uuid);
            }

            let path = schema::replace_macros(&zk_path, &macros);

            let replicas = match mode {
                CleanZookeeperMode::ReplicaOnly => {
                    vec![self.replica_identity(options, &macros)?]
                }
                CleanZookeeperMode::AllReplicas => {
                    self.ctl
                        .zookeeper_children(&format!("{}/replicas", path))
                        .await?
                }
            };

            for replica in replicas {
                tracing::debug!(
                    "Dropping replica {} of table \"{}\".\"{}\" from {}",
                    replica,
                    table.database,
                    table.name,
                    path
                );
                if let Err(e) = self.ctl.system_drop_replica(&replica, &path).await {
                    tracing::warn!("System drop replica failed, ignoring: {}", e);
                }
            }
        }

        Ok(())
    }

    fn replica_identity(
        &self,
        options: &RestoreOptions,
        macros: &HashMap<String, String>,
    ) -> EngineResult<String> {
        options
            .replica_name
            .clone()
            .or_else(|| macros.get("replica").cloned())
            .ok_or_else(|| {
                EngineError::ConfigError(
                    "cannot determine the replica name; specify it explicitly or through macros"
                        .to_string(),
                )
            })
    }

    /// Creates table objects, retrying failures after the rest.
    ///
    /// Tables may depend on each other (views on tables, dictionaries on
    /// sources); instead of computing the dependency order, failed
    /// creations go to the back of the queue until no further progress
    /// is possible.
    async fn restore_table_objects(
        &self,
        tables: &[RestoreTable],
        keep_going: bool,
    ) -> EngineResult<Vec<RestoreTable>> {
        tracing::info!("Restoring tables");

        let tables = self.preprocess_existing_tables(tables).await?;

        let mut unprocessed: VecDeque<RestoreTable> = tables.into_iter().collect();
        let mut errors: Vec<(RestoreTable, EngineError)> = Vec::new();

        while let Some(table) = unprocessed.pop_front() {
            tracing::debug!(
                "Trying to restore table object for \"{}\".\"{}\"",
                table.database,
                table.name
            );

            match self.restore_table_object(&table).await {
                Ok(()) => errors.clear(),
                Err(e) => {
                    tracing::warn!(
                        "Failed to restore \"{}\".\"{}\", will retry after other tables: {}",
                        table.database,
                        table.name,
                        e
                    );
                    errors.push((table.clone(), e));
                    unprocessed.push_back(table);

                    if errors.len() > unprocessed.len() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Restoring tables completed");

        if errors.is_empty() {
            return Ok(vec![]);
        }

        let mut failed: Vec<RestoreTable> = Vec::new();
        let mut seen = HashSet::new();
        for (table, e) in &errors {
            tracing::error!(
                "Failed to restore \"{}\".\"{}\": {}",
                table.database,
                table.name,
                e
            );
            if seen.insert((table.database.clone(), table.name.clone())) {
                failed.push(table.clone());
            }
        }

        if keep_going {
            return Ok(failed);
        }

        let names: Vec<String> = failed
            .iter()
            .map(|t| format!("`{}`.`{}`", t.database, t.name))
            .collect();
        Err(EngineError::IntegrityError(format!(
            "failed to restore tables: {}",
            names.join(", ")
        )))
    }

    /// Drops destination tables whose schema differs from the backup;
    /// identical tables are dropped from the work list instead.
    async fn preprocess_existing_tables(
        &self,
        tables: &[RestoreTable],
    ) -> EngineResult<Vec<RestoreTable>> {
        let mut result = Vec::new();

        for table in tables {
            if let Some(existing) = self.ctl.table(&table.database, &table.name).await? {
                if schema::schemas_equal(&existing.create_table_query, &table.create_statement) {
                    continue;
                }

                tracing::warn!(
                    "Table \"{}\".\"{}\" will be recreated as its schema mismatches the schema from backup",
                    table.database,
                    table.name
                );
                if table.is_dictionary() {
                    self.ctl
                        .drop_dictionary_if_exists(&table.database, &table.name)
                        .await?;
                } else {
                    self.ctl
                        .drop_table_if_exists(&table.database, &table.name)
                        .await?;
                }
            }

            result.push(table.clone());
        }

        Ok(result)
    }

    async fn restore_table_object(&self, table: &RestoreTable) -> EngineResult<()> {
        let result = if table.attaches() {
            let sql = schema::to_attach_query(&table.create_statement);
            match self.ctl.execute_ddl(&sql).await {
                Ok(()) if table.is_replicated() => {
                    let current = self.ctl.table(&table.database, &table.name).await?;
                    match current {
                        Some(current) => self.ctl.restore_replica(&current).await,
                        None => Ok(()),
                    }
                }
                other => other,
            }
        } else {
            self.ctl
                .execute_ddl(&schema::to_create_query(&table.create_statement))
                .await
        };

        if let Err(e) = result {
            tracing::debug!(
                "Failed to restore table \"{}\".\"{}\", removing it: {}",
                table.database,
                table.name,
                e
            );
            if table.is_dictionary() {
                self.ctl
                    .drop_dictionary_if_exists(&table.database, &table.name)
                    .await?;
            } else {
                self.ctl
                    .drop_table_if_exists(&table.database, &table.name)
                    .await?;
            }
            return Err(e);
        }

        Ok(())
    }

    // ---- phase 4: data ----

    async fn restore_data(
        &self,
        backup: &BackupMetadata,
        tables: &[&RestoreTable],
        options: &RestoreOptions,
        context: &mut RestoreContext,
    ) -> EngineResult<()> {
        tracing::info!("Restoring tables data");

        let disks = self.ctl.disks().await?;
        let mut cloud_restorers: HashMap<String, CloudStorageRestorer> = HashMap::new();

        if backup.cloud_storage.enabled() && options.cloud.is_none() {
            return Err(EngineError::ConfigError(
                "cloud storage source bucket must be set: backup has data on object-storage disks"
                    .to_string(),
            ));
        }

        for table in tables {
            let result = self
                .restore_table_data(backup, table, options, context, &disks, &mut cloud_restorers)
                .await;

            context.flush()?;
            result?;
        }

        tracing::info!("Restoring tables data completed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn restore_table_data(
        &self,
        backup: &BackupMetadata,
        table: &RestoreTable,
        options: &RestoreOptions,
        context: &mut RestoreContext,
        disks: &[Disk],
        cloud_restorers: &mut HashMap<String, CloudStorageRestorer>,
    ) -> EngineResult<()> {
        let current = self
            .ctl
            .table(&table.database, &table.name)
            .await?
            .ok_or_else(|| {
                EngineError::IntegrityError(format!(
                    "table not found: {}.{}",
                    table.database, table.name
                ))
            })?;

        if !current.is_merge_tree() {
            tracing::debug!(
                "Skip table \"{}\".\"{}\" data restore: not MergeTree family",
                table.database,
                table.name
            );
            return Ok(());
        }

        tracing::debug!(
            "Running table \"{}\".\"{}\" data restore",
            table.database,
            table.name
        );

        let table_meta = backup
            .databases
            .get(&table.database)
            .and_then(|db| db.tables.get(&table.name));
        let parts: Vec<PartRef> = match table_meta {
            Some(meta) => meta.part_refs(&table.database, &table.name),
            None => vec![],
        };

        let mut attach_parts: Vec<PartRef> = Vec::new();
        let mut cloud_parts: Vec<PartRef> = Vec::new();

        for part in parts {
            match context.part_state(&part) {
                PartRestoreState::Attached => {
                    tracing::debug!(
                        "{}.{} part {} already restored, skipping it",
                        table.database,
                        table.name,
                        part.name
                    );
                    continue;
                }
                PartRestoreState::Downloaded => {
                    tracing::debug!(
                        "{}.{} part {} already downloaded, only attaching it",
                        table.database,
                        table.name,
                        part.name
                    );
                    attach_parts.push(part);
                    continue;
                }
                _ => {}
            }

            if part.metadata.storage_class == StorageClass::ObjectStorage {
                cloud_parts.push(part);
                continue;
            }

            let owner = part
                .metadata
                .link
                .clone()
                .unwrap_or_else(|| backup.name.to_string());
            let dest = ClickhouseCtl::detached_part_path(
                &current,
                disks,
                &part.metadata.disk_name,
                &part.name,
            )?;

            match self.layout.download_data_part(&owner, &part, dest).await {
                Ok(()) => {
                    context.set_part_state(&part, PartRestoreState::Downloaded)?;
                    attach_parts.push(part);
                }
                Err(e) => {
                    if !options.keep_going {
                        return Err(e);
                    }
                    tracing::warn!(
                        "Restore of part {} failed, skipping due to keep-going: {}",
                        part.name,
                        e
                    );
                    context.add_failed_part(&part, e.to_string());
                    context.set_part_state(&part, PartRestoreState::Skipped)?;
                }
            }
        }

        if !cloud_parts.is_empty() {
            self.restore_cloud_parts(
                backup,
                table,
                &current,
                cloud_parts,
                options,
                context,
                disks,
                cloud_restorers,
                &mut attach_parts,
            )
            .await?;
        }

        for part in attach_parts {
            tracing::debug!(
                "Attaching \"{}.{}\" part: {}",
                table.database,
                table.name,
                part.name
            );
            match self.ctl.attach_part(&current, &part.name).await {
                Ok(()) => {
                    context.set_part_state(&part, PartRestoreState::Attached)?;
                }
                Err(e) => {
                    tracing::warn!(
                        "Attaching \"{}.{}\" part {} failed: {}",
                        table.database,
                        table.name,
                        part.name,
                        e
                    );
                    context.add_failed_part(&part, e.to_string());
                    context.set_part_state(&part, PartRestoreState::Skipped)?;

                    if self.config.backup.restore_fail_on_attach_error && !options.keep_going {
                        return Err(EngineError::AttachFailure {
                            database: table.database.clone(),
                            table: table.name.clone(),
                            part: part.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn restore_cloud_parts(
        &self,
        backup: &BackupMetadata,
        table: &RestoreTable,
        current: &Table,
        cloud_parts: Vec<PartRef>,
        options: &RestoreOptions,
        context: &mut RestoreContext,
        disks: &[Disk],
        cloud_restorers: &mut HashMap<String, CloudStorageRestorer>,
        attach_parts: &mut Vec<PartRef>,
    ) -> EngineResult<()> {
        let params = options.cloud.as_ref().ok_or_else(|| {
            EngineError::ConfigError("cloud storage source parameters are missing".to_string())
        })?;

        let mut by_disk: HashMap<String, Vec<PartRef>> = HashMap::new();
        for part in cloud_parts {
            by_disk
                .entry(part.metadata.disk_name.clone())
                .or_default()
                .push(part);
        }

        for (disk_name, parts) in by_disk {
            let disk = disks
                .iter()
                .find(|d| d.name == disk_name && d.kind == DiskKind::ObjectStorage)
                .ok_or_else(|| {
                    EngineError::ConfigError(format!(
                        "object-storage disk \"{}\" is not configured on this node",
                        disk_name
                    ))
                })?;

            if !cloud_restorers.contains_key(&disk_name) {
                let restorer = CloudStorageRestorer::new(self.config, params, disk).await?;
                if restorer.is_inplace() {
                    tracing::info!(
                        "Using inplace cloud restore for disk \"{}\"",
                        disk_name
                    );
                }
                if !params.latest {
                    if let Some(revision) = backup.cloud_storage.revisions.get(&disk_name) {
                        tracing::info!(
                            "Disk \"{}\" was frozen at revision {}",
                            disk_name,
                            revision
                        );
                    }
                }
                cloud_restorers.insert(disk_name.clone(), restorer);
            }
            let restorer = &cloud_restorers[&disk_name];

            // the tarball of this table holds every frozen part's index files
            let staging = tempfile::tempdir().map_err(EngineError::storage_error)?;
            let key = self.layout.cloud_storage_key(
                &backup.name,
                &disk_name,
                &table.database,
                &table.name,
            );
            self.layout
                .download_files_tarball(
                    key,
                    staging.path().to_path_buf(),
                    backup.cloud_storage.encryption,
                    backup.cloud_storage.compression,
                )
                .await?;

            for part in parts {
                let part_dir = staging.path().join(&part.name);
                let result: EngineResult<()> = async {
                    if !part_dir.exists() {
                        return Err(EngineError::IntegrityError(format!(
                            "part {} is missing from the disk metadata artifact",
                            part.name
                        )));
                    }

                    restorer.materialize_part(&part_dir).await?;

                    let dest: PathBuf = ClickhouseCtl::detached_part_path(
                        current,
                        disks,
                        &part.metadata.disk_name,
                        &part.name,
                    )?;
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    copy_dir_recursive(&part_dir, &dest).await?;
                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => {
                        context.set_part_state(&part, PartRestoreState::Downloaded)?;
                        attach_parts.push(part);
                    }
                    Err(e) => {
                        if !options.keep_going {
                            return Err(e);
                        }
                        tracing::warn!(
                            "Cloud restore of part {} failed, skipping due to keep-going: {}",
                            part.name,
                            e
                        );
                        context.add_failed_part(&part, e.to_string());
                        context.set_part_state(&part, PartRestoreState::Skipped)?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Copies schemas from a source node onto the local one.
///
/// Used to rebuild a node's metadata from a live peer: schemas are
/// normalized the same way a backup restore normalizes them, and stale
/// replica entries are dropped so the server re-syncs from its peers on
/// startup.
pub async fn restore_schema_from_host(
    source: &ClickhouseCtl,
    dest: &ClickhouseCtl,
    config: &Config,
    exclude_dbs: &[String],
    replica_name: Option<&str>,
) -> EngineResult<()> {
    let macros = dest.macros().await?;
    let replica = replica_name
        .map(str::to_string)
        .or_else(|| macros.get("replica").cloned())
        .ok_or_else(|| {
            EngineError::ConfigError(
                "cannot determine the replica name; specify it explicitly or through macros"
                    .to_string(),
            )
        })?;

    let databases = source.databases(exclude_dbs).await?;

    for db in &databases {
        let sql = source.show_create_database(&db.name).await?;
        let existing: HashSet<String> = dest
            .databases(&[])
            .await?
            .into_iter()
            .map(|d| d.name)
            .collect();

        if !existing.contains(&db.name) {
            dest.execute_ddl(&schema::to_create_query(&sql)).await?;
        }

        for table in source.tables(&db.name, &[]).await? {
            let rewritten = if config.backup.force_non_replicated {
                schema::force_non_replicated(&table.create_table_query)
            } else {
                match &config.backup.override_replica_name {
                    Some(replica) => {
                        schema::override_replica_name(&table.create_table_query, replica)
                    }
                    None => table.create_table_query.clone(),
                }
            };

            if let Some(existing) = dest.table(&db.name, &table.name).await? {
                if schema::schemas_equal(&existing.create_table_query, &rewritten) {
                    continue;
                }
                dest.drop_table_if_exists(&db.name, &table.name).await?;
            }

            // purge this replica's stale coordination entries so the
            // recreated table re-syncs from its peers
            if schema::is_replicated(&table.engine) {
                if let Some((zk_path, _)) = schema::replicated_engine_args(&rewritten) {
                    let mut macros = macros.clone();
                    macros.insert("database".to_string(), db.name.clone());
                    macros.insert("table".to_string(), table.name.clone());
                    if let Some(uuid) = &table.uuid {
                        macros.insert("uuid".to_string(), uuid.clone());
                    }
                    let path = schema::replace_macros(&zk_path, &macros);
                    if let Err(e) = dest.system_drop_replica(&replica, &path).await {
                        tracing::warn!("System drop replica failed, ignoring: {}", e);
                    }
                }
            }

            let ddl = if schema::is_merge_tree(&table.engine) {
                schema::to_attach_query(&rewritten)
            } else {
                schema::to_create_query(&rewritten)
            };
            dest.execute_ddl(&ddl).await?;
        }
    }

    Ok(())
}

fn select_databases(
    backup: &BackupMetadata,
    options: &RestoreOptions,
) -> EngineResult<Vec<String>> {
    let mut databases: Vec<String> = if !options.tables.is_empty() {
        let mut dbs: Vec<String> = options.tables.iter().map(|(db, _)| db.clone()).collect();
        dbs.sort();
        dbs.dedup();
        dbs
    } else if !options.databases.is_empty() {
        options.databases.clone()
    } else {
        backup.databases.keys().cloned().collect()
    };

    databases.retain(|db| !options.exclude_databases.contains(db));

    let missed: Vec<&String> = databases
        .iter()
        .filter(|db| !backup.databases.contains_key(*db))
        .collect();
    if !missed.is_empty() {
        return Err(EngineError::BackupNotFound(format!(
            "databases not found in backup: {}",
            missed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok(databases)
}

/// Extracts (zk path, shard) from a `Replicated` database engine clause.
fn database_engine_args(sql: &str) -> Option<(String, String)> {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        static ref REPLICATED_DB_REGEX: Regex = Regex::new(
            r"Replicated\(\s*'(?P<zk_path>[^']*)'\s*,\s*'(?P<shard>[^']*)'\s*,\s*'(?P<replica>[^']*)'\s*\)"
        )
        .unwrap();
    }

    REPLICATED_DB_REGEX.captures(sql).map(|caps| {
        (
            caps["zk_path"].to_string(),
            caps["shard"].to_string(),
        )
    })
}

/// Recursively copies a directory tree.
async fn copy_dir_recursive(src: &std::path::Path, dest: &std::path::Path) -> EngineResult<()> {
    let files = crate::clickhouse::control::list_dir_files(src).await?;
    for file in files {
        let from = src.join(&file);
        let to = dest.join(&file);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&from, &to).await?;
    }
    Ok(())
}

/// Resolves a target backup name for restore: only `created` backups
/// may be consumed.
pub fn ensure_restorable(backup: &BackupMetadata) -> EngineResult<()> {
    if backup.state != crate::metadata::BackupState::Created {
        return Err(EngineError::IntegrityError(format!(
            "backup \"{}\" is in state {} and cannot be restored",
            backup.name,
            backup.state.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_zookeeper_mode_parsing() {
        assert_eq!(
            CleanZookeeperMode::ReplicaOnly,
            "replica-only".parse().unwrap()
        );
        assert_eq!(
            CleanZookeeperMode::AllReplicas,
            "all-replicas".parse().unwrap()
        );
        "sometimes".parse::<CleanZookeeperMode>().unwrap_err();
    }

    #[test]
    fn test_database_engine_args() {
        let sql = "CREATE DATABASE db1 ENGINE = Replicated('/ch/databases/db1', '{shard}', '{replica}')";
        assert_eq!(
            Some(("/ch/databases/db1".to_string(), "{shard}".to_string())),
            database_engine_args(sql)
        );
        assert_eq!(None, database_engine_args("CREATE DATABASE db1"));
    }

    #[test]
    fn test_ensure_restorable() {
        use crate::metadata::{BackupSources, BackupState};

        let mut backup = crate::metadata::BackupMetadata::new(
            "b1".parse().unwrap(),
            "23.8".to_string(),
            "host".to_string(),
            crate::config::DEFAULT_TIME_FORMAT.to_string(),
            Default::default(),
            false,
            BackupSources::all(),
        );

        ensure_restorable(&backup).unwrap_err();

        backup.state = BackupState::Created;
        ensure_restorable(&backup).unwrap();
    }
}
