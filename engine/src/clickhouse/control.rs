//! Typed operations against the ClickHouse server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs;

use chbackup::checksum::Checksum;
use chbackup::name::BackupName;

use super::client::ChClient;
use super::models::{Database, Disk, DiskKind, FrozenPart, Table};
use crate::config::ClickhouseConfig;
use crate::error::{EngineError, EngineResult};

/// Control surface over a single ClickHouse node.
#[derive(Debug, Clone)]
pub struct ClickhouseCtl {
    client: ChClient,
    config: ClickhouseConfig,
}

#[derive(Debug, Deserialize)]
struct MacroRow {
    r#macro: String,
    substitution: String,
}

#[derive(Debug, Deserialize)]
struct UdfRow {
    name: String,
    create_query: String,
}

impl ClickhouseCtl {
    pub fn new(config: &ClickhouseConfig) -> EngineResult<Self> {
        Ok(Self {
            client: ChClient::new(config)?,
            config: config.clone(),
        })
    }

    /// Returns the server version, e.g. `23.8.2.7`.
    pub async fn version(&self) -> EngineResult<String> {
        self.client.query_scalar("SELECT version()").await
    }

    /// Returns whether the server version is at least `required`.
    pub async fn version_ge(&self, required: &str) -> EngineResult<bool> {
        let version = self.version().await?;
        Ok(compare_versions(&version, required) >= std::cmp::Ordering::Equal)
    }

    /// Returns the macro substitution set of the server.
    pub async fn macros(&self) -> EngineResult<HashMap<String, String>> {
        let rows: Vec<MacroRow> = self
            .client
            .query_rows("SELECT macro, substitution FROM system.macros")
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.r#macro, row.substitution))
            .collect())
    }

    /// Lists databases, except the excluded ones.
    pub async fn databases(&self, exclude: &[String]) -> EngineResult<Vec<Database>> {
        let databases: Vec<Database> = self
            .client
            .query_rows(
                "SELECT name, engine, toString(uuid) AS uuid, metadata_path, engine_full \
                 FROM system.databases",
            )
            .await?;

        Ok(databases
            .into_iter()
            .filter(|db| !exclude.contains(&db.name))
            .collect())
    }

    /// Lists tables of a database, optionally restricted by name.
    pub async fn tables(&self, database: &str, names: &[String]) -> EngineResult<Vec<Table>> {
        let mut query = format!(
            "SELECT database, name, engine, toString(uuid) AS uuid, create_table_query, \
             metadata_path, data_paths \
             FROM system.tables WHERE database = '{}'",
            escape_string(database)
        );

        if !names.is_empty() {
            let list = names
                .iter()
                .map(|n| format!("'{}'", escape_string(n)))
                .collect::<Vec<_>>()
                .join(", ");
            query.push_str(&format!(" AND name IN ({})", list));
        }

        self.client.query_rows(&query).await
    }

    /// Returns a single table, or None if it does not exist.
    pub async fn table(&self, database: &str, name: &str) -> EngineResult<Option<Table>> {
        let mut tables = self.tables(database, &[name.to_string()]).await?;
        Ok(if tables.is_empty() {
            None
        } else {
            Some(tables.swap_remove(0))
        })
    }

    pub async fn table_exists(&self, database: &str, name: &str) -> EngineResult<bool> {
        let count = self
            .client
            .query_scalar(&format!(
                "SELECT count() FROM system.tables WHERE database = '{}' AND name = '{}'",
                escape_string(database),
                escape_string(name)
            ))
            .await?;
        Ok(count != "0")
    }

    /// Lists the disks configured on the server.
    pub async fn disks(&self) -> EngineResult<Vec<Disk>> {
        self.client
            .query_rows("SELECT name, path, type, cache_path FROM system.disks")
            .await
    }

    /// Issues `ALTER TABLE ... FREEZE WITH NAME` for the table.
    pub async fn freeze_table(&self, backup_name: &BackupName, table: &Table) -> EngineResult<()> {
        let query = format!(
            "ALTER TABLE `{}`.`{}` FREEZE WITH NAME '{}'",
            escape_ident(&table.database),
            escape_ident(&table.name),
            backup_name.sanitized()
        );
        self.client
            .execute_with_timeout(&query, Some(self.config.freeze_timeout))
            .await
    }

    /// Releases frozen shadow data on the server side.
    ///
    /// `SYSTEM UNFREEZE` is only available on 22.6+; on older servers the
    /// shadow subtree is removed directly.
    pub async fn system_unfreeze(&self, backup_name: &BackupName) -> EngineResult<()> {
        if self.version_ge("22.6").await? {
            let query = format!(
                "SYSTEM UNFREEZE WITH NAME '{}'",
                backup_name.sanitized()
            );
            self.client
                .execute_with_timeout(&query, Some(self.config.freeze_timeout))
                .await
        } else {
            self.remove_frozen_data(backup_name).await
        }
    }

    /// Removes the shadow subtree of the given backup from all local disks.
    pub async fn remove_frozen_data(&self, backup_name: &BackupName) -> EngineResult<()> {
        for disk in self.disks().await? {
            if disk.kind != DiskKind::Local {
                continue;
            }

            let shadow_path = disk.path.join("shadow").join(backup_name.sanitized());
            if fs::try_exists(&shadow_path).await? {
                tracing::debug!("Removing shadow subtree {:?}", shadow_path);
                fs::remove_dir_all(&shadow_path).await?;
            }
        }

        Ok(())
    }

    /// Removes a single frozen part directory.
    pub async fn remove_frozen_part(&self, part: &FrozenPart) -> EngineResult<()> {
        if fs::try_exists(&part.path).await? {
            fs::remove_dir_all(&part.path).await?;
        }
        Ok(())
    }

    /// Creates `shadow/increment.txt` before parallel freezing.
    ///
    /// Parallel FREEZE statements race on creating the increment counter;
    /// creating it up front sidesteps the race.
    pub async fn create_shadow_increment(&self) -> EngineResult<()> {
        let shadow = self.config.data_path.join("shadow");
        fs::create_dir_all(&shadow).await?;

        let increment = shadow.join("increment.txt");
        if !fs::try_exists(&increment).await? {
            fs::write(&increment, b"0").await?;
        }

        Ok(())
    }

    /// Enumerates frozen parts of a table on a disk.
    pub async fn scan_frozen_parts(
        &self,
        table: &Table,
        disk: &Disk,
        data_path: &Path,
        backup_name: &BackupName,
    ) -> EngineResult<Vec<FrozenPart>> {
        let table_relative_path = match data_path.strip_prefix(&disk.path) {
            Ok(p) => p,
            Err(_) => return Ok(vec![]),
        };

        let shadow_path = disk
            .path
            .join("shadow")
            .join(backup_name.sanitized())
            .join(table_relative_path);

        if !fs::try_exists(&shadow_path).await? {
            tracing::debug!("Shadow path {:?} is empty", shadow_path);
            return Ok(vec![]);
        }

        let mut parts = Vec::new();
        let mut entries = fs::read_dir(&shadow_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let part_name = entry.file_name().to_string_lossy().into_owned();
            let part_path = entry.path();

            let files = list_dir_files(&part_path).await?;
            let mut size = 0;
            for file in &files {
                size += fs::metadata(part_path.join(file)).await?.len();
            }
            let checksum = part_checksum(&part_path, &files).await?;

            parts.push(FrozenPart {
                database: table.database.clone(),
                table: table.name.clone(),
                name: part_name,
                disk_name: disk.name.clone(),
                path: part_path,
                checksum,
                size,
                files,
            });
        }

        parts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(parts)
    }

    /// Reads the revision counter an object-storage disk wrote at freeze
    /// time, if any.
    pub async fn read_disk_revision(
        &self,
        disk: &Disk,
        backup_name: &BackupName,
    ) -> EngineResult<Option<u64>> {
        let path = disk
            .path
            .join("shadow")
            .join(backup_name.sanitized())
            .join("revision.txt");

        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).await?;
        contents.trim().parse::<u64>().map(Some).map_err(|e| {
            EngineError::IntegrityError(format!("malformed revision counter {:?}: {}", path, e))
        })
    }

    /// Attaches a detached part to a table.
    pub async fn attach_part(&self, table: &Table, part_name: &str) -> EngineResult<()> {
        let query = format!(
            "ALTER TABLE `{}`.`{}` ATTACH PART '{}'",
            escape_ident(&table.database),
            escape_ident(&table.name),
            escape_string(part_name)
        );
        self.client.execute(&query).await
    }

    /// Runs an arbitrary DDL statement.
    pub async fn execute_ddl(&self, sql: &str) -> EngineResult<()> {
        self.client.execute(sql).await
    }

    pub async fn drop_table_if_exists(&self, database: &str, name: &str) -> EngineResult<()> {
        self.relax_drop_size_guard().await;

        let query = format!(
            "DROP TABLE IF EXISTS `{}`.`{}` NO DELAY",
            escape_ident(database),
            escape_ident(name)
        );
        self.client.execute(&query).await
    }

    /// Creates the `force_drop_table` flag so the server's
    /// `max_table_size_to_drop` guard does not reject the drop.
    ///
    /// The server consumes the flag; failures to create it only matter
    /// when the guard actually fires, so they are not fatal here.
    async fn relax_drop_size_guard(&self) {
        let flags = self.config.data_path.join("flags");
        let flag = flags.join("force_drop_table");

        let result: std::io::Result<()> = async {
            fs::create_dir_all(&flags).await?;
            fs::write(&flag, b"").await?;
            let mut permissions = fs::metadata(&flag).await?.permissions();
            use std::os::unix::fs::PermissionsExt;
            permissions.set_mode(0o666);
            fs::set_permissions(&flag, permissions).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::debug!("Cannot create force_drop_table flag: {}", e);
        }
    }

    pub async fn drop_dictionary_if_exists(&self, database: &str, name: &str) -> EngineResult<()> {
        let query = format!(
            "DROP DICTIONARY IF EXISTS `{}`.`{}`",
            escape_ident(database),
            escape_ident(name)
        );
        self.client.execute(&query).await
    }

    pub async fn drop_database_if_exists(&self, name: &str) -> EngineResult<()> {
        let query = format!("DROP DATABASE IF EXISTS `{}` NO DELAY", escape_ident(name));
        self.client.execute(&query).await
    }

    /// Restores replication state of a Replicated table.
    pub async fn restore_replica(&self, table: &Table) -> EngineResult<()> {
        let query = format!(
            "SYSTEM RESTORE REPLICA `{}`.`{}`",
            escape_ident(&table.database),
            escape_ident(&table.name)
        );
        self.client.execute(&query).await
    }

    /// Drops a replica's coordination entries under a table path.
    ///
    /// Coordination cleanup is delegated to the server; the engine never
    /// talks to the coordination service for replica metadata directly.
    pub async fn system_drop_replica(&self, replica: &str, zk_path: &str) -> EngineResult<()> {
        let query = format!(
            "SYSTEM DROP REPLICA '{}' FROM ZKPATH '{}'",
            escape_string(replica),
            escape_string(zk_path)
        );
        self.client.execute(&query).await
    }

    /// Drops a replica's coordination entries under a database path.
    pub async fn system_drop_database_replica(
        &self,
        replica: &str,
        zk_path: &str,
    ) -> EngineResult<()> {
        let query = format!(
            "SYSTEM DROP DATABASE REPLICA '{}' FROM ZKPATH '{}'",
            escape_string(replica),
            escape_string(zk_path)
        );
        self.client.execute(&query).await
    }

    /// Returns UUIDs of all local access entities (users, roles,
    /// quotas, row policies, settings profiles).
    pub async fn access_control_ids(&self) -> EngineResult<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Row {
            id: String,
        }

        let mut ids = Vec::new();
        for table in [
            "users",
            "roles",
            "quotas",
            "row_policies",
            "settings_profiles",
        ] {
            let rows: Vec<Row> = self
                .client
                .query_rows(&format!(
                    "SELECT toString(id) AS id FROM system.{} WHERE storage = 'local_directory'",
                    table
                ))
                .await?;
            ids.extend(rows.into_iter().map(|r| r.id));
        }

        Ok(ids)
    }

    /// Returns the names of named collections.
    pub async fn named_collections(&self) -> EngineResult<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Row {
            name: String,
        }

        let rows: Vec<Row> = self
            .client
            .query_rows("SELECT name FROM system.named_collections")
            .await?;

        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    /// Returns the CREATE statement of a database.
    pub async fn show_create_database(&self, database: &str) -> EngineResult<String> {
        self.client
            .query_scalar(&format!(
                "SHOW CREATE DATABASE `{}` FORMAT TabSeparatedRaw",
                escape_ident(database)
            ))
            .await
    }

    /// Lists the children of a coordination node through the server's
    /// Keeper session.
    pub async fn zookeeper_children(&self, path: &str) -> EngineResult<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Row {
            name: String,
        }

        let rows: Vec<Row> = self
            .client
            .query_rows(&format!(
                "SELECT name FROM system.zookeeper WHERE path = '{}'",
                escape_string(path)
            ))
            .await?;

        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    /// Returns user defined functions as name → CREATE statement.
    pub async fn udfs(&self) -> EngineResult<HashMap<String, String>> {
        let rows: Vec<UdfRow> = self
            .client
            .query_rows(
                "SELECT name, create_query FROM system.functions \
                 WHERE origin = 'SQLUserDefined'",
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.name, row.create_query))
            .collect())
    }

    pub async fn drop_udf(&self, name: &str) -> EngineResult<()> {
        let query = format!("DROP FUNCTION `{}`", escape_ident(name));
        self.client.execute(&query).await
    }

    /// Resolves the destination path for a detached part of a table.
    pub fn detached_part_path(
        table: &Table,
        disks: &[Disk],
        disk_name: &str,
        part_name: &str,
    ) -> EngineResult<PathBuf> {
        let disk = disks
            .iter()
            .find(|d| d.name == disk_name)
            .ok_or_else(|| EngineError::ConfigError(format!("unknown disk \"{}\"", disk_name)))?;

        let data_path = table
            .data_paths
            .iter()
            .find(|p| p.starts_with(&disk.path))
            .ok_or_else(|| {
                EngineError::IntegrityError(format!(
                    "table \"{}\".\"{}\" has no data path on disk \"{}\"",
                    table.database, table.name, disk_name
                ))
            })?;

        Ok(Table::detached_path(data_path).join(part_name))
    }
}

/// Computes the content checksum of a part directory.
///
/// `checksums.txt` already digests every column file of the part, so
/// hashing it identifies the part content. Parts without it (rare
/// in-progress formats) fall back to digesting the sorted file listing
/// with sizes.
pub async fn part_checksum(part_path: &Path, files: &[String]) -> EngineResult<Checksum> {
    let checksums_file = part_path.join("checksums.txt");

    let mut hasher = Sha256::new();
    if fs::try_exists(&checksums_file).await? {
        hasher.update(fs::read(&checksums_file).await?);
    } else {
        for file in files {
            let size = fs::metadata(part_path.join(file)).await?.len();
            hasher.update(file.as_bytes());
            hasher.update(size.to_le_bytes());
        }
    }

    Ok(Checksum::Sha256(hasher.finalize().into()))
}

/// Recursively lists files under a directory, relative and sorted.
pub async fn list_dir_files(dir: &Path) -> EngineResult<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else {
                let relative = path
                    .strip_prefix(dir)
                    .expect("entry must be under the scanned directory");
                files.push(relative.to_string_lossy().into_owned());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Compares two dotted version strings numerically.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect::<Vec<_>>()
    };
    parse(a).cmp(&parse(b))
}

fn escape_ident(name: &str) -> String {
    name.replace('`', "\\`")
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::block_on;

    #[test]
    fn test_compare_versions() {
        use std::cmp::Ordering;

        assert_eq!(Ordering::Equal, compare_versions("22.6", "22.6"));
        assert_eq!(Ordering::Greater, compare_versions("23.8.2.7", "22.6"));
        assert_eq!(Ordering::Less, compare_versions("21.11", "22.6"));
        assert_eq!(Ordering::Greater, compare_versions("22.10", "22.6"));
    }

    #[test]
    fn test_escaping() {
        assert_eq!("weird\\`table", escape_ident("weird`table"));
        assert_eq!("it\\'s", escape_string("it's"));
    }

    #[test]
    fn test_list_dir_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.bin"), b"b").unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/c.bin"), b"c").unwrap();

        let files = block_on(list_dir_files(dir.path())).unwrap();
        assert_eq!(vec!["a.bin", "b.bin", "sub/c.bin"], files);
    }

    #[test]
    fn test_part_checksum_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checksums.txt"), b"digest-of-columns").unwrap();
        std::fs::write(dir.path().join("n.bin"), b"payload").unwrap();

        let files = vec!["checksums.txt".to_string(), "n.bin".to_string()];
        let first = block_on(part_checksum(dir.path(), &files)).unwrap();
        let second = block_on(part_checksum(dir.path(), &files)).unwrap();
        assert_eq!(first, second);

        // content change must be visible through checksums.txt
        std::fs::write(dir.path().join("checksums.txt"), b"other-digest").unwrap();
        let third = block_on(part_checksum(dir.path(), &files)).unwrap();
        assert_ne!(first, third);
    }
}
