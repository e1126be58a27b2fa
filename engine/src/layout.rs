//! Backup data layout in object storage.
//!
//! ```text
//! <path_root>/<backup_id>/
//!     backup_struct.json
//!     backup_light_struct.json
//!     data/<db>/<table>/<part>.tar
//!     metadata/<db>.sql
//!     metadata/<db>/<table>.sql
//!     access_control/access_control.tar
//!     user_defined_functions/<name>.sql
//!     named_collections/<name>.sql
//!     cloud_storage/<disk>/<db>/<table>.tar[.gz]
//! ```
//!
//! Database and table names are percent-escaped in keys so non-ASCII and
//! separator characters survive unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use chbackup::name::{BackupName, BackupTarget};
use chbackup::stream::{RateLimitedReader, StreamHasher};
use chbackup::util::escape_for_key;

use crate::clickhouse::FrozenPart;
use crate::compression::{CompressionType, Compressor, Decompressor};
use crate::config::Config;
use crate::encryption::{DecryptingReader, EncryptingReader, EncryptionKey};
use crate::error::{EngineError, EngineResult};
use crate::metadata::{BackupMetadata, BackupState, PartMetadata, PartRef};
use crate::pack;
use crate::storage::{self, StorageBackend};

pub const BACKUP_META_FNAME: &str = "backup_struct.json";
pub const BACKUP_LIGHT_META_FNAME: &str = "backup_light_struct.json";
pub const ACCESS_CONTROL_FNAME: &str = "access_control.tar";
const COMPRESSED_EXTENSION: &str = ".gz";

/// Management of the backup data layout.
///
/// Composes the storage backend with the codec chain
/// (compress → encrypt → rate-limit) and the retry policy.
pub struct BackupLayout {
    storage: Arc<dyn StorageBackend>,
    path_root: String,
    encryption_key: Option<EncryptionKey>,
    max_upload_rate: u64,
    max_retries: u32,
    validate_part_after_upload: bool,
    cloud_compression: bool,

    /// How long a rate-limited part upload may take before it is
    /// abandoned and retried.
    traffic_limit_retry_time: std::time::Duration,
}

impl BackupLayout {
    pub async fn new(config: &Config) -> EngineResult<Self> {
        let storage: Arc<dyn StorageBackend> = storage::from_config(&config.storage).await?.into();

        let encryption_key = if config.encryption.is_enabled {
            let key = config.encryption.key.as_deref().ok_or_else(|| {
                EngineError::ConfigError("encryption is enabled but no key is set".to_string())
            })?;
            Some(EncryptionKey::from_hex(key)?)
        } else {
            None
        };

        Ok(Self {
            storage,
            path_root: config.backup.path_root.clone(),
            encryption_key,
            max_upload_rate: config.rate_limiter.max_upload_rate,
            max_retries: config.storage.max_retries,
            validate_part_after_upload: config.backup.validate_part_after_upload,
            cloud_compression: config.cloud_storage.compression,
            traffic_limit_retry_time: std::time::Duration::from_secs(
                config.storage.uploading_traffic_limit_retry_time,
            ),
        })
    }

    /// Whether data artifacts written by this layout are enciphered.
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_key.is_some()
    }

    // ---- key scheme ----

    pub fn backup_prefix(&self, name: &BackupName) -> String {
        format!("{}/{}/", self.path_root, name.as_str())
    }

    fn metadata_key(&self, name: &BackupName) -> String {
        format!("{}{}", self.backup_prefix(name), BACKUP_META_FNAME)
    }

    fn light_metadata_key(&self, name: &BackupName) -> String {
        format!("{}{}", self.backup_prefix(name), BACKUP_LIGHT_META_FNAME)
    }

    pub fn part_key(&self, backup: &str, database: &str, table: &str, part: &str) -> String {
        format!(
            "{}/{}/data/{}/{}/{}.tar",
            self.path_root,
            backup,
            escape_for_key(database),
            escape_for_key(table),
            part
        )
    }

    pub fn database_sql_key(&self, name: &BackupName, database: &str) -> String {
        format!(
            "{}metadata/{}.sql",
            self.backup_prefix(name),
            escape_for_key(database)
        )
    }

    pub fn table_sql_key(&self, name: &BackupName, database: &str, table: &str) -> String {
        format!(
            "{}metadata/{}/{}.sql",
            self.backup_prefix(name),
            escape_for_key(database),
            escape_for_key(table)
        )
    }

    pub fn access_control_key(&self, name: &BackupName) -> String {
        format!(
            "{}access_control/{}",
            self.backup_prefix(name),
            ACCESS_CONTROL_FNAME
        )
    }

    pub fn udf_key(&self, name: &BackupName, udf: &str) -> String {
        format!(
            "{}user_defined_functions/{}.sql",
            self.backup_prefix(name),
            escape_for_key(udf)
        )
    }

    pub fn named_collection_key(&self, name: &BackupName, collection: &str) -> String {
        format!(
            "{}named_collections/{}.sql",
            self.backup_prefix(name),
            escape_for_key(collection)
        )
    }

    pub fn cloud_storage_key(&self, name: &BackupName, disk: &str, database: &str, table: &str) -> String {
        let extension = if self.cloud_compression {
            COMPRESSED_EXTENSION
        } else {
            ""
        };
        format!(
            "{}cloud_storage/{}/{}/{}.tar{}",
            self.backup_prefix(name),
            escape_for_key(disk),
            escape_for_key(database),
            escape_for_key(table),
            extension
        )
    }

    // ---- backup documents ----

    /// Uploads the full and light forms of the backup document.
    ///
    /// The document replace is the state transition; everything else in
    /// the backup key space is only reachable through it.
    pub async fn upload_backup_metadata(&self, backup: &BackupMetadata) -> EngineResult<()> {
        let full = backup.to_json()?;
        let light = backup.to_light_json()?;

        tracing::debug!("Saving backup metadata in {}", self.metadata_key(&backup.name));
        self.upload_data(self.metadata_key(&backup.name), full.into_bytes(), true)
            .await?;
        self.upload_data(
            self.light_metadata_key(&backup.name),
            light.into_bytes(),
            false,
        )
        .await
    }

    /// Fetches a backup document by name.
    pub async fn get_backup(&self, name: &BackupName, light: bool) -> EngineResult<BackupMetadata> {
        let key = if light {
            self.light_metadata_key(name)
        } else {
            self.metadata_key(name)
        };

        if !self.storage.exists(key.clone()).await? {
            return Err(EngineError::BackupNotFound(name.to_string()));
        }

        let data = self.download_data(key, !light).await?;
        let text = String::from_utf8(data)
            .map_err(|e| EngineError::IntegrityError(format!("document is not UTF-8: {}", e)))?;

        Ok(BackupMetadata::from_json(&text).unwrap_or_else(|e| {
            tracing::warn!("Backup \"{}\" has a torn document ({}); surfacing as failed", name, e);
            torn_document_stub(name)
        }))
    }

    /// Reloads a light document into its full form.
    pub async fn reload_backup(&self, backup: &BackupMetadata) -> EngineResult<BackupMetadata> {
        self.get_backup(&backup.name, false).await
    }

    /// Lists backups, newest first by start time.
    ///
    /// Light documents are read; catalogs are loaded on demand through
    /// [`Self::reload_backup`].
    pub async fn get_backups(&self) -> EngineResult<Vec<BackupMetadata>> {
        let prefix = format!("{}/", self.path_root);
        let entries = self.storage.list_prefix(prefix.clone()).await?;

        let mut names = Vec::new();
        for entry in entries {
            if let Some(rest) = entry.key.strip_prefix(&prefix) {
                if let Some((name, fname)) = rest.split_once('/') {
                    if fname == BACKUP_LIGHT_META_FNAME {
                        names.push(name.to_string());
                    }
                }
            }
        }

        let mut backups = Vec::with_capacity(names.len());
        for name in names {
            let name: BackupName = match name.parse() {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!("Skipping invalid backup name: {}", e);
                    continue;
                }
            };
            backups.push(self.get_backup(&name, true).await?);
        }

        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(backups)
    }

    /// Lists backup names present in the key space, with or without a
    /// readable document.
    pub async fn get_backup_dir_names(&self) -> EngineResult<Vec<String>> {
        let prefix = format!("{}/", self.path_root);
        let entries = self.storage.list_prefix(prefix.clone()).await?;

        let mut names = Vec::new();
        for entry in entries {
            if let Some(rest) = entry.key.strip_prefix(&prefix) {
                if let Some((name, _)) = rest.split_once('/') {
                    if names.last().map(String::as_str) != Some(name) {
                        names.push(name.to_string());
                    }
                }
            }
        }

        names.dedup();
        Ok(names)
    }

    /// Resolves a backup target to a concrete name.
    ///
    /// `LAST` resolves to the most recent backup in `created` state.
    pub async fn resolve_target(&self, target: &BackupTarget) -> EngineResult<BackupName> {
        match target {
            BackupTarget::Name(name) => Ok(name.clone()),
            BackupTarget::Last => {
                let backups = self.get_backups().await?;
                backups
                    .into_iter()
                    .find(|b| b.state == BackupState::Created)
                    .map(|b| b.name)
                    .ok_or(EngineError::NoCreatedBackup)
            }
        }
    }

    // ---- raw data ----

    /// Uploads a small in-memory payload.
    pub async fn upload_data(
        &self,
        key: String,
        data: Vec<u8>,
        encryption: bool,
    ) -> EngineResult<()> {
        let key_for_upload = key.clone();
        storage::with_retries(self.max_retries, move || {
            let key = key_for_upload.clone();
            let data = data.clone();
            async move {
                let mut reader = self.wrap_upload(std::io::Cursor::new(data), encryption, false);
                self.storage.upload_file(key, &mut reader).await
            }
        })
        .await
    }

    /// Downloads a small payload into memory.
    pub async fn download_data(&self, key: String, encryption: bool) -> EngineResult<Vec<u8>> {
        storage::with_retries(self.max_retries, || {
            let key = key.clone();
            async move {
                let raw = self.storage.download_file(key).await?;
                let mut reader = self.wrap_download(raw, encryption, false);

                let mut out = Vec::new();
                reader.read_to_end(&mut out).await?;
                Ok(out)
            }
        })
        .await
    }

    pub async fn exists(&self, key: String) -> EngineResult<bool> {
        self.storage.exists(key).await
    }

    pub async fn object_size(&self, key: String) -> EngineResult<Option<u64>> {
        self.storage.object_size(key).await
    }

    // ---- part artifacts ----

    /// Packs and uploads a frozen part, returning its catalog entry.
    ///
    /// The TAR plaintext is hashed as it is produced; when
    /// `validate_part_after_upload` is set the artifact is read back and
    /// the hash compared. A mismatch deletes the artifact and retries
    /// once; a second mismatch is fatal for the part.
    pub async fn upload_data_part(
        &self,
        backup: &BackupMetadata,
        fpart: &FrozenPart,
    ) -> EngineResult<PartMetadata> {
        let key = self.part_key(
            backup.name.as_str(),
            &fpart.database,
            &fpart.table,
            &fpart.name,
        );

        tracing::debug!(
            "Uploading data part {} of \"{}\".\"{}\"",
            fpart.name,
            fpart.database,
            fpart.table
        );

        let mut validation_failures = 0;
        loop {
            let plaintext_hash = self.upload_tarball_once(&key, fpart).await?;

            if !self.validate_part_after_upload {
                break;
            }

            let readback_hash = self.hash_artifact(&key).await?;
            if readback_hash == plaintext_hash {
                break;
            }

            validation_failures += 1;
            tracing::error!(
                "Artifact {} failed checksum validation after upload (attempt {})",
                key,
                validation_failures
            );
            self.storage.delete_files(vec![key.clone()]).await?;

            if validation_failures >= 2 {
                return Err(EngineError::IntegrityError(format!(
                    "artifact {} repeatedly failed post-upload validation",
                    key
                )));
            }
        }

        let artifact_size = self
            .storage
            .object_size(key.clone())
            .await?
            .ok_or_else(|| {
                EngineError::IntegrityError(format!("artifact {} vanished after upload", key))
            })?;

        Ok(PartMetadata::from_frozen_part(fpart, artifact_size))
    }

    async fn upload_tarball_once(&self, key: &str, fpart: &FrozenPart) -> EngineResult<[u8; 32]> {
        storage::with_retries(self.max_retries, || async move {
            let (tar_stream, producer) =
                pack::tarball_stream(fpart.path.clone(), fpart.files.clone());

            let (hashed, finalized) = StreamHasher::new(tar_stream, Sha256::new());
            let mut reader = self.wrap_upload(hashed, self.encryption_key.is_some(), true);

            // a stalled rate-limited upload is abandoned and retried
            let upload = self.storage.upload_file(key.to_string(), &mut reader);
            let upload_result = if self.max_upload_rate > 0 {
                match tokio::time::timeout(self.traffic_limit_retry_time, upload).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::StorageError(anyhow::anyhow!(
                        "upload of {} stalled past the traffic limit retry time",
                        key
                    ))),
                }
            } else {
                upload.await
            };

            // producer failures (file vanished mid-pack) take precedence:
            // they indicate the part is gone, not a storage fault
            match producer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(EngineError::IntegrityError(format!(
                        "part {} disappeared while packing: {}",
                        fpart.name, e
                    )));
                }
                Err(e) => {
                    return Err(EngineError::IntegrityError(format!(
                        "packing task panicked: {}",
                        e
                    )));
                }
            }
            upload_result?;

            let (digest, _) = finalized
                .get()
                .ok_or_else(|| {
                    EngineError::IntegrityError("artifact hash was not finalized".to_string())
                })?;

            Ok((*digest).into())
        })
        .await
    }

    /// Downloads an artifact and hashes its plaintext TAR stream.
    async fn hash_artifact(&self, key: &str) -> EngineResult<[u8; 32]> {
        let raw = self.storage.download_file(key.to_string()).await?;
        let decoded = self.wrap_download(raw, self.encryption_key.is_some(), false);

        let (mut hashed, finalized) = StreamHasher::new(decoded, Sha256::new());
        let mut sink = tokio::io::sink();
        tokio::io::copy(&mut hashed, &mut sink)
            .await
            .map_err(EngineError::storage_error)?;

        let (digest, _) = finalized.get().ok_or_else(|| {
            EngineError::IntegrityError("readback hash was not finalized".to_string())
        })?;

        Ok((*digest).into())
    }

    /// Downloads a part artifact into a destination directory.
    pub async fn download_data_part(
        &self,
        owner: &str,
        part: &PartRef,
        dest: PathBuf,
    ) -> EngineResult<()> {
        let key = self.part_key(owner, &part.database, &part.table, &part.name);
        let encrypted = self.encryption_key.is_some();

        let raw = self.storage.download_file(key).await?;
        let decoded = self.wrap_download(raw, encrypted, false);
        pack::unpack_tarball(decoded, dest).await
    }

    /// Verifies that a part's artifact is present and non-empty.
    pub async fn check_data_part(&self, owner: &str, part: &PartRef) -> EngineResult<bool> {
        let key = self.part_key(owner, &part.database, &part.table, &part.name);
        Ok(matches!(self.storage.object_size(key).await?, Some(size) if size > 0))
    }

    /// Deletes the artifacts owned by a backup for the given parts.
    pub async fn delete_data_parts(
        &self,
        backup: &BackupMetadata,
        parts: &[PartRef],
    ) -> EngineResult<()> {
        let keys: Vec<String> = parts
            .iter()
            .filter(|p| p.metadata.link.is_none())
            .map(|p| self.part_key(backup.name.as_str(), &p.database, &p.table, &p.name))
            .collect();

        if keys.is_empty() {
            return Ok(());
        }

        let outcomes = self.storage.delete_files(keys).await?;
        for outcome in outcomes {
            if let Err(e) = outcome.result {
                tracing::warn!("Failed to delete {}: {}", outcome.key, e);
            }
        }

        Ok(())
    }

    /// Deletes everything under a backup's prefix.
    pub async fn delete_backup(&self, name: &BackupName) -> EngineResult<()> {
        self.delete_prefix(self.backup_prefix(name)).await
    }

    /// Deletes everything under an arbitrary prefix.
    pub async fn delete_prefix(&self, prefix: String) -> EngineResult<()> {
        let entries = self.storage.list_prefix(prefix).await?;
        let keys: Vec<String> = entries.into_iter().map(|e| e.key).collect();

        if keys.is_empty() {
            return Ok(());
        }

        let outcomes = self.storage.delete_files(keys).await?;
        let mut first_error = None;
        for outcome in outcomes {
            if let Err(e) = outcome.result {
                tracing::warn!("Failed to delete {}: {}", outcome.key, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- tarball payloads (access control, cloud storage metadata) ----

    /// Uploads a directory subtree as a TAR artifact.
    pub async fn upload_files_tarball(
        &self,
        base_dir: PathBuf,
        files: Vec<String>,
        key: String,
        encryption: bool,
        compression: bool,
    ) -> EngineResult<()> {
        storage::with_retries(self.max_retries, || {
            let base_dir = base_dir.clone();
            let files = files.clone();
            let key = key.clone();
            async move {
                let (tar_stream, producer) = pack::tarball_stream(base_dir, files);
                let mut reader = self.wrap_upload_with_compression(
                    tar_stream,
                    encryption,
                    true,
                    compression,
                );

                let upload_result = self.storage.upload_file(key, &mut reader).await;

                match producer.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        return Err(EngineError::IntegrityError(format!(
                            "directory changed while packing: {}",
                            e
                        )));
                    }
                    Err(e) => {
                        return Err(EngineError::IntegrityError(format!(
                            "packing task panicked: {}",
                            e
                        )));
                    }
                }
                upload_result
            }
        })
        .await
    }

    /// Downloads a TAR artifact and unpacks it into a directory.
    pub async fn download_files_tarball(
        &self,
        key: String,
        dest: PathBuf,
        encryption: bool,
        compression: bool,
    ) -> EngineResult<()> {
        let raw = self.storage.download_file(key).await?;
        let mut decoded: Box<dyn AsyncRead + Unpin + Send> = if encryption {
            match &self.encryption_key {
                Some(k) => Box::new(DecryptingReader::new(raw, k.clone())),
                None => {
                    return Err(EngineError::ConfigError(
                        "artifact is encrypted but no key is configured".to_string(),
                    ))
                }
            }
        } else {
            raw
        };

        if compression {
            decoded = Box::new(Decompressor::new_unbuffered(decoded, CompressionType::Gzip));
        }

        pack::unpack_tarball(decoded, dest).await
    }

    // ---- codec chain ----

    fn wrap_upload<R>(
        &self,
        reader: R,
        encryption: bool,
        rate_limit: bool,
    ) -> Box<dyn AsyncRead + Unpin + Send>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.wrap_upload_with_compression(reader, encryption, rate_limit, false)
    }

    fn wrap_upload_with_compression<R>(
        &self,
        reader: R,
        encryption: bool,
        rate_limit: bool,
        compression: bool,
    ) -> Box<dyn AsyncRead + Unpin + Send>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut chain: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);

        if compression {
            chain = Box::new(Compressor::new(BufReader::new(chain), CompressionType::Gzip));
        }

        if encryption {
            if let Some(key) = &self.encryption_key {
                chain = Box::new(EncryptingReader::new(chain, key.clone()));
            }
        }

        if rate_limit && self.max_upload_rate > 0 {
            chain = Box::new(RateLimitedReader::new(chain, self.max_upload_rate));
        }

        chain
    }

    fn wrap_download<R>(
        &self,
        reader: R,
        encryption: bool,
        compression: bool,
    ) -> Box<dyn AsyncRead + Unpin + Send>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut chain: Box<dyn AsyncRead + Unpin + Send> = Box::new(reader);

        if encryption {
            if let Some(key) = &self.encryption_key {
                chain = Box::new(DecryptingReader::new(chain, key.clone()));
            }
        }

        if compression {
            chain = Box::new(Decompressor::new_unbuffered(chain, CompressionType::Gzip));
        }

        chain
    }
}

/// Synthesizes a failed-state stub for a document that cannot be parsed.
pub(crate) fn torn_document_stub(name: &BackupName) -> BackupMetadata {
    use crate::metadata::BackupSources;

    let mut stub = BackupMetadata::new(
        name.clone(),
        String::new(),
        String::new(),
        crate::config::DEFAULT_TIME_FORMAT.to_string(),
        Default::default(),
        false,
        BackupSources::all(),
    );
    stub.state = BackupState::Failed;
    stub.fail_reason = Some("document could not be parsed".to_string());
    stub
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration as ChronoDuration;

    use chbackup::checksum::Checksum;

    use crate::clickhouse::control::{list_dir_files, part_checksum};
    use crate::config::Config;
    use crate::metadata::{BackupSources, DatabaseMetadata, TableMetadata};

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    async fn test_layout(encrypted: bool, validate: bool) -> (tempfile::TempDir, BackupLayout) {
        let dir = tempfile::tempdir().unwrap();

        let mut config = format!(
            "[backup]\nvalidate-part-after-upload = {}\n\n[storage]\ntype = \"local\"\npath = \"{}\"\n",
            validate,
            dir.path().join("storage").display()
        );
        if encrypted {
            config.push_str(&format!(
                "\n[encryption]\ntype = \"aes-256-gcm\"\nis-enabled = true\nkey = \"{}\"\n",
                TEST_KEY
            ));
        }

        let config: Config = toml::from_str(&config).unwrap();
        let layout = BackupLayout::new(&config).await.unwrap();
        (dir, layout)
    }

    fn test_backup(name: &str) -> BackupMetadata {
        BackupMetadata::new(
            name.parse().unwrap(),
            "23.8.2.7".to_string(),
            "clickhouse01".to_string(),
            crate::config::DEFAULT_TIME_FORMAT.to_string(),
            Default::default(),
            false,
            BackupSources::all(),
        )
    }

    async fn test_frozen_part(dir: &std::path::Path) -> FrozenPart {
        let part_path = dir.join("0_1_1_0");
        std::fs::create_dir_all(&part_path).unwrap();
        std::fs::write(part_path.join("checksums.txt"), b"column digests").unwrap();
        std::fs::write(part_path.join("n.bin"), vec![42u8; 2048]).unwrap();

        let files = list_dir_files(&part_path).await.unwrap();
        let checksum = part_checksum(&part_path, &files).await.unwrap();

        FrozenPart {
            database: "db1".to_string(),
            table: "наблюдения".to_string(),
            name: "0_1_1_0".to_string(),
            disk_name: "default".to_string(),
            path: part_path,
            checksum,
            size: 2048 + 14,
            files,
        }
    }

    #[tokio::test]
    async fn test_data_round_trip_encrypted() {
        let (_dir, layout) = test_layout(true, false).await;

        layout
            .upload_data("prefix/doc".to_string(), b"payload".to_vec(), true)
            .await
            .unwrap();

        let data = layout
            .download_data("prefix/doc".to_string(), true)
            .await
            .unwrap();
        assert_eq!(b"payload".to_vec(), data);
    }

    #[tokio::test]
    async fn test_part_upload_and_restore() {
        let (dir, layout) = test_layout(true, true).await;
        let backup = test_backup("b1");
        let fpart = test_frozen_part(dir.path()).await;

        let metadata = layout.upload_data_part(&backup, &fpart).await.unwrap();
        assert_eq!(fpart.checksum, metadata.checksum);
        assert_eq!(fpart.size, metadata.raw_bytes);
        assert!(metadata.tarball);
        assert_eq!(None, metadata.link);

        let part_ref = PartRef {
            database: fpart.database.clone(),
            table: fpart.table.clone(),
            name: fpart.name.clone(),
            metadata,
        };
        assert!(layout.check_data_part("b1", &part_ref).await.unwrap());

        let dest = dir.path().join("detached");
        layout
            .download_data_part("b1", &part_ref, dest.clone())
            .await
            .unwrap();

        assert_eq!(
            b"column digests".to_vec(),
            std::fs::read(dest.join("checksums.txt")).unwrap()
        );
        assert_eq!(vec![42u8; 2048], std::fs::read(dest.join("n.bin")).unwrap());
    }

    #[tokio::test]
    async fn test_check_data_part_missing() {
        let (_dir, layout) = test_layout(false, false).await;

        let part_ref = PartRef {
            database: "db1".to_string(),
            table: "t1".to_string(),
            name: "0_1_1_0".to_string(),
            metadata: crate::metadata::PartMetadata {
                checksum: Checksum::sha256_from_bytes(b"x"),
                bytes: 1,
                raw_bytes: 1,
                files: vec![],
                link: None,
                tarball: true,
                disk_name: "default".to_string(),
                storage_class: crate::metadata::StorageClass::Local,
            },
        };

        assert!(!layout.check_data_part("b1", &part_ref).await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_listing_and_last_resolution() {
        let (_dir, layout) = test_layout(false, false).await;

        let mut oldest = test_backup("b0");
        oldest.start_time = oldest.start_time - ChronoDuration::hours(2);
        oldest.state = BackupState::Created;

        let mut failed = test_backup("b1");
        failed.start_time = failed.start_time - ChronoDuration::hours(1);
        failed.state = BackupState::Failed;

        let newest = test_backup("b2");

        for backup in [&oldest, &failed, &newest] {
            layout.upload_backup_metadata(backup).await.unwrap();
        }

        let listed = layout.get_backups().await.unwrap();
        assert_eq!(
            vec!["b2", "b1", "b0"],
            listed.iter().map(|b| b.name.as_str()).collect::<Vec<_>>()
        );

        // LAST skips the creating and failed backups
        let last = layout
            .resolve_target(&BackupTarget::Last)
            .await
            .unwrap();
        assert_eq!("b0", last.as_str());
    }

    #[tokio::test]
    async fn test_torn_document_surfaces_as_failed() {
        let (_dir, layout) = test_layout(false, false).await;

        let backup = test_backup("b1");
        layout.upload_backup_metadata(&backup).await.unwrap();

        // overwrite the light document with garbage
        layout
            .upload_data(
                layout.light_metadata_key(&backup.name),
                b"{torn".to_vec(),
                false,
            )
            .await
            .unwrap();

        let listed = layout.get_backups().await.unwrap();
        assert_eq!(1, listed.len());
        assert_eq!(BackupState::Failed, listed[0].state);
    }

    #[tokio::test]
    async fn test_delete_backup_prefix() {
        let (_dir, layout) = test_layout(false, false).await;

        let backup = test_backup("b1");
        layout.upload_backup_metadata(&backup).await.unwrap();
        layout
            .upload_data(
                layout.part_key("b1", "db1", "t1", "0_1_1_0"),
                b"artifact".to_vec(),
                false,
            )
            .await
            .unwrap();

        layout.delete_backup(&backup.name).await.unwrap();

        assert!(layout.get_backups().await.unwrap().is_empty());
        assert!(!layout
            .exists(layout.part_key("b1", "db1", "t1", "0_1_1_0"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unicode_names_in_keys() {
        let (_dir, layout) = test_layout(false, false).await;
        let backup = test_backup("b1");

        let mut backup = backup;
        backup.add_database(
            "база".to_string(),
            DatabaseMetadata::new(Some("Atomic".to_string()), None),
        );
        backup.add_table(
            "база",
            "таблица💾".to_string(),
            TableMetadata::new("MergeTree".to_string(), None),
        );

        let key = layout.table_sql_key(&backup.name, "база", "таблица💾");
        layout
            .upload_data(key.clone(), b"CREATE TABLE ...".to_vec(), false)
            .await
            .unwrap();

        assert!(layout.exists(key).await.unwrap());

        // the document itself survives the round trip with the names
        layout.upload_backup_metadata(&backup).await.unwrap();
        let reloaded = layout.get_backup(&backup.name, false).await.unwrap();
        assert!(reloaded.databases.contains_key("база"));
        assert!(reloaded.databases["база"].tables.contains_key("таблица💾"));
    }
}
