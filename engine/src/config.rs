//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;

use crate::storage::{LocalStorageConfig, S3StorageConfig};

/// Timestamp format used in backup documents.
///
/// Recorded inside every document so that readers parse timestamps with
/// the format the writer used.
pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Configuration of the backup tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Backup behavior.
    #[serde(default = "Default::default")]
    pub backup: BackupConfig,

    /// Restore behavior.
    #[serde(default = "Default::default")]
    pub restore: RestoreConfig,

    /// Object storage.
    pub storage: StorageConfig,

    /// Encryption of data artifacts.
    #[serde(default = "Default::default")]
    pub encryption: EncryptionConfig,

    /// Handling of object-storage (S3-backed) disks.
    #[serde(rename = "cloud-storage")]
    #[serde(default = "Default::default")]
    pub cloud_storage: CloudStorageConfig,

    /// Upload rate limiting.
    #[serde(rename = "rate-limiter")]
    #[serde(default = "Default::default")]
    pub rate_limiter: RateLimiterConfig,

    /// Worker pool sizes.
    #[serde(default = "Default::default")]
    pub multiprocessing: MultiprocessingConfig,

    /// Locks.
    #[serde(default = "Default::default")]
    pub lock: LockConfig,

    /// ClickHouse server connection and paths.
    #[serde(default = "Default::default")]
    pub clickhouse: ClickhouseConfig,
}

/// Backup behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Root prefix for all backup data in object storage.
    #[serde(rename = "path-root")]
    #[serde(default = "default_path_root")]
    pub path_root: String,

    /// Databases that are never backed up.
    #[serde(rename = "exclude-dbs")]
    #[serde(default = "default_exclude_dbs")]
    pub exclude_dbs: Vec<String>,

    /// Whether parts of prior backups are reused instead of re-uploaded.
    #[serde(rename = "deduplicate-parts")]
    #[serde(default = "default_true")]
    pub deduplicate_parts: bool,

    /// The maximum age of a prior backup that may contribute dedup entries.
    #[serde(rename = "deduplication-age-limit")]
    #[serde(with = "humantime_serde", default = "default_deduplication_age_limit")]
    pub deduplication_age_limit: Duration,

    /// How many catalog entries are paged at a time while building the
    /// dedup index.
    #[serde(rename = "deduplication-batch-size")]
    #[serde(default = "default_deduplication_batch_size")]
    pub deduplication_batch_size: usize,

    /// Retain policy for the purge command that sets the maximum age of
    /// backups to keep.
    #[serde(rename = "retain-time")]
    #[serde(with = "humantime_serde", default)]
    pub retain_time: Option<Duration>,

    /// Retain policy for the purge command that sets the number of created
    /// backups to keep.
    #[serde(rename = "retain-count")]
    #[serde(default)]
    pub retain_count: Option<usize>,

    /// Minimal interval between two backups.
    ///
    /// A backup command issued within the interval of the most recent
    /// non-failed backup is a no-op unless forced.
    #[serde(rename = "min-interval")]
    #[serde(with = "humantime_serde", default)]
    pub min_interval: Option<Duration>,

    /// User labels merged into every backup document.
    #[serde(default = "HashMap::new")]
    pub labels: HashMap<String, String>,

    /// Whether uploaded parts are read back and checksum-verified.
    #[serde(rename = "validate-part-after-upload")]
    #[serde(default = "default_false")]
    pub validate_part_after_upload: bool,

    /// Replica name written into restored Replicated engines.
    #[serde(rename = "override-replica-name")]
    #[serde(default = "default_override_replica_name")]
    pub override_replica_name: Option<String>,

    /// Whether Replicated engines are downgraded on restore.
    #[serde(rename = "force-non-replicated")]
    #[serde(default = "default_false")]
    pub force_non_replicated: bool,

    /// Whether a part that fails to attach aborts the restore.
    #[serde(rename = "restore-fail-on-attach-error")]
    #[serde(default = "default_false")]
    pub restore_fail_on_attach_error: bool,

    /// How many times a shadow directory left over from an unrelated
    /// FREEZE with the same name is retried.
    #[serde(rename = "retry-on-existing-dir")]
    #[serde(default = "default_retry_on_existing_dir")]
    pub retry_on_existing_dir: u32,

    /// Skip the distributed lock for schema-only operations.
    #[serde(rename = "skip-lock-for-schema-only")]
    #[serde(default = "Default::default")]
    pub skip_lock_for_schema_only: SkipLockConfig,

    /// How many disk operations may pass between restore context flushes.
    #[serde(rename = "restore-context-sync-on-disk-operation-threshold")]
    #[serde(default = "default_restore_context_sync_threshold")]
    pub restore_context_sync_on_disk_operation_threshold: usize,

    /// Where the resumable restore state is kept on the destination.
    #[serde(rename = "restore-context-path")]
    #[serde(default = "default_restore_context_path")]
    pub restore_context_path: PathBuf,

    /// Whether the shadow directory is kept when a backup fails.
    #[serde(rename = "keep-frozen-data-on-failure")]
    #[serde(default = "default_true")]
    pub keep_frozen_data_on_failure: bool,

    /// Timestamp format recorded in backup documents.
    #[serde(rename = "time-format")]
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

/// Restore behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RestoreConfig {
    /// Attach object-storage parts without copying objects when source and
    /// destination buckets are identical.
    #[serde(rename = "use-inplace-cloud-restore")]
    #[serde(default = "default_false")]
    pub use_inplace_cloud_restore: bool,
}

/// Skip-lock policy for schema-only operations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkipLockConfig {
    /// Skip the distributed lock for schema-only backups.
    #[serde(default = "default_false")]
    pub backup: bool,

    /// Skip the distributed lock for schema-only restores.
    #[serde(default = "default_false")]
    pub restore: bool,
}

/// Object storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// The storage backend.
    #[serde(flatten)]
    pub backend: StorageBackendConfig,

    /// Chunk size for multipart uploads, in bytes.
    ///
    /// Uploads below this size are a single PUT. The S3 API enforces its
    /// own lower bound of 5 MiB per part.
    #[serde(rename = "chunk-size")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How long a rate-limited multipart part may stall before it is
    /// retried, in seconds.
    #[serde(rename = "uploading-traffic-limit-retry-time")]
    #[serde(default = "default_traffic_limit_retry_time")]
    pub uploading_traffic_limit_retry_time: u64,

    /// Retry budget for transient storage errors.
    #[serde(rename = "max-retries")]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StorageBackendConfig {
    /// Local directory storage. Intended for testing.
    #[serde(rename = "local")]
    Local(LocalStorageConfig),

    /// S3-compatible object storage.
    #[serde(rename = "s3")]
    S3(S3StorageConfig),
}

/// Encryption configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Cipher applied to data artifacts.
    #[serde(rename = "type")]
    #[serde(default = "Default::default")]
    pub r#type: EncryptionType,

    /// Whether artifacts are enciphered at all.
    #[serde(rename = "is-enabled")]
    #[serde(default = "default_false")]
    pub is_enabled: bool,

    /// Hex-encoded 256-bit key.
    #[serde(default)]
    pub key: Option<String>,
}

/// Cipher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum EncryptionType {
    /// No encryption.
    #[serde(rename = "none")]
    None,

    /// AES-256-GCM in chunked envelopes.
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

/// Object-storage disk handling.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudStorageConfig {
    /// Whether disk metadata tarballs are compressed.
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Whether disk metadata tarballs are enciphered.
    #[serde(default = "default_true")]
    pub encryption: bool,
}

/// Upload rate limiting.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum upload rate in bytes per second. Zero means unlimited.
    #[serde(rename = "max-upload-rate")]
    #[serde(default = "default_zero")]
    pub max_upload_rate: u64,
}

/// Worker pool sizes.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiprocessingConfig {
    /// Workers issuing FREEZE statements.
    #[serde(rename = "freeze-threads")]
    #[serde(default = "default_freeze_threads")]
    pub freeze_threads: usize,

    /// Workers packing and uploading parts.
    #[serde(rename = "upload-threads")]
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,

    /// Workers copying object-storage parts during restore.
    #[serde(rename = "cloud-storage-restore-workers")]
    #[serde(default = "default_cloud_storage_restore_workers")]
    pub cloud_storage_restore_workers: usize,
}

/// Lock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Whether the local file lock is taken.
    #[serde(default = "default_false")]
    pub flock: bool,

    /// Whether the distributed lock is taken.
    #[serde(rename = "zk-flock")]
    #[serde(default = "default_false")]
    pub zk_flock: bool,

    /// Path of the local lock file.
    #[serde(rename = "flock-path")]
    #[serde(default = "default_flock_path")]
    pub flock_path: PathBuf,

    /// Coordination node under which the distributed lock lives.
    #[serde(rename = "zk-flock-path")]
    #[serde(default = "default_zk_flock_path")]
    pub zk_flock_path: String,

    /// How long lock acquisition may take before the command aborts.
    #[serde(rename = "lock-timeout")]
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub lock_timeout: Duration,
}

/// ClickHouse server connection and filesystem paths.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickhouseConfig {
    /// HTTP(S) endpoint of the server.
    #[serde(default = "default_clickhouse_endpoint")]
    pub endpoint: String,

    /// User for the HTTP interface.
    #[serde(default)]
    pub user: Option<String>,

    /// Password for the HTTP interface.
    #[serde(default)]
    pub password: Option<String>,

    /// Root of the server's data directory.
    #[serde(rename = "data-path")]
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Directory holding database and table metadata SQL files.
    #[serde(rename = "metadata-path")]
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,

    /// Directory holding the local access storage.
    #[serde(rename = "access-control-path")]
    #[serde(default = "default_access_control_path")]
    pub access_control_path: PathBuf,

    /// Directory holding named collection SQL files.
    #[serde(rename = "named-collections-path")]
    #[serde(default = "default_named_collections_path")]
    pub named_collections_path: PathBuf,

    /// The server's fully rendered configuration file.
    ///
    /// Object-storage disk endpoints are read from here during restore.
    #[serde(rename = "preprocessed-config-path")]
    #[serde(default = "default_preprocessed_config_path")]
    pub preprocessed_config_path: PathBuf,

    /// Timeout for ordinary queries.
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    pub timeout: Duration,

    /// Timeout for FREEZE statements.
    #[serde(rename = "freeze-timeout")]
    #[serde(with = "humantime_serde", default = "default_freeze_timeout")]
    pub freeze_timeout: Duration,
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!("Using configurations: {:?}", path);

        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        // mirrors the serde defaults for programmatic construction
        toml::from_str("").expect("default backup config must deserialize")
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            use_inplace_cloud_restore: false,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            r#type: EncryptionType::None,
            is_enabled: false,
            key: None,
        }
    }
}

impl Default for CloudStorageConfig {
    fn default() -> Self {
        Self {
            compression: true,
            encryption: true,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { max_upload_rate: 0 }
    }
}

impl Default for MultiprocessingConfig {
    fn default() -> Self {
        Self {
            freeze_threads: default_freeze_threads(),
            upload_threads: default_upload_threads(),
            cloud_storage_restore_workers: default_cloud_storage_restore_workers(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            flock: false,
            zk_flock: false,
            flock_path: default_flock_path(),
            zk_flock_path: default_zk_flock_path(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_clickhouse_endpoint(),
            user: None,
            password: None,
            data_path: default_data_path(),
            metadata_path: default_metadata_path(),
            access_control_path: default_access_control_path(),
            named_collections_path: default_named_collections_path(),
            preprocessed_config_path: default_preprocessed_config_path(),
            timeout: default_query_timeout(),
            freeze_timeout: default_freeze_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_zero() -> u64 {
    0
}

fn default_path_root() -> String {
    "ch_backup".to_string()
}

fn default_exclude_dbs() -> Vec<String> {
    vec![
        "system".to_string(),
        "information_schema".to_string(),
        "INFORMATION_SCHEMA".to_string(),
        "_temporary_and_external_tables".to_string(),
    ]
}

fn default_deduplication_age_limit() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_deduplication_batch_size() -> usize {
    500
}

fn default_override_replica_name() -> Option<String> {
    Some("{replica}".to_string())
}

fn default_retry_on_existing_dir() -> u32 {
    0
}

fn default_restore_context_sync_threshold() -> usize {
    100
}

fn default_restore_context_path() -> PathBuf {
    PathBuf::from("/tmp/chbackup_restore_state.json")
}

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

fn default_chunk_size() -> usize {
    5 * 1024 * 1024
}

fn default_traffic_limit_retry_time() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    5
}

fn default_freeze_threads() -> usize {
    4
}

fn default_upload_threads() -> usize {
    4
}

fn default_cloud_storage_restore_workers() -> usize {
    4
}

fn default_flock_path() -> PathBuf {
    PathBuf::from("/run/lock/chbackup.lock")
}

fn default_zk_flock_path() -> String {
    "/chbackup/lock".to_string()
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_clickhouse_endpoint() -> String {
    "http://localhost:8123".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse")
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse/metadata")
}

fn default_access_control_path() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse/access")
}

fn default_named_collections_path() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse/named_collections")
}

fn default_preprocessed_config_path() -> PathBuf {
    PathBuf::from("/var/lib/clickhouse/preprocessed_configs/config.xml")
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_freeze_timeout() -> Duration {
    Duration::from_secs(45 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            type = "local"
            path = "/tmp/chbackup-storage"
            "#,
        )
        .unwrap();

        assert!(config.backup.deduplicate_parts);
        assert_eq!(
            Duration::from_secs(7 * 24 * 3600),
            config.backup.deduplication_age_limit
        );
        assert_eq!(None, config.backup.retain_count);
        assert_eq!(5 * 1024 * 1024, config.storage.chunk_size);
        assert!(!config.encryption.is_enabled);
        assert_eq!(0, config.rate_limiter.max_upload_rate);
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [backup]
            deduplicate-parts = true
            deduplication-age-limit = "7days"
            deduplication-batch-size = 200
            retain-time = "1day"
            retain-count = 2
            min-interval = "30m"
            validate-part-after-upload = true

            [backup.labels]
            env = "test"

            [backup.skip-lock-for-schema-only]
            backup = true

            [restore]
            use-inplace-cloud-restore = true

            [storage]
            type = "s3"
            region = "us-east-1"
            bucket = "backups"
            endpoint = "http://localhost:9000"
            chunk-size = 8388608

            [encryption]
            type = "aes-256-gcm"
            is-enabled = true
            key = "0000000000000000000000000000000000000000000000000000000000000000"

            [rate-limiter]
            max-upload-rate = 1048576

            [multiprocessing]
            freeze-threads = 2
            upload-threads = 8

            [lock]
            flock = true
            zk-flock = true
            flock-path = "/run/lock/test.lock"
            "#,
        )
        .unwrap();

        assert_eq!(Some(Duration::from_secs(86400)), config.backup.retain_time);
        assert_eq!(Some(2), config.backup.retain_count);
        assert_eq!(Some("test"), config.backup.labels.get("env").map(|s| s.as_str()));
        assert!(config.backup.skip_lock_for_schema_only.backup);
        assert!(!config.backup.skip_lock_for_schema_only.restore);
        assert!(config.restore.use_inplace_cloud_restore);
        assert_eq!(EncryptionType::Aes256Gcm, config.encryption.r#type);
        assert_eq!(1048576, config.rate_limiter.max_upload_rate);
        assert_eq!(8, config.multiprocessing.upload_threads);
        assert!(config.lock.zk_flock);
    }
}
