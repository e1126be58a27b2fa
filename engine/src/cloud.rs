//! Restore of parts on object-storage (S3-backed) disks.
//!
//! An object-storage part consists of small metadata index files on the
//! local disk, each listing the object keys holding the column data.
//! Restoring such a part means placing the index files into `detached/`
//! and making sure the referenced objects exist in the destination
//! disk's bucket:
//!
//! - **copy** mode copies every referenced object from the source
//!   bucket into the destination bucket, keeping relative keys, then
//!   writes the index files;
//! - **inplace** mode skips the object copy entirely. It is only taken
//!   when the source and destination bucket *and* prefix are identical;
//!   any difference falls back to copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aws_sdk_s3::Client;
use regex::Regex;
use tokio::sync::Semaphore;

use chbackup::name::BackupName;

use crate::clickhouse::Disk;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::layout::BackupLayout;
use crate::metadata::BackupMetadata;
use crate::storage::{build_client, S3StorageConfig};

/// A single object reference inside an index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub size: u64,
    pub key: String,
}

/// A parsed disk metadata index file.
///
/// Format (version 3):
///
/// ```text
/// 3
/// <count>\t<total size>
/// <size>\t<relative key>        (count lines)
/// <reference count>
/// <read-only flag>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub version: u32,
    pub objects: Vec<ObjectRef>,
    pub ref_count: u32,
    pub read_only: bool,
}

impl ObjectMetadata {
    pub fn parse(content: &str) -> EngineResult<Self> {
        let mut lines = content.lines();
        let malformed = |what: &str| {
            EngineError::IntegrityError(format!("malformed disk metadata file: {}", what))
        };

        let version: u32 = lines
            .next()
            .ok_or_else(|| malformed("missing version"))?
            .trim()
            .parse()
            .map_err(|_| malformed("bad version"))?;

        if !(1..=5).contains(&version) {
            return Err(malformed("unsupported version"));
        }

        let counts = lines.next().ok_or_else(|| malformed("missing counts"))?;
        let count: usize = counts
            .split('\t')
            .next()
            .ok_or_else(|| malformed("bad counts"))?
            .trim()
            .parse()
            .map_err(|_| malformed("bad object count"))?;

        let mut objects = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines.next().ok_or_else(|| malformed("missing object"))?;
            let (size, key) = line
                .split_once('\t')
                .ok_or_else(|| malformed("bad object line"))?;
            objects.push(ObjectRef {
                size: size.trim().parse().map_err(|_| malformed("bad object size"))?,
                key: key.trim().to_string(),
            });
        }

        let ref_count: u32 = lines
            .next()
            .unwrap_or("0")
            .trim()
            .parse()
            .map_err(|_| malformed("bad reference count"))?;

        let read_only = lines.next().map(|l| l.trim() == "1").unwrap_or(false);

        Ok(Self {
            version,
            objects,
            ref_count,
            read_only,
        })
    }

    pub fn serialize(&self) -> String {
        let total: u64 = self.objects.iter().map(|o| o.size).sum();
        let mut out = format!("{}\n{}\t{}\n", self.version, self.objects.len(), total);
        for object in &self.objects {
            out.push_str(&format!("{}\t{}\n", object.size, object.key));
        }
        out.push_str(&format!("{}\n", self.ref_count));
        out.push_str(if self.read_only { "1\n" } else { "0\n" });
        out
    }
}

/// Source-side parameters given on the command line.
#[derive(Debug, Clone)]
pub struct CloudRestoreParams {
    pub source_bucket: String,
    pub source_path: String,
    pub source_endpoint: Option<String>,

    /// Use the bucket's current state instead of the recorded revision.
    pub latest: bool,

    /// Request inplace mode; honored only when source and destination
    /// coincide exactly.
    pub inplace: bool,
}

/// Executes the object-copy plan for object-storage parts.
pub struct CloudStorageRestorer {
    source: Client,
    source_bucket: String,
    source_prefix: String,
    destination: Client,
    dest_bucket: String,
    dest_prefix: String,
    inplace: bool,
    workers: usize,
}

const DISK_SECTION_REGEX_TEMPLATE: &str =
    r"(?s)<{disk}>.*?<endpoint>(?P<endpoint>[^<]+)</endpoint>.*?</{disk}>";

impl CloudStorageRestorer {
    /// Builds the restorer for a destination disk.
    ///
    /// The destination bucket and prefix are read from the disk's
    /// endpoint in the server's rendered configuration.
    pub async fn new(
        config: &Config,
        params: &CloudRestoreParams,
        disk: &Disk,
    ) -> EngineResult<Self> {
        let endpoint = disk_endpoint_from_config(
            &config.clickhouse.preprocessed_config_path,
            &disk.name,
        )?;
        let (dest_bucket, dest_prefix, dest_endpoint) = split_endpoint(&endpoint)?;

        let inplace = params.inplace
            && params.source_bucket == dest_bucket
            && normalize_prefix(&params.source_path) == dest_prefix;

        if params.inplace && !inplace {
            tracing::warn!(
                "Inplace restore requested but source and destination differ; falling back to copy"
            );
        }

        let source = build_client(&S3StorageConfig {
            region: "us-east-1".to_string(),
            bucket: params.source_bucket.clone(),
            endpoint: params.source_endpoint.clone(),
            credentials: None,
        })
        .await;

        let destination = build_client(&S3StorageConfig {
            region: "us-east-1".to_string(),
            bucket: dest_bucket.clone(),
            endpoint: Some(dest_endpoint),
            credentials: None,
        })
        .await;

        Ok(Self {
            source,
            source_bucket: params.source_bucket.clone(),
            source_prefix: normalize_prefix(&params.source_path),
            destination,
            dest_bucket,
            dest_prefix,
            inplace,
            workers: config.multiprocessing.cloud_storage_restore_workers.max(1),
        })
    }

    pub fn is_inplace(&self) -> bool {
        self.inplace
    }

    /// Walks the unpacked index files of a part and ensures all
    /// referenced objects exist at the destination.
    pub async fn materialize_part(&self, part_dir: &Path) -> EngineResult<()> {
        let files = crate::clickhouse::control::list_dir_files(part_dir).await?;
        let mut keys = Vec::new();
        for file in &files {
            let content = tokio::fs::read_to_string(part_dir.join(file)).await?;
            let metadata = ObjectMetadata::parse(&content)?;
            keys.extend(metadata.objects.into_iter().map(|o| o.key));
        }

        if self.inplace {
            // nothing is copied; a referenced object missing from the
            // shared bucket must fail the part now, not at SELECT time
            for key in &keys {
                if !self.source_object_exists(key).await? {
                    return Err(EngineError::IntegrityError(format!(
                        "object {} referenced by the part is missing from the source bucket",
                        key
                    )));
                }
            }
            return Ok(());
        }

        self.copy_objects(keys).await
    }

    /// Copies objects from the source bucket into the destination
    /// bucket with a bounded worker pool.
    async fn copy_objects(&self, keys: Vec<String>) -> EngineResult<()> {
        let limit = Arc::new(Semaphore::new(self.workers));

        let futures: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let limit = limit.clone();
                let destination = self.destination.clone();
                let copy_source = format!(
                    "{}/{}{}",
                    self.source_bucket, self.source_prefix, key
                );
                let dest_bucket = self.dest_bucket.clone();
                let dest_key = format!("{}{}", self.dest_prefix, key);

                async move {
                    let _permit = limit.acquire().await.expect("copy semaphore closed");

                    destination
                        .copy_object()
                        .copy_source(&copy_source)
                        .bucket(&dest_bucket)
                        .key(&dest_key)
                        .send()
                        .await
                        .map_err(EngineError::storage_error)?;

                    Ok::<_, EngineError>(())
                }
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        for result in results {
            result?;
        }

        Ok(())
    }

    /// Returns whether the source side can see an object, for presence
    /// checks before attaching.
    pub async fn source_object_exists(&self, key: &str) -> EngineResult<bool> {
        let full_key = format!("{}{}", self.source_prefix, key);
        let res = self
            .source
            .head_object()
            .bucket(&self.source_bucket)
            .key(full_key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(EngineError::storage_error(service_error))
                }
            }
        }
    }
}

/// Downloads and unpacks the disk metadata tarballs of one disk into a
/// local directory. Backs the `get-cloud-storage-metadata` command.
pub async fn fetch_disk_metadata(
    layout: &BackupLayout,
    backup: &BackupMetadata,
    disk: &str,
    local_path: &Path,
) -> EngineResult<Vec<String>> {
    let prefix = format!(
        "{}cloud_storage/{}/",
        layout.backup_prefix(&backup.name),
        chbackup::util::escape_for_key(disk)
    );

    let mut fetched = Vec::new();
    for (db, db_meta) in &backup.databases {
        for table in db_meta.tables.keys() {
            let key = layout.cloud_storage_key(&backup.name, disk, db, table);
            if !layout.exists(key.clone()).await? {
                continue;
            }

            layout
                .download_files_tarball(
                    key.clone(),
                    local_path.to_path_buf(),
                    backup.cloud_storage.encryption,
                    backup.cloud_storage.compression,
                )
                .await?;
            fetched.push(key);
        }
    }

    if fetched.is_empty() {
        tracing::info!("No cloud storage metadata under {}", prefix);
    }

    Ok(fetched)
}

/// Extracts a disk's endpoint URL from the rendered server config.
fn disk_endpoint_from_config(config_path: &Path, disk: &str) -> EngineResult<String> {
    let content = std::fs::read_to_string(config_path).map_err(|e| {
        EngineError::ConfigError(format!(
            "cannot read server configuration {}: {}",
            config_path.display(),
            e
        ))
    })?;

    let pattern = DISK_SECTION_REGEX_TEMPLATE.replace("{disk}", &regex::escape(disk));
    let regex = Regex::new(&pattern)
        .map_err(|e| EngineError::ConfigError(format!("bad disk name pattern: {}", e)))?;

    regex
        .captures(&content)
        .map(|c| c["endpoint"].trim().to_string())
        .ok_or_else(|| {
            EngineError::ConfigError(format!(
                "disk \"{}\" has no endpoint in {}",
                disk,
                config_path.display()
            ))
        })
}

/// Splits a path-style disk endpoint URL into (bucket, prefix, base URL).
fn split_endpoint(endpoint: &str) -> EngineResult<(String, String, String)> {
    let malformed =
        || EngineError::ConfigError(format!("malformed disk endpoint \"{}\"", endpoint));

    let (scheme, rest) = endpoint.split_once("://").ok_or_else(malformed)?;
    let mut segments = rest.splitn(3, '/');
    let host = segments.next().ok_or_else(malformed)?;
    let bucket = segments.next().ok_or_else(malformed)?.to_string();
    let prefix = normalize_prefix(segments.next().unwrap_or(""));

    if bucket.is_empty() {
        return Err(malformed());
    }

    Ok((bucket, prefix, format!("{}://{}", scheme, host)))
}

/// Normalizes a key prefix: no leading slash, one trailing slash unless
/// empty.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "3\n2\t150\n100\tr0000001-data.bin\n50\tr0000002-data.mrk\n0\n0\n";

    #[test]
    fn test_metadata_round_trip() {
        let parsed = ObjectMetadata::parse(SAMPLE).unwrap();
        assert_eq!(3, parsed.version);
        assert_eq!(2, parsed.objects.len());
        assert_eq!("r0000001-data.bin", parsed.objects[0].key);
        assert_eq!(100, parsed.objects[0].size);
        assert!(!parsed.read_only);

        assert_eq!(SAMPLE, parsed.serialize());
    }

    #[test]
    fn test_metadata_rejects_garbage() {
        ObjectMetadata::parse("").unwrap_err();
        ObjectMetadata::parse("99\n0\t0\n0\n0\n").unwrap_err();
        ObjectMetadata::parse("3\n1\t10\n").unwrap_err();
    }

    #[test]
    fn test_split_endpoint() {
        let (bucket, prefix, base) =
            split_endpoint("https://storage.example.net/data-bucket/cluster1/shard1/").unwrap();
        assert_eq!("data-bucket", bucket);
        assert_eq!("cluster1/shard1/", prefix);
        assert_eq!("https://storage.example.net", base);

        let (bucket, prefix, _) = split_endpoint("http://minio:9000/backups").unwrap();
        assert_eq!("backups", bucket);
        assert_eq!("", prefix);

        split_endpoint("no-scheme/bucket").unwrap_err();
    }

    #[test]
    fn test_disk_endpoint_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.xml");
        std::fs::write(
            &path,
            r#"<clickhouse>
  <storage_configuration>
    <disks>
      <object_storage>
        <type>s3</type>
        <endpoint>https://storage.example.net/data-bucket/cluster1/</endpoint>
      </object_storage>
    </disks>
  </storage_configuration>
</clickhouse>"#,
        )
        .unwrap();

        assert_eq!(
            "https://storage.example.net/data-bucket/cluster1/",
            disk_endpoint_from_config(&path, "object_storage").unwrap()
        );
        disk_endpoint_from_config(&path, "missing_disk").unwrap_err();
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!("", normalize_prefix(""));
        assert_eq!("", normalize_prefix("/"));
        assert_eq!("a/b/", normalize_prefix("/a/b"));
        assert_eq!("a/b/", normalize_prefix("a/b/"));
    }
}
