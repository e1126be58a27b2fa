//! Local file storage.
//!
//! Keys map directly onto a directory tree. This backend exists for
//! testing and for staging backups onto mounted network storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead};

use super::{DeleteOutcome, ObjectEntry, StorageBackend};
use crate::error::{EngineError, EngineResult};

#[derive(Debug)]
pub struct LocalBackend {
    config: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// The directory to store all objects under.
    pub path: PathBuf,
}

impl LocalBackend {
    pub async fn new(config: LocalStorageConfig) -> EngineResult<Self> {
        fs::create_dir_all(&config.path).await.map_err(|e| {
            EngineError::StorageError(anyhow::anyhow!(
                "Failed to create storage directory {}: {}",
                config.path.display(),
                e
            ))
        })?;

        Ok(Self { config })
    }

    fn get_path(&self, key: &str) -> PathBuf {
        self.config.path.join(key)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn upload_file(
        &self,
        key: String,
        mut stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> EngineResult<()> {
        let path = self.get_path(&key);
        let parent = path.parent().ok_or_else(|| {
            EngineError::StorageError(anyhow::anyhow!("Key \"{}\" has no parent directory", key))
        })?;
        fs::create_dir_all(parent).await.map_err(|e| {
            EngineError::StorageError(anyhow::anyhow!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        let mut file = File::create(&path)
            .await
            .map_err(EngineError::storage_error)?;
        io::copy(&mut stream, &mut file)
            .await
            .map_err(EngineError::storage_error)?;

        Ok(())
    }

    async fn download_file(&self, key: String) -> EngineResult<Box<dyn AsyncRead + Unpin + Send>> {
        let file = File::open(self.get_path(&key))
            .await
            .map_err(EngineError::storage_error)?;

        Ok(Box::new(file))
    }

    async fn list_prefix(&self, prefix: String) -> EngineResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();

        // A prefix is not necessarily a directory boundary.
        let start: &Path = prefix.rsplit_once('/').map(|(dir, _)| Path::new(dir)).unwrap_or(Path::new(""));
        let root = self.config.path.join(start);
        if !fs::try_exists(&root).await.map_err(EngineError::storage_error)? {
            return Ok(entries);
        }

        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            let mut dir = fs::read_dir(&current)
                .await
                .map_err(EngineError::storage_error)?;
            while let Some(entry) = dir.next_entry().await.map_err(EngineError::storage_error)? {
                let path = entry.path();
                if entry
                    .file_type()
                    .await
                    .map_err(EngineError::storage_error)?
                    .is_dir()
                {
                    stack.push(path);
                } else {
                    let key = path
                        .strip_prefix(&self.config.path)
                        .expect("entry must be under the storage root")
                        .to_string_lossy()
                        .into_owned();

                    if key.starts_with(&prefix) {
                        let size = entry
                            .metadata()
                            .await
                            .map_err(EngineError::storage_error)?
                            .len();
                        entries.push(ObjectEntry { key, size });
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete_files(&self, keys: Vec<String>) -> EngineResult<Vec<DeleteOutcome>> {
        let mut outcomes = Vec::with_capacity(keys.len());

        for key in keys {
            let result = match fs::remove_file(self.get_path(&key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(EngineError::storage_error(e)),
            };
            outcomes.push(DeleteOutcome { key, result });
        }

        Ok(outcomes)
    }

    async fn exists(&self, key: String) -> EngineResult<bool> {
        fs::try_exists(self.get_path(&key))
            .await
            .map_err(EngineError::storage_error)
    }

    async fn object_size(&self, key: String) -> EngineResult<Option<u64>> {
        match fs::metadata(self.get_path(&key)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::storage_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::block_on;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = block_on(LocalBackend::new(LocalStorageConfig {
            path: dir.path().to_path_buf(),
        }))
        .unwrap();
        (dir, backend)
    }

    #[test]
    fn test_round_trip() {
        let (_dir, backend) = backend();

        block_on(backend.upload_file("a/b/object".to_string(), &mut b"payload".as_slice()))
            .unwrap();

        assert!(block_on(backend.exists("a/b/object".to_string())).unwrap());
        assert_eq!(
            Some(7),
            block_on(backend.object_size("a/b/object".to_string())).unwrap()
        );

        let mut reader = block_on(backend.download_file("a/b/object".to_string())).unwrap();
        let mut out = Vec::new();
        block_on(tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)).unwrap();
        assert_eq!(b"payload", out.as_slice());
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, backend) = backend();

        for key in ["b1/meta.json", "b1/data/p1.tar", "b2/meta.json"] {
            block_on(backend.upload_file(key.to_string(), &mut b"x".as_slice())).unwrap();
        }

        let listed = block_on(backend.list_prefix("b1/".to_string())).unwrap();
        assert_eq!(
            vec!["b1/data/p1.tar", "b1/meta.json"],
            listed.iter().map(|e| e.key.as_str()).collect::<Vec<_>>()
        );

        let outcomes = block_on(backend.delete_files(vec![
            "b1/meta.json".to_string(),
            "missing".to_string(),
        ]))
        .unwrap();
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(!block_on(backend.exists("b1/meta.json".to_string())).unwrap());
    }
}
