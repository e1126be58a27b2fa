//! Object storage.

mod local;
mod s3;

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncRead;

use crate::config::{StorageBackendConfig, StorageConfig};
use crate::error::{EngineError, EngineResult};

pub(crate) use self::local::LocalBackend;
pub(crate) use self::s3::S3Backend;

pub use self::local::LocalStorageConfig;
pub use self::s3::{build_client, S3CredentialsConfig, S3StorageConfig};

/// A key/size pair returned by listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// Per-key outcome of a batch deletion.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub key: String,
    pub result: EngineResult<()>,
}

/// A storage backend.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Uploads a byte stream under a key.
    async fn upload_file(
        &self,
        key: String,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> EngineResult<()>;

    /// Opens a byte stream for a key.
    async fn download_file(&self, key: String) -> EngineResult<Box<dyn AsyncRead + Unpin + Send>>;

    /// Lists keys under a prefix.
    ///
    /// Pagination is handled internally; the full listing is returned in
    /// key order.
    async fn list_prefix(&self, prefix: String) -> EngineResult<Vec<ObjectEntry>>;

    /// Deletes a batch of keys, reporting per-key outcomes.
    async fn delete_files(&self, keys: Vec<String>) -> EngineResult<Vec<DeleteOutcome>>;

    /// Returns whether a key exists.
    async fn exists(&self, key: String) -> EngineResult<bool>;

    /// Returns the size of an object, or None if it does not exist.
    async fn object_size(&self, key: String) -> EngineResult<Option<u64>>;
}

/// Creates the configured backend.
pub async fn from_config(config: &StorageConfig) -> EngineResult<Box<dyn StorageBackend>> {
    match &config.backend {
        StorageBackendConfig::Local(local) => Ok(Box::new(LocalBackend::new(local.clone()).await?)),
        StorageBackendConfig::S3(s3) => Ok(Box::new(
            S3Backend::new(s3.clone(), config.chunk_size).await?,
        )),
    }
}

/// Classification of storage errors for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Retries a transient-failing storage operation with exponential
/// backoff and jitter.
pub async fn with_retries<T, F, Fut>(max_retries: u32, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_retries || classify(&e) == ErrorClass::Permanent {
                    return Err(e);
                }

                let backoff = backoff_with_jitter(attempt);
                tracing::warn!(
                    "Transient storage error (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    max_retries,
                    backoff,
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

fn classify(error: &EngineError) -> ErrorClass {
    match error {
        EngineError::StorageError(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::anyhow;
    use tokio_test::block_on;

    #[test]
    fn test_with_retries_recovers() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<u32> = block_on(with_retries(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::StorageError(anyhow!("connection reset")))
                } else {
                    Ok(42)
                }
            }
        }));

        assert_eq!(42, result.unwrap());
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_with_retries_gives_up() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<u32> = block_on(with_retries(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::StorageError(anyhow!("still down"))) }
        }));

        result.unwrap_err();
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<u32> = block_on(with_retries(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::BackupNotFound("b1".to_string())) }
        }));

        result.unwrap_err();
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
