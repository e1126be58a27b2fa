//! Operation locks.
//!
//! Two independent resources guard mutating operations: a local file
//! lock and a distributed lock in the coordination service. They are
//! acquired in fixed order (file first) and released in reverse order
//! on every exit path.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{flock, FlockArg};
use tokio::time::{sleep, Instant};

use crate::config::LockConfig;
use crate::coordination::Coordinator;
use crate::error::{EngineError, EngineResult};

/// Poll interval for non-blocking acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Acquires operation locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    config: LockConfig,
    coordinator: Option<Arc<dyn Coordinator>>,
    hostname: String,
}

/// Held locks of one operation.
///
/// Dropping the guard releases the distributed lock first, then the
/// file lock (reverse acquisition order; fields drop in declaration
/// order).
pub struct OperationLock {
    _distributed: Option<DistributedLockGuard>,
    _file: Option<std::fs::File>,
}

impl std::fmt::Debug for OperationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLock").finish()
    }
}

/// A held distributed lock.
///
/// The coordination node is removed when the guard drops. Drop cannot
/// await, so the unlock call is handed to the runtime; a failed release
/// leaves the node to expire with the coordination session.
struct DistributedLockGuard {
    coordinator: Arc<dyn Coordinator>,
    path: String,
    holder: String,
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        let coordinator = self.coordinator.clone();
        let path = std::mem::take(&mut self.path);
        let holder = std::mem::take(&mut self.holder);

        tokio::task::spawn(async move {
            if let Err(e) = coordinator.unlock(&path, &holder).await {
                tracing::warn!("Failed to release distributed lock: {}", e);
            }
        });
    }
}

impl LockManager {
    pub fn new(
        config: LockConfig,
        coordinator: Option<Arc<dyn Coordinator>>,
        hostname: String,
    ) -> Self {
        Self {
            config,
            coordinator,
            hostname,
        }
    }

    /// Acquires the locks required for an operation.
    ///
    /// `distributed` is false for operations that bypass the distributed
    /// lock (restore, schema-only under the skip-lock policy).
    pub async fn acquire(&self, operation: &str, distributed: bool) -> EngineResult<OperationLock> {
        tracing::debug!("Entering lock for {}", operation);

        let file = if self.config.flock {
            Some(self.acquire_file_lock().await?)
        } else {
            None
        };

        let dist = if distributed && self.config.zk_flock {
            Some(self.acquire_distributed_lock(operation).await?)
        } else {
            None
        };

        Ok(OperationLock {
            _distributed: dist,
            _file: file,
        })
    }

    async fn acquire_file_lock(&self) -> EngineResult<std::fs::File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.config.flock_path)
            .map_err(|e| {
                EngineError::ConfigError(format!(
                    "cannot open lock file {}: {}",
                    self.config.flock_path.display(),
                    e
                ))
            })?;

        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => return Ok(file),
                Err(nix::errno::Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::Locked(format!(
                            "file lock {} is held by another process",
                            self.config.flock_path.display()
                        )));
                    }
                    sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(EngineError::ConfigError(format!(
                        "cannot lock {}: {}",
                        self.config.flock_path.display(),
                        e
                    )));
                }
            }
        }
    }

    async fn acquire_distributed_lock(
        &self,
        operation: &str,
    ) -> EngineResult<DistributedLockGuard> {
        let coordinator = self.coordinator.clone().ok_or_else(|| {
            EngineError::ConfigError(
                "zk-flock is enabled but no coordinator is configured".to_string(),
            )
        })?;

        let path = self.config.zk_flock_path.clone();
        let holder = format!("{}/{}", operation, self.hostname);

        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            if coordinator.try_lock(&path, &holder).await? {
                break;
            }

            if Instant::now() >= deadline {
                let contenders = coordinator.contenders(&path).await.unwrap_or_default();
                let mut msg = "distributed lock was not acquired within the timeout".to_string();
                if !contenders.is_empty() {
                    msg = format!("{}; contenders are {}", msg, contenders.join(", "));
                }
                return Err(EngineError::Locked(msg));
            }

            sleep(RETRY_INTERVAL).await;
        }

        Ok(DistributedLockGuard {
            coordinator,
            path,
            holder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::coordination::MemoryCoordinator;

    fn manager(dir: &tempfile::TempDir, coordinator: Option<Arc<dyn Coordinator>>) -> LockManager {
        LockManager::new(
            LockConfig {
                flock: true,
                zk_flock: coordinator.is_some(),
                flock_path: dir.path().join("op.lock"),
                zk_flock_path: "/chbackup/lock".to_string(),
                lock_timeout: Duration::from_millis(200),
            },
            coordinator,
            "host1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_file_lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, None);

        let lock = manager.acquire("BACKUP", true).await.unwrap();
        drop(lock);

        // reacquirable after release
        manager.acquire("PURGE", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_distributed_lock_contention() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());

        // a foreign holder owns the lock
        coordinator.try_lock("/chbackup/lock", "other").await.unwrap();

        let manager = manager(&dir, Some(coordinator.clone()));
        let err = manager.acquire("BACKUP", true).await.unwrap_err();
        assert_eq!(3, err.exit_code());

        // non-distributed operations are unaffected
        manager.acquire("RESTORE", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_distributed_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let manager = manager(&dir, Some(coordinator.clone()));

        let lock = manager.acquire("BACKUP", true).await.unwrap();
        assert!(!coordinator.try_lock("/chbackup/lock", "foreign").await.unwrap());

        drop(lock);
        // the release future is spawned on drop; give it a tick
        tokio::task::yield_now().await;

        assert!(coordinator.try_lock("/chbackup/lock", "foreign").await.unwrap());
    }

    #[tokio::test]
    async fn test_misconfigured_distributed_lock() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir, None);
        let mut config = manager.config.clone();
        config.zk_flock = true;
        let manager = LockManager::new(config, None, "host1".to_string());

        let err = manager.acquire("BACKUP", true).await.unwrap_err();
        assert_eq!(2, err.exit_code());
    }
}
