//! Distributed coordination.
//!
//! The engine consumes the coordination service through the
//! [`Coordinator`] trait: a non-blocking lock plus contender listing.
//! Replica metadata cleanup never goes through this seam; it is
//! delegated to ClickHouse `SYSTEM DROP REPLICA` statements, which reach
//! the coordination service through the server's own session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EngineResult;

/// A distributed-coordination client.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Attempts to take the lock at `path` for `holder`.
    ///
    /// Returns false without blocking when another holder owns it.
    async fn try_lock(&self, path: &str, holder: &str) -> EngineResult<bool>;

    /// Releases the lock at `path` held by `holder`.
    async fn unlock(&self, path: &str, holder: &str) -> EngineResult<()>;

    /// Lists current lock holders under `path`.
    async fn contenders(&self, path: &str) -> EngineResult<Vec<String>>;
}

/// In-process coordinator.
///
/// Serves single-node deployments where mutual exclusion is already
/// covered by the file lock, and doubles as the test implementation.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    locks: Mutex<HashMap<String, String>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn try_lock(&self, path: &str, holder: &str) -> EngineResult<bool> {
        let mut locks = self.locks.lock().expect("coordinator map poisoned");
        match locks.get(path) {
            Some(owner) if owner != holder => Ok(false),
            _ => {
                locks.insert(path.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    async fn unlock(&self, path: &str, holder: &str) -> EngineResult<()> {
        let mut locks = self.locks.lock().expect("coordinator map poisoned");
        if locks.get(path).map(String::as_str) == Some(holder) {
            locks.remove(path);
        }
        Ok(())
    }

    async fn contenders(&self, path: &str) -> EngineResult<Vec<String>> {
        let locks = self.locks.lock().expect("coordinator map poisoned");
        Ok(locks.get(path).cloned().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::block_on;

    #[test]
    fn test_memory_coordinator() {
        block_on(async {
            let coordinator = MemoryCoordinator::new();

            assert!(coordinator.try_lock("/lock", "a").await.unwrap());
            assert!(!coordinator.try_lock("/lock", "b").await.unwrap());
            // re-entrant for the same holder
            assert!(coordinator.try_lock("/lock", "a").await.unwrap());

            assert_eq!(vec!["a"], coordinator.contenders("/lock").await.unwrap());

            // unlocking by a non-holder is a no-op
            coordinator.unlock("/lock", "b").await.unwrap();
            assert!(!coordinator.try_lock("/lock", "b").await.unwrap());

            coordinator.unlock("/lock", "a").await.unwrap();
            assert!(coordinator.try_lock("/lock", "b").await.unwrap());
        });
    }
}
