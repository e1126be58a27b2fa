pub mod backup;
pub mod cloud_storage;
pub mod delete;
pub mod list;
pub mod purge;
pub mod restore;
pub mod restore_schema;
pub mod show;

use std::sync::Arc;

use chbackup_engine::config::Config;
use chbackup_engine::coordination::{Coordinator, MemoryCoordinator};
use chbackup_engine::error::{EngineError, EngineResult};
use chbackup_engine::BackupManager;

use crate::cli::Opts;

/// Loads the configuration and builds the engine.
pub async fn build_manager(opts: &Opts) -> EngineResult<BackupManager> {
    let config = Config::load(&opts.config)
        .map_err(|e| EngineError::ConfigError(format!("{:#}", e)))?;

    let coordinator: Option<Arc<dyn Coordinator>> = if config.lock.zk_flock {
        Some(Arc::new(MemoryCoordinator::new()))
    } else {
        None
    };

    BackupManager::new(config, coordinator).await
}

/// Parses a `db.table` selector.
pub fn parse_table_selector(s: &str) -> EngineResult<(String, String)> {
    s.split_once('.')
        .map(|(db, table)| (db.to_string(), table.to_string()))
        .ok_or_else(|| {
            EngineError::ConfigError(format!(
                "table must be fully qualified as <database>.<table>: \"{}\"",
                s
            ))
        })
}

/// Parses a `key=value` label.
pub fn parse_label(s: &str) -> EngineResult<(String, String)> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| EngineError::ConfigError(format!("label must be <key>=<value>: \"{}\"", s)))
}
