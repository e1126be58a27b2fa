//! The ClickHouse backup engine.
//!
//! Orchestrates `FREEZE` snapshots into content-addressed part uploads
//! with part-level deduplication across prior backups, and restores
//! them back onto a node, against an S3-compatible object store.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]

pub mod clickhouse;
pub mod cloud;
pub mod compression;
pub mod config;
pub mod coordination;
pub mod dedup;
pub mod encryption;
pub mod error;
pub mod freeze;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod metadata;
pub mod pack;
pub mod restore;
pub mod restore_context;
pub mod storage;

pub use error::{EngineError, EngineResult};
pub use manager::{BackupManager, BackupOptions, BackupOutcome};
