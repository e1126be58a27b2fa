//! ClickHouse integration.

pub mod client;
pub mod control;
pub mod models;
pub mod schema;

pub use client::ChClient;
pub use control::ClickhouseCtl;
pub use models::{Database, Disk, DiskKind, FrozenPart, Table};
