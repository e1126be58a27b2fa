use std::path::PathBuf;

use clap::Parser;

use chbackup::name::BackupTarget;
use chbackup_engine::error::EngineResult;

use crate::cli::Opts;
use crate::command::build_manager;

/// Download the object-storage disk metadata of a backup.
#[derive(Debug, Parser)]
pub struct GetCloudStorageMetadata {
    /// Name of the backup, or LAST for the most recent created one.
    backup: BackupTarget,

    /// Name of the object-storage disk.
    #[clap(long)]
    disk: String,

    /// Directory to unpack the metadata into.
    #[clap(long, default_value = ".")]
    local_path: PathBuf,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_get_cloud_storage_metadata().unwrap();

    let manager = build_manager(&opts).await?;
    let fetched = manager
        .fetch_cloud_storage_metadata(&sub.backup, &sub.disk, &sub.local_path)
        .await?;

    for key in fetched {
        println!("{}", key);
    }

    Ok(())
}
