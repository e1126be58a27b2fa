use clap::Parser;

use chbackup::name::BackupName;
use chbackup_engine::error::EngineResult;

use crate::cli::Opts;
use crate::command::build_manager;

/// Delete a backup.
#[derive(Debug, Parser)]
pub struct Delete {
    /// Name of the backup.
    backup: BackupName,

    /// Also delete all failed and partial backups except the most
    /// recent one.
    #[clap(long)]
    purge_partial: bool,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_delete().unwrap();

    let manager = build_manager(&opts).await?;
    if let Some(message) = manager.delete(&sub.backup, sub.purge_partial).await? {
        eprintln!("{}", message);
    }

    Ok(())
}
