use clap::Parser;

use chbackup::name::BackupTarget;
use chbackup_engine::error::{EngineError, EngineResult};

use crate::cli::Opts;
use crate::command::build_manager;

/// Show the document of a backup.
#[derive(Debug, Parser)]
pub struct Show {
    /// Name of the backup, or LAST for the most recent created one.
    backup: BackupTarget,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_show().unwrap();

    let manager = build_manager(&opts).await?;
    let backup = manager.get(&sub.backup).await?;

    let document: serde_json::Value = serde_json::from_str(&backup.to_json()?)
        .map_err(|e| EngineError::IntegrityError(format!("cannot render document: {}", e)))?;
    println!("{}", serde_json::to_string_pretty(&document).unwrap_or_default());

    eprintln!(
        "data parts: {}, linked parts: {}",
        backup.data_count(),
        backup.link_count()
    );

    Ok(())
}
