use clap::Parser;

use chbackup_engine::error::EngineResult;

use crate::cli::Opts;
use crate::command::build_manager;

/// Apply the retention policy to existing backups.
#[derive(Debug, Parser)]
pub struct Purge {}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let manager = build_manager(&opts).await?;
    let deleted = manager.purge().await?;

    for name in deleted {
        println!("{}", name);
    }

    Ok(())
}
