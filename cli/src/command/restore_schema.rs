use clap::Parser;

use chbackup_engine::error::EngineResult;

use crate::cli::Opts;
use crate::command::build_manager;

/// Copy schemas from a live source host onto this node.
#[derive(Debug, Parser)]
pub struct RestoreSchema {
    /// Host to copy schemas from.
    #[clap(long)]
    source: String,

    /// Port of the source host's HTTP interface.
    #[clap(long, default_value_t = 8123)]
    source_port: u16,

    /// Replica identity used for coordination cleanup.
    #[clap(long)]
    replica_name: Option<String>,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_restore_schema().unwrap();

    let endpoint = format!("http://{}:{}", sub.source, sub.source_port);
    let manager = build_manager(&opts).await?;

    manager
        .restore_schema(&endpoint, sub.replica_name.as_deref())
        .await
}
