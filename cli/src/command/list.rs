use clap::Parser;

use chbackup_engine::error::EngineResult;

use crate::cli::Opts;
use crate::command::build_manager;

/// List backups.
#[derive(Debug, Parser)]
pub struct List {
    /// Show backups in all states, not only created ones.
    #[clap(short, long)]
    all: bool,

    /// Verbose output.
    #[clap(short, long)]
    verbose: bool,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_list().unwrap();
    let all = sub.all;
    let verbose = sub.verbose;

    let manager = build_manager(&opts).await?;
    let backups = manager.list(all).await?;

    for backup in backups {
        if verbose {
            println!(
                "{}\t{}\t{}\t{}\t{}\t{}",
                backup.name,
                backup.state.as_str(),
                backup.start_time.format("%Y-%m-%d %H:%M:%S %z"),
                backup
                    .end_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S %z").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                backup.bytes,
                backup.real_bytes,
            );
        } else {
            println!("{}", backup.name);
        }
    }

    Ok(())
}
