//! Global CLI Setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use enum_as_inner::EnumAsInner;

use crate::command::backup::Backup;
use crate::command::cloud_storage::GetCloudStorageMetadata;
use crate::command::delete::Delete;
use crate::command::list::List;
use crate::command::purge::Purge;
use crate::command::restore::Restore;
use crate::command::restore_schema::RestoreSchema;
use crate::command::show::Show;
use crate::command;

/// ClickHouse backup tool.
#[derive(Debug, Parser)]
#[clap(name = "chbackup")]
#[clap(version)]
#[clap(propagate_version = true)]
pub struct Opts {
    /// Path to the configuration file.
    #[clap(short, long, default_value = "/etc/chbackup/chbackup.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, EnumAsInner)]
pub enum Command {
    Backup(Backup),
    Restore(Restore),
    List(List),
    Show(Show),
    Delete(Delete),
    Purge(Purge),
    RestoreSchema(RestoreSchema),
    GetCloudStorageMetadata(GetCloudStorageMetadata),
    Version,
}

/// Runs the selected command, mapping failures to exit codes.
///
/// 0 success, 1 operational failure, 2 bad arguments, 3 locked,
/// 4 not found. Argument errors exit through clap with code 2.
pub async fn run() -> i32 {
    let opts = Opts::parse();

    let result = match &opts.command {
        Command::Backup(_) => command::backup::run(opts).await,
        Command::Restore(_) => command::restore::run(opts).await,
        Command::List(_) => command::list::run(opts).await,
        Command::Show(_) => command::show::run(opts).await,
        Command::Delete(_) => command::delete::run(opts).await,
        Command::Purge(_) => command::purge::run(opts).await,
        Command::RestoreSchema(_) => command::restore_schema::run(opts).await,
        Command::GetCloudStorageMetadata(_) => command::cloud_storage::run(opts).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}: {}", e.name(), e);
            e.exit_code()
        }
    }
}
