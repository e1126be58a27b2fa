use std::collections::HashMap;

use clap::Parser;

use chbackup_engine::error::EngineResult;
use chbackup_engine::metadata::BackupSources;
use chbackup_engine::BackupOptions;

use crate::cli::Opts;
use crate::command::{build_manager, parse_label, parse_table_selector};

/// Create a new backup.
#[derive(Debug, Parser)]
pub struct Backup {
    /// Name of the backup. The "{uuid}" token expands to a generated
    /// unique id. A timestamp name is used when omitted.
    #[clap(long)]
    name: Option<String>,

    /// Databases to back up. All except the excluded ones when omitted.
    #[clap(short, long)]
    databases: Vec<String>,

    /// Tables to back up, as <database>.<table>.
    #[clap(short, long)]
    tables: Vec<String>,

    /// Backup only database schemas.
    #[clap(long)]
    schema_only: bool,

    /// Perform partial backup of access control entities.
    #[clap(long)]
    access: bool,

    /// Perform partial backup of user defined functions.
    #[clap(long)]
    udf: bool,

    /// Perform partial backup of named collections.
    #[clap(long)]
    nc: bool,

    /// Perform partial backup of schemas.
    #[clap(long)]
    schema: bool,

    /// Perform partial backup of data.
    #[clap(long)]
    data: bool,

    /// Create the backup even within the configured minimal interval.
    #[clap(short, long)]
    force: bool,

    /// Label attached to the backup, as <key>=<value>. Can be given
    /// multiple times.
    #[clap(short, long)]
    label: Vec<String>,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_backup().unwrap();

    if !sub.databases.is_empty() && !sub.tables.is_empty() {
        return Err(chbackup_engine::EngineError::ConfigError(
            "--databases and --tables cannot be used together".to_string(),
        ));
    }

    let tables = sub
        .tables
        .iter()
        .map(|t| parse_table_selector(t))
        .collect::<EngineResult<Vec<_>>>()?;

    let labels = sub
        .label
        .iter()
        .map(|l| parse_label(l))
        .collect::<EngineResult<HashMap<_, _>>>()?;

    let sources = BackupSources::from_flags(
        sub.schema_only,
        sub.schema,
        sub.data,
        sub.access,
        sub.udf,
        sub.nc,
    );

    let options = BackupOptions {
        name: sub.name.clone(),
        databases: sub.databases.clone(),
        tables,
        force: sub.force,
        labels,
        sources,
    };

    let manager = build_manager(&opts).await?;
    let outcome = manager.backup(options).await?;

    println!("{}", outcome.name);
    if let Some(message) = outcome.message {
        eprintln!("{}", message);
    }

    Ok(())
}
