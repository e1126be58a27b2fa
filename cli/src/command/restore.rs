use clap::Parser;

use chbackup::name::BackupTarget;
use chbackup_engine::cloud::CloudRestoreParams;
use chbackup_engine::error::{EngineError, EngineResult};
use chbackup_engine::metadata::BackupSources;
use chbackup_engine::restore::{CleanZookeeperMode, RestoreOptions};

use crate::cli::Opts;
use crate::command::{build_manager, parse_table_selector};

/// Restore a backup.
#[derive(Debug, Parser)]
pub struct Restore {
    /// Name of the backup, or LAST for the most recent created one.
    backup: BackupTarget,

    /// Restore only database schemas.
    #[clap(long)]
    schema_only: bool,

    /// Perform partial restore of access control entities.
    #[clap(long)]
    access: bool,

    /// Perform partial restore of user defined functions.
    #[clap(long)]
    udf: bool,

    /// Perform partial restore of named collections.
    #[clap(long)]
    nc: bool,

    /// Perform partial restore of schemas.
    #[clap(long)]
    schema: bool,

    /// Perform partial restore of data.
    #[clap(long)]
    data: bool,

    /// Databases to restore. All databases in the backup when omitted.
    #[clap(short, long)]
    databases: Vec<String>,

    /// Databases excluded from restoring.
    #[clap(long)]
    exclude_databases: Vec<String>,

    /// Tables to restore, as <database>.<table>.
    #[clap(short, long)]
    tables: Vec<String>,

    /// Tables excluded from restoring, as <database>.<table>.
    #[clap(long)]
    exclude_tables: Vec<String>,

    /// Replica name written into Replicated engines, overriding the
    /// configured one.
    #[clap(long)]
    override_replica_name: Option<String>,

    /// Rewrite Replicated engines to their non-replicated equivalents.
    #[clap(long)]
    force_non_replicated: bool,

    /// Replica identity used for coordination cleanup.
    #[clap(long)]
    replica_name: Option<String>,

    /// Purge replica entries from the coordination service before
    /// recreating Replicated objects.
    #[clap(long, value_parser = ["replica-only", "all-replicas"])]
    clean_zookeeper_mode: Option<String>,

    /// Skip parts that fail to restore instead of aborting.
    #[clap(long)]
    keep_going: bool,

    /// Source bucket for object-storage disk data.
    #[clap(long)]
    cloud_storage_source_bucket: Option<String>,

    /// Source path inside the source bucket.
    #[clap(long, default_value = "")]
    cloud_storage_source_path: String,

    /// Custom endpoint of the source bucket.
    #[clap(long)]
    cloud_storage_source_endpoint: Option<String>,

    /// Use the source bucket's current state instead of the recorded
    /// revision.
    #[clap(long)]
    cloud_storage_latest: bool,

    /// Attach object-storage parts without copying objects. Requires
    /// identical source and destination bucket and path.
    #[clap(long)]
    use_inplace_cloud_restore: bool,

    /// Recreate tables inside Replicated databases instead of leaving
    /// them to replication.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    restore_tables_in_replicated_database: bool,
}

pub async fn run(opts: Opts) -> EngineResult<()> {
    let sub = opts.command.as_restore().unwrap();

    let sources = BackupSources::from_flags(
        sub.schema_only,
        sub.schema,
        sub.data,
        sub.access,
        sub.udf,
        sub.nc,
    );

    let tables = sub
        .tables
        .iter()
        .map(|t| parse_table_selector(t))
        .collect::<EngineResult<Vec<_>>>()?;
    let exclude_tables = sub
        .exclude_tables
        .iter()
        .map(|t| parse_table_selector(t))
        .collect::<EngineResult<Vec<_>>>()?;

    let clean_zookeeper_mode = sub
        .clean_zookeeper_mode
        .as_deref()
        .map(str::parse::<CleanZookeeperMode>)
        .transpose()?;

    let cloud = sub
        .cloud_storage_source_bucket
        .as_ref()
        .map(|bucket| CloudRestoreParams {
            source_bucket: bucket.clone(),
            source_path: sub.cloud_storage_source_path.clone(),
            source_endpoint: sub.cloud_storage_source_endpoint.clone(),
            latest: sub.cloud_storage_latest,
            inplace: sub.use_inplace_cloud_restore,
        });

    if sub.use_inplace_cloud_restore && cloud.is_none() {
        return Err(EngineError::ConfigError(
            "--use-inplace-cloud-restore requires --cloud-storage-source-bucket".to_string(),
        ));
    }

    let options = RestoreOptions {
        sources,
        databases: sub.databases.clone(),
        exclude_databases: sub.exclude_databases.clone(),
        tables,
        exclude_tables,
        override_replica_name: sub.override_replica_name.clone(),
        force_non_replicated: sub.force_non_replicated,
        replica_name: sub.replica_name.clone(),
        clean_zookeeper_mode,
        cloud,
        keep_going: sub.keep_going,
        restore_tables_in_replicated_database: sub.restore_tables_in_replicated_database,
    };

    let manager = build_manager(&opts).await?;
    manager.restore(&sub.backup, options).await
}
