use crate::{
    commands::{Commands, OptionsArg},
    error::CliError,
    output::Summary,
    shutdown::{ExitCode, ShutdownCoordinator},
};
use clap::Parser;
use connectors::{
    session::{SessionFactory, mysql::MySqlSessionFactory},
    storage::{Storage, StorageRegistry},
};
use engine_config::options::{
    BinlogDumpOptions, BinlogLoadOptions, CopyOptions, DumpOptions, DumpScope, ExportOptions, LoadOptions,
    Options,
};
use engine_runtime::{
    binlog::{BinlogDumper, BinlogLoader, ReplicationBinlogSource},
    copy::Copier,
    dump::{Dumper, export::export_table},
    load::Loader,
};
use model::core::identifiers::ObjectName;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// First server id used when reading binary logs as a replica.
const REPLICA_SERVER_ID_BASE: u32 = 3_000_000_000;

mod commands;
mod conn;
mod error;
mod output;
mod shutdown;

#[derive(Parser)]
#[command(name = "dumpload", version = "0.1.0", about = "Parallel, resumable MySQL dump and load")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    shutdown.register_handlers();

    let code = match run(cli.command, &shutdown).await {
        Ok(()) => ExitCode::Success,
        Err(e) if shutdown.is_shutdown_requested() => {
            error!("Interrupted: {e}. Run the same command again to resume.");
            ExitCode::ShutdownRequested
        }
        Err(e) => {
            error!("{e}");
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.as_i32());
}

async fn run(command: Commands, shutdown: &ShutdownCoordinator) -> Result<(), CliError> {
    let cancel = shutdown.cancel_token();

    match command {
        Commands::DumpInstance {
            source,
            output,
            options,
            report,
        } => {
            let summary = dump(&source, &output, DumpScope::Instance, &options, cancel).await?;
            output::emit(summary, &report).await?;
        }
        Commands::DumpSchemas {
            source,
            output,
            schemas,
            options,
            report,
        } => {
            let summary = dump(&source, &output, DumpScope::Schemas(schemas), &options, cancel).await?;
            output::emit(summary, &report).await?;
        }
        Commands::DumpTables {
            source,
            output,
            schema,
            tables,
            all,
            options,
            report,
        } => {
            let scope = DumpScope::Tables { schema, tables, all };
            let summary = dump(&source, &output, scope, &options, cancel).await?;
            output::emit(summary, &report).await?;
        }
        Commands::LoadDump {
            target,
            input,
            options,
            report,
        } => {
            let options: LoadOptions = read_options(&options).await?;
            let loader = Loader::new(connect(&target)?, open_storage(&input).await?, options).with_cancel(cancel);
            let result = loader.run().await?;
            output::emit(Summary::from(&result), &report).await?;
        }
        Commands::ExportTable {
            source,
            table,
            output,
            file,
            options,
            report,
        } => {
            let options: ExportOptions = read_options(&options).await?;
            let name = ObjectName::parse(&table).ok_or_else(|| CliError::InvalidTableName(table.clone()))?;
            let session = connect(&source)?.open().await?;
            let result = export_table(session.as_ref(), &name, open_storage(&output).await?, &file, &options).await;
            session.close().await?;
            output::emit(Summary::from(&result?), &report).await?;
        }
        Commands::DumpBinlogs {
            source,
            output,
            options,
            report,
        } => {
            let options: BinlogDumpOptions = read_options(&options).await?;
            let factory = MySqlSessionFactory::from_url(&source)?;
            info!(server = %factory.describe(), "Using server");
            let reader = Arc::new(factory.binlog_reader(replica_server_id()));
            let session = factory.open().await?;
            let dumper = BinlogDumper::new(
                Arc::new(ReplicationBinlogSource::new(session, reader)),
                open_storage(&output).await?,
                options,
            )
            .with_cancel(cancel);
            let result = dumper.run().await?;
            output::emit(Summary::from(&result), &report).await?;
        }
        Commands::LoadBinlogs {
            target,
            input,
            options,
            report,
        } => {
            let options: BinlogLoadOptions = read_options(&options).await?;
            let loader =
                BinlogLoader::new(connect(&target)?, open_storage(&input).await?, options).with_cancel(cancel);
            let result = loader.run().await?;
            output::emit(Summary::from(&result), &report).await?;
        }
        Commands::CopyInstance {
            source,
            target,
            options,
            report,
        } => {
            let summary = copy(&source, &target, DumpScope::Instance, &options, cancel).await?;
            output::emit(summary, &report).await?;
        }
        Commands::CopySchemas {
            source,
            target,
            schemas,
            options,
            report,
        } => {
            let summary = copy(&source, &target, DumpScope::Schemas(schemas), &options, cancel).await?;
            output::emit(summary, &report).await?;
        }
        Commands::CopyTables {
            source,
            target,
            schema,
            tables,
            all,
            options,
            report,
        } => {
            let scope = DumpScope::Tables { schema, tables, all };
            let summary = copy(&source, &target, scope, &options, cancel).await?;
            output::emit(summary, &report).await?;
        }
        Commands::TestConn { url, storage } => {
            let version = conn::ping_server(&url).await?;
            println!("{:<16} {}", "Server version", version);
            if let Some(storage) = storage {
                let state = conn::inspect_storage(&storage).await?;
                println!("{:<16} {}", "Storage", state);
            }
        }
    }

    Ok(())
}

async fn dump(
    source: &str,
    output: &str,
    scope: DumpScope,
    options: &OptionsArg,
    cancel: CancellationToken,
) -> Result<Summary, CliError> {
    let options: DumpOptions = read_options(options).await?;
    let dumper = Dumper::new(connect(source)?, open_storage(output).await?, options).with_cancel(cancel);
    let result = dumper.run(&scope).await?;
    Ok(Summary::from(&result))
}

async fn copy(
    source: &str,
    target: &str,
    scope: DumpScope,
    options: &OptionsArg,
    cancel: CancellationToken,
) -> Result<Summary, CliError> {
    let options: CopyOptions = read_options(options).await?;
    let copier = Copier::new(connect(source)?, connect(target)?, options).with_cancel(cancel);
    let result = copier.run(&scope).await?;
    Ok(Summary::from(&result))
}

fn connect(url: &str) -> Result<Arc<dyn SessionFactory>, CliError> {
    let factory = MySqlSessionFactory::from_url(url)?;
    info!(server = %factory.describe(), "Using server");
    Ok(Arc::new(factory))
}

async fn open_storage(url: &str) -> Result<Arc<dyn Storage>, CliError> {
    let storage = StorageRegistry::new().open(url).await?;
    info!(storage = %storage.describe(), "Using storage");
    Ok(storage)
}

/// Replica id the binlog stream registers with, distinct per process.
fn replica_server_id() -> u32 {
    REPLICA_SERVER_ID_BASE + std::process::id() % 1_000_000
}

/// Options come from a JSON file; without one the defaults apply.
async fn read_options<T: Options + Default>(arg: &OptionsArg) -> Result<T, CliError> {
    match &arg.options {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            Ok(T::from_json(&json)?)
        }
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_table_lists() {
        let cli = Cli::try_parse_from([
            "dumpload",
            "dump-tables",
            "--source",
            "mysql://root@localhost:3306",
            "--output",
            "/tmp/dump",
            "--schema",
            "app",
            "--tables",
            "people,audit",
        ])
        .unwrap();
        match cli.command {
            Commands::DumpTables { schema, tables, all, .. } => {
                assert_eq!(schema, "app");
                assert_eq!(tables, vec!["people", "audit"]);
                assert!(!all);
            }
            _ => panic!("parsed the wrong command"),
        }
    }

    #[test]
    fn tables_and_all_conflict() {
        let result = Cli::try_parse_from([
            "dumpload",
            "copy-tables",
            "--source",
            "mysql://a",
            "--target",
            "mysql://b",
            "--schema",
            "app",
            "--tables",
            "people",
            "--all",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn replica_server_id_stays_in_its_range() {
        let id = replica_server_id();
        assert!(id >= REPLICA_SERVER_ID_BASE);
        assert!(id < REPLICA_SERVER_ID_BASE + 1_000_000);
        assert_eq!(id, replica_server_id());
    }

    #[tokio::test]
    async fn reads_options_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"threads": 8, "bytesPerChunk": "128k"}}"#).unwrap();
        let arg = OptionsArg {
            options: Some(file.path().display().to_string()),
        };

        let options: DumpOptions = read_options(&arg).await.unwrap();
        assert_eq!(options.threads, 8);
        assert_eq!(options.chunking.bytes_per_chunk, 128 * 1024);

        let defaults: LoadOptions = read_options(&OptionsArg::default()).await.unwrap();
        assert_eq!(defaults, LoadOptions::default());
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"threads": 0}}"#).unwrap();
        let arg = OptionsArg {
            options: Some(file.path().display().to_string()),
        };
        let err = read_options::<DumpOptions>(&arg).await.unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
