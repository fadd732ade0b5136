//! mysql-log-migrate CLI - migrate append-only log tables between
//! MySQL-family databases with UUIDv7 re-keying.

use clap::{Args, Parser, Subcommand};
use mysql_log_migrate::{
    config::split_columns, ExportConfig, Exporter, Importer, LoadConfig, MigrateConfig,
    MigrateError, Migrator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql-log-migrate")]
#[command(about = "Migrate append-only log tables between MySQL-family databases")]
#[command(version)]
struct Cli {
    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a table to a compressed chunk bundle (phase one)
    Export(ExportArgs),

    /// Load a previously exported bundle into the destination (phase two)
    Load(LoadArgs),

    /// Migrate source to destination end-to-end
    Migrate(MigrateArgs),
}

#[derive(Args)]
struct ExportArgs {
    /// MySQL DSN of the source database
    #[arg(long)]
    dsn: String,

    /// Table to export
    #[arg(long)]
    table: String,

    /// Monotonic numeric primary key column
    #[arg(long, default_value = "id")]
    pk: String,

    /// Columns to export, comma-separated (default: all)
    #[arg(long)]
    columns: Option<String>,

    /// Optional WHERE fragment (without the WHERE keyword)
    #[arg(long = "where")]
    filter: Option<String>,

    /// Output directory; archived to <out>.tar.gz on success
    #[arg(long, default_value = "./export")]
    out: PathBuf,

    /// Parallel workers (default: 2)
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Rows per chunk file
    #[arg(long, default_value_t = 100_000)]
    chunk: u64,

    /// Rows/sec throttle per worker (0 = off)
    #[arg(long = "throttle-rows", default_value_t = 0)]
    throttle_rows: u64,

    /// MAX_EXECUTION_TIME hint in milliseconds (0 = off)
    #[arg(long = "max-exec-ms", default_value_t = 0)]
    max_exec_ms: u64,

    /// Emit periodic progress lines
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    progress: bool,
}

#[derive(Args)]
struct LoadArgs {
    /// MySQL DSN of the destination database
    #[arg(long)]
    dsn: String,

    /// Path to the export bundle (export.tar.gz)
    #[arg(long)]
    tar: PathBuf,

    /// Destination table
    #[arg(long = "dst-table")]
    dst_table: String,

    /// Destination columns in order, UUID column first (comma-separated)
    #[arg(long = "dst-columns")]
    dst_columns: String,

    /// Destination timestamp column parsed with STR_TO_DATE
    #[arg(long = "dst-ts-column", default_value = "ins_ts")]
    dst_ts_column: String,

    /// 1-based index of the datetime column in the CSV
    #[arg(long = "uuidv7-from-index")]
    uuidv7_from_index: usize,

    /// IANA timezone of the datetime column
    #[arg(long = "uuidv7-tz", default_value = "UTC")]
    uuidv7_tz: String,

    /// Parallel stage workers (default: CPU count)
    #[arg(long)]
    workers: Option<usize>,

    /// Relax destination checks/durability during the load
    #[arg(long = "fast-load", default_value_t = true, action = clap::ArgAction::Set)]
    fast_load: bool,
}

#[derive(Args)]
struct MigrateArgs {
    /// MariaDB DSN of the source database
    #[arg(long = "src-dsn")]
    src_dsn: String,

    /// Source table
    #[arg(long = "src-table", default_value = "log")]
    src_table: String,

    /// Optional filter for source queries (example: id % 100 = 0)
    #[arg(long = "src-filter")]
    src_filter: Option<String>,

    /// Source numeric id column
    #[arg(long = "src-pk", default_value = "id")]
    src_pk: String,

    /// MySQL/Percona DSN of the destination database
    #[arg(long = "dst-dsn")]
    dst_dsn: String,

    /// Destination table
    #[arg(long = "dst-table", default_value = "log")]
    dst_table: String,

    /// Destination column carrying the source numeric id
    #[arg(long = "dst-pk", default_value = "nid")]
    dst_pk: String,

    /// Destination UUID column
    #[arg(long = "dst-uuid", default_value = "id")]
    dst_uuid: String,

    /// Destination timestamp column parsed with STR_TO_DATE
    #[arg(long = "dst-ts-column", default_value = "ins_ts")]
    dst_ts_column: String,

    /// 1-based index of the source column seeding the UUIDv7
    #[arg(long = "ts-idx", default_value_t = 2)]
    ts_idx: usize,

    /// IANA timezone of the timestamp column
    #[arg(long = "uuid-tz", default_value = "UTC")]
    uuid_tz: String,

    /// Parallel stage workers (default: CPU count)
    #[arg(long = "stage-workers")]
    stage_workers: Option<usize>,

    /// Parallel load workers (default: CPU count)
    #[arg(long = "load-workers")]
    load_workers: Option<usize>,

    /// Rows per chunk file
    #[arg(long, default_value_t = 100_000)]
    chunk: u64,

    /// InnoDB buffer pool size in GB during fast-load (0 = leave alone)
    #[arg(long = "innodb-buffer-pool-gb", default_value_t = 0.0)]
    innodb_buffer_pool_gb: f64,

    /// InnoDB IO capacity during fast-load (0 = leave alone)
    #[arg(long = "innodb-io-capacity", default_value_t = 0)]
    innodb_io_capacity: u64,

    /// InnoDB IO capacity max during fast-load (0 = leave alone)
    #[arg(long = "innodb-io-capacity-max", default_value_t = 0)]
    innodb_io_capacity_max: u64,

    /// Use LOAD DATA LOCAL INFILE (chunks staged on the client)
    #[arg(long = "local-infile")]
    local_infile: bool,

    /// Relax destination checks/durability during the run
    #[arg(long = "fast-load", default_value_t = true, action = clap::ArgAction::Set)]
    fast_load: bool,

    /// MAX_EXECUTION_TIME hint for source queries, in milliseconds (0 = off)
    #[arg(long = "max-exec-ms", default_value_t = 0)]
    max_exec_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let cancel = CancellationToken::new();
    setup_signal_handler(cancel.clone());

    match cli.command {
        Commands::Export(args) => {
            let config = ExportConfig {
                dsn: args.dsn,
                table: args.table,
                pk: args.pk,
                columns: args.columns,
                filter: args.filter,
                out_dir: args.out,
                workers: args.workers,
                chunk_size: args.chunk,
                throttle_rps: args.throttle_rows,
                max_exec_ms: args.max_exec_ms,
                progress: args.progress,
            };

            let exporter = Exporter::connect(config).await?;
            let report = exporter.run(cancel).await?;

            println!("\nExport completed!");
            println!("  Rows: {}", report.rows);
            println!("  Chunks: {}", report.files);
            if let Some(path) = report.archive_path {
                println!("  Bundle: {}", path.display());
            }
            println!("  Duration: {:.2}s", report.duration.as_secs_f64());
        }

        Commands::Load(args) => {
            let config = LoadConfig {
                dsn: args.dsn,
                tar_path: args.tar,
                dst_table: args.dst_table,
                dst_columns: split_columns(&args.dst_columns),
                dst_ts_column: args.dst_ts_column,
                uuid_from_idx: args.uuidv7_from_index,
                uuid_tz: args.uuidv7_tz,
                workers: args.workers.unwrap_or_else(detected_cpus),
                use_fast_load: args.fast_load,
            };

            let importer = Importer::connect(config).await?;
            let report = importer.run(cancel).await?;

            println!("\nLoad completed!");
            println!("  Files: {}", report.files_loaded);
            println!("  Rows: {}", report.rows_loaded);
            println!("  Duration: {:.2}s", report.duration.as_secs_f64());
        }

        Commands::Migrate(args) => {
            let config = MigrateConfig {
                src_dsn: args.src_dsn,
                src_table: args.src_table,
                src_filter: args.src_filter,
                src_pk: args.src_pk,
                dst_dsn: args.dst_dsn,
                dst_table: args.dst_table,
                dst_pk: args.dst_pk,
                dst_uuid: args.dst_uuid,
                dst_ts_column: args.dst_ts_column,
                ts_column_idx: args.ts_idx,
                uuid_tz: args.uuid_tz,
                stage_workers: args.stage_workers.unwrap_or_else(detected_cpus),
                load_workers: args.load_workers.unwrap_or_else(detected_cpus),
                chunk_size: args.chunk,
                buffer_pool_size: gb_to_bytes(args.innodb_buffer_pool_gb),
                io_capacity: args.innodb_io_capacity,
                io_capacity_max: args.innodb_io_capacity_max,
                use_local_infile: args.local_infile,
                use_fast_load: args.fast_load,
                max_exec_ms: args.max_exec_ms,
            };

            let migrator = Migrator::connect(config).await?;
            let report = migrator.run(cancel).await?;

            println!("\nMigration completed!");
            println!(
                "  Staged: {} files / {} rows",
                report.files_staged, report.rows_staged
            );
            println!(
                "  Loaded: {} files / {} rows",
                report.files_loaded, report.rows_loaded
            );
            println!("  Duration: {:.2}s", report.duration.as_secs_f64());
        }
    }

    Ok(())
}

fn gb_to_bytes(gb: f64) -> u64 {
    if gb > 0.0 {
        (gb * 1024.0 * 1024.0 * 1024.0) as u64
    } else {
        0
    }
}

/// Number of CPUs, used as the default worker pool size.
fn detected_cpus() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.cpus().len().max(1)
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Translate SIGINT and SIGTERM into token cancellation so every blocking
/// pipeline operation unwinds within a bounded time.
#[cfg(unix)]
fn setup_signal_handler(cancel: CancellationToken) {
    let cancel_int = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Shutting down gracefully...");
        cancel_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Shutting down gracefully...");
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn setup_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        cancel.cancel();
    });
}
