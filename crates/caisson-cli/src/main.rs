use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use caisson_core::config::default_parallelism;
use caisson_core::{ops, BundleStore, LocalBackend, Result, StorageBackend, StoreConfig, WorkerPool};

/// Deduplicating backup store for byte streams.
#[derive(Parser)]
#[command(name = "caisson", version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a stream from stdin and store it under a name.
    Backup {
        /// Store directory (created if absent).
        store: PathBuf,
        /// Name of the backup.
        name: String,
        /// Store option override, key=value (repeatable).
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Write a stored backup to stdout.
    Restore {
        /// Store directory.
        store: PathBuf,
        /// Name of the backup.
        name: String,
        /// Store option override, key=value (repeatable).
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("caisson: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_store(path: PathBuf, options: &[String]) -> Result<BundleStore> {
    let mut config = StoreConfig::default();
    config.apply_options(options)?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalBackend::create(path)?);
    let pool = Arc::new(WorkerPool::new(default_parallelism()));
    let store = BundleStore::open(storage, config, pool)?;
    tracing::debug!(
        chunk_max = store.config().chunk_max_size,
        bundle_max = store.config().bundle_max_payload,
        compression = %store.config().compression_method,
        "store opened"
    );
    Ok(store)
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Backup {
            store,
            name,
            options,
        } => {
            let mut store = open_store(store, &options)?;
            let stdin = io::stdin();
            let report = ops::backup(&mut store, &name, &mut stdin.lock())?;
            eprintln!(
                "stored {} bytes as '{name}' ({} new bundles, {} packing passes)",
                report.length, report.new_bundles, report.iterations
            );
        }
        Command::Restore {
            store,
            name,
            options,
        } => {
            let store = open_store(store, &options)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let report = ops::restore(&store, &name, &mut out)?;
            out.flush()?;
            eprintln!("restored {} bytes from '{name}'", report.length);
        }
    }
    Ok(())
}
