use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use emberdb::{
    dm::log_record::LogRecord,
    file::{suffixed, DiskFile, LOG_SUFFIX, XID_SUFFIX},
    wal::Wal,
    Config, Database, Result, TransactionTable, Xid,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emberdb-cli", version, about = "Inspect and maintain emberdb databases")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty database, replacing any files at the prefix
    Create {
        prefix: PathBuf,
        /// Page cache budget in bytes
        #[arg(long)]
        memory: Option<u64>,
    },
    /// Open a database, recovering it if needed, and print a summary
    Check {
        prefix: PathBuf,
        #[arg(long)]
        memory: Option<u64>,
    },
    /// Print every well-formed record in the write-ahead log without modifying it
    Log { prefix: PathBuf },
    /// Print the status of one transaction
    Xid { prefix: PathBuf, xid: Xid },
}

fn config(memory: Option<u64>) -> Config {
    match memory {
        Some(memory) => Config::default().with_memory(memory),
        None => Config::default(),
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Create { prefix, memory } => {
            let db = Database::create(&prefix, config(memory))?;
            db.close()?;
            println!("created {}", prefix.display());
        }
        Command::Check { prefix, memory } => {
            let db = Database::open(&prefix, config(memory))?;
            match db.recovery() {
                Some(report) => println!(
                    "recovered: {} redone, {} undone, aborted {:?}",
                    report.redone, report.undone, report.aborted
                ),
                None => println!("clean shutdown"),
            }
            println!("pages: {}", db.page_count());
            println!("transactions: {}", db.xid_counter());
            db.close()?;
        }
        Command::Log { prefix } => {
            let log = Wal::inspect(Arc::new(DiskFile::open(suffixed(&prefix, LOG_SUFFIX))?))?;
            for payload in &log.payloads {
                println!("{}", LogRecord::try_from(payload.as_slice())?);
            }
            println!(
                "{} records, checksum {:#010x} (stored {:#010x}), {} torn bytes",
                log.payloads.len(),
                log.computed_checksum,
                log.stored_checksum,
                log.torn_bytes()
            );
        }
        Command::Xid { prefix, xid } => {
            let tm = TransactionTable::open(Arc::new(DiskFile::open(suffixed(&prefix, XID_SUFFIX))?))?;
            println!("{xid}: {}", tm.status(xid)?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse().command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
