//! lsmdao CLI
//!
//! Command-line interface for inspecting and editing an lsmdao data directory.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use lsmdao::{DaoConfig, Engine, Record};
use tracing_subscriber::{fmt, EnvFilter};

/// lsmdao CLI
#[derive(Parser, Debug)]
#[command(name = "lsmdao-cli")]
#[command(about = "CLI for the lsmdao storage engine")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./lsmdao_data")]
    data_dir: String,

    /// MemTable flush threshold in KB
    #[arg(short = 'f', long, default_value = "4096")]
    flush_kb: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// List live records in key order
    Scan {
        /// Inclusive lower bound
        #[arg(long)]
        from: Option<String>,

        /// Exclusive upper bound
        #[arg(long)]
        to: Option<String>,

        /// Descending order
        #[arg(short, long)]
        reverse: bool,

        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Merge all segments into one
    Compact,

    /// Print segment statistics
    Stats,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> lsmdao::Result<()> {
    let config = DaoConfig::builder()
        .data_dir(&args.data_dir)
        .flush_threshold_bytes(args.flush_kb.max(1) * 1024)
        .build();

    let engine = Engine::open(config)?;

    match args.command {
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found)"),
        },
        Commands::Put { key, value } => {
            engine.upsert(Record::of(key, value))?;
            println!("OK");
        }
        Commands::Delete { key } => {
            engine.upsert(Record::tombstone(key))?;
            println!("OK");
        }
        Commands::Scan {
            from,
            to,
            reverse,
            limit,
        } => {
            let from = from.as_deref().map(str::as_bytes);
            let to = to.as_deref().map(str::as_bytes);
            let records = if reverse {
                engine.descending_range(from, to)?
            } else {
                engine.range(from, to)?
            };
            for record in records.take(limit.unwrap_or(usize::MAX)) {
                let record = record?;
                let value = record.value().map(|v| String::from_utf8_lossy(v).into_owned());
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(record.key()),
                    value.unwrap_or_default()
                );
            }
        }
        Commands::Compact => {
            let compacted = engine.compact()?;
            println!(
                "{} ({} segment(s))",
                if compacted { "compacted" } else { "nothing to compact" },
                engine.segment_count()
            );
        }
        Commands::Stats => {
            println!("data_dir:  {}", engine.data_dir().display());
            println!("segments:  {}", engine.segment_count());
            println!("version:   {}", lsmdao::VERSION);
        }
    }

    engine.close()
}
