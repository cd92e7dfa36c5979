//! sqlkv CLI
//!
//! Command-line interface over a SQLite-backed store.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sqlkv::backend::{Query, SqliteBackend};
use sqlkv::{Backend, Engine, IterOptions, Options, ReadOptions, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// sqlkv CLI
#[derive(Parser, Debug)]
#[command(name = "sqlkv-cli")]
#[command(about = "Key-value store on an append-only SQLite table")]
#[command(version)]
struct Args {
    /// SQLite database file
    #[arg(short, long, default_value = "./sqlkv.db")]
    db: PathBuf,

    /// Table name
    #[arg(short, long)]
    table: Option<String>,

    /// Store option as name=value (repeatable), e.g. -o compactFrequency=50
    #[arg(short = 'o', long = "opt", value_parser = parse_pair)]
    opts: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        key: String,

        /// Print the stored JSON value instead of bytes
        #[arg(long)]
        json: bool,
    },

    /// Set a key-value pair
    Put { key: String, value: String },

    /// Delete a key
    Del { key: String },

    /// List key/value pairs in key order
    Scan {
        #[arg(long)]
        gte: Option<String>,

        #[arg(long)]
        lt: Option<String>,

        #[arg(long)]
        reverse: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Collapse the log to one row per key
    Compact,

    /// Dump raw log rows
    Rows,

    /// Drop the table
    Destroy,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlkv=debug"));

    fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> sqlkv::Result<()> {
    let mut pairs = args.opts;
    if let Some(table) = args.table {
        pairs.push(("table".to_string(), table));
    }
    let options = Options::from_pairs(pairs)?;

    match args.command {
        Commands::Rows => {
            let backend = SqliteBackend::open(&args.db)?;
            for row in backend.query(&Query::Rows { table: &options.table })? {
                println!("{}\t{}\t{}", row.id, String::from_utf8_lossy(&row.key), row.value);
            }
            return backend.close();
        }
        Commands::Destroy => {
            let backend = SqliteBackend::open(&args.db)?;
            Engine::destroy(&backend, &options)?;
            return backend.close();
        }
        _ => {}
    }

    let engine = Engine::open_path(&args.db, options)?;

    match args.command {
        Commands::Get { key, json } => {
            let read = if json { ReadOptions::json() } else { ReadOptions::default() };
            match engine.get_with(&key, &read) {
                Ok(value) => println!("{}", display(&value)),
                Err(e) if e.is_not_found() => println!("(not found)"),
                Err(e) => return Err(e),
            }
        }
        Commands::Put { key, value } => {
            engine.put(&key, value)?;
            println!("OK");
        }
        Commands::Del { key } => {
            engine.delete(&key)?;
            println!("OK");
        }
        Commands::Scan { gte, lt, reverse, limit } => {
            let iter = engine.iter(IterOptions {
                gte: gte.map(String::into_bytes),
                lt: lt.map(String::into_bytes),
                reverse,
                limit,
                ..IterOptions::default()
            })?;
            for entry in iter {
                let (key, value) = entry?;
                println!("{}\t{}", String::from_utf8_lossy(&key), display(&value));
            }
        }
        Commands::Compact => {
            let removed = engine.compact()?;
            println!("removed {} rows", removed);
        }
        // Handled before the engine is opened
        Commands::Rows | Commands::Destroy => {}
    }

    engine.close()
}

fn display(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Json(json) => json.to_string(),
    }
}
