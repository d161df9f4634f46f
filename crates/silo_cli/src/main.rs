//! Silo CLI
//!
//! Command-line tools for persistent storage silos.
//!
//! # Commands
//!
//! - `create` - Create and format a silo file
//! - `inspect` - Display the ident, tables and segments of a silo
//! - `verify` - Verify signatures and mount a copy of the silo
//! - `put` - Store a value under a key
//! - `get` - Read back the newest value stored under a key
//! - `list` - List live objects
//! - `ban` - Record a ban

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Persistent storage silo tools.
#[derive(Parser)]
#[command(name = "silo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the silo file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and format a silo file
    Create {
        /// Silo size, e.g. 64M or 1G
        #[arg(short, long)]
        size: String,

        /// Allocation granularity in bytes
        #[arg(short, long, default_value = "512")]
        granularity: u32,
    },

    /// Display the ident, tables and segments of a silo
    Inspect {
        /// Show segment details
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify signatures and mount a copy of the silo
    Verify,

    /// Store a value under a key
    Put {
        /// Object key; the object hash is its SHA-256
        key: String,

        /// Value to store
        value: String,

        /// Time to live in seconds
        #[arg(short, long, default_value = "120")]
        ttl: f64,

        /// Grace period in seconds
        #[arg(short, long, default_value = "10")]
        grace: f64,
    },

    /// Read back the newest value stored under a key
    Get {
        /// Object key
        key: String,
    },

    /// List live objects
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Record a ban
    Ban {
        /// Ban expression
        spec: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Create { size, granularity } => {
            let path = cli.path.ok_or("Silo path required for create")?;
            commands::create::run(&path, &size, granularity)?;
        }
        Commands::Inspect { segments, format } => {
            let path = cli.path.ok_or("Silo path required for inspect")?;
            commands::inspect::run(&path, segments, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Silo path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Put {
            key,
            value,
            ttl,
            grace,
        } => {
            let path = cli.path.ok_or("Silo path required for put")?;
            commands::object::put(&path, &key, value.as_bytes(), ttl, grace)?;
        }
        Commands::Get { key } => {
            let path = cli.path.ok_or("Silo path required for get")?;
            commands::object::get(&path, &key)?;
        }
        Commands::List { format } => {
            let path = cli.path.ok_or("Silo path required for list")?;
            commands::object::list(&path, &format)?;
        }
        Commands::Ban { spec } => {
            let path = cli.path.ok_or("Silo path required for ban")?;
            commands::object::ban(&path, &spec)?;
        }
        Commands::Version => {
            println!("Silo CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Silo Core v{}", silo_core::VERSION);
        }
    }

    Ok(())
}
