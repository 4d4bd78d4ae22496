//! kcache CLI
//!
//! Command-line tools for kcache partition directories.
//!
//! # Commands
//!
//! - `inspect` - Display segment statistics
//! - `dump` - Print entries through a filtered cursor
//! - `verify` - Check that indexes agree with the log
//! - `clean` - Compact frozen segments holding dirty entries

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// kcache partition directory tools.
#[derive(Parser)]
#[command(name = "kcache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the partition directory, e.g. `cache/orders-0`
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
    /// Display segment statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print entries through a filtered cursor
    Dump {
        /// Start from this offset
        #[arg(short, long, default_value = "0")]
        offset: i64,

        /// Only entries with this key
        #[arg(short, long)]
        key: Option<String>,

        /// Only entries carrying this header, as `name=value`; repeatable
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print JSON patches against previously printed values of a key
        #[arg(short, long)]
        deltas: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check that indexes agree with the log
    Verify,

    /// Compact frozen segments holding dirty entries
    Clean {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Partition path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Dump {
            offset,
            key,
            headers,
            limit,
            deltas,
            format,
        } => {
            let path = cli.path.ok_or("Partition path required for dump")?;
            commands::dump::run(&path, offset, key.as_deref(), &headers, limit, deltas, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Partition path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Clean { dry_run } => {
            let path = cli.path.ok_or("Partition path required for clean")?;
            commands::clean::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("kcache CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("kcache core v{}", kcache_core::VERSION);
        }
    }

    Ok(())
}
