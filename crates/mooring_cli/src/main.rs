//! Mooring CLI
//!
//! Command-line tools for inspecting a Mooring storage root.
//!
//! # Commands
//!
//! - `pins` - List pins and the objects they hold
//! - `rows` - List stored object rows
//! - `ledger` - Dump the local identity ledger
//! - `query` - Run an offline query against the local datastore

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Mooring offline store tools.
#[derive(Parser)]
#[command(name = "mooring")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the storage root
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
    /// List pins and the objects they hold
    Pins {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List stored object rows
    Rows {
        /// Only rows of this class
        #[arg(short, long)]
        class: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the local identity ledger
    Ledger {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run an offline query
    Query {
        /// Class to query
        class: String,

        /// Equality constraints as a JSON object, e.g. '{"player":"ann"}'
        #[arg(short = 'w', long = "where")]
        where_json: Option<String>,

        /// Restrict to objects under this pin
        #[arg(long)]
        pin: Option<String>,

        /// Sort keys, comma separated; prefix with '-' for descending
        #[arg(short, long)]
        order: Option<String>,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip ACL checks
        #[arg(long)]
        ignore_acls: bool,
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
        Commands::Pins { format } => {
            let path = cli.path.ok_or("Storage path required for pins")?;
            commands::pins::run(&path, &format)?;
        }
        Commands::Rows { class, format } => {
            let path = cli.path.ok_or("Storage path required for rows")?;
            commands::rows::run(&path, class.as_deref(), &format)?;
        }
        Commands::Ledger { format } => {
            let path = cli.path.ok_or("Storage path required for ledger")?;
            commands::ledger::run(&path, &format)?;
        }
        Commands::Query {
            class,
            where_json,
            pin,
            order,
            limit,
            ignore_acls,
        } => {
            let path = cli.path.ok_or("Storage path required for query")?;
            let options = commands::query::QueryOptions {
                class,
                where_json,
                pin,
                order,
                limit,
                ignore_acls,
            };
            commands::query::run(&path, &options)?;
        }
        Commands::Version => {
            println!("Mooring CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
