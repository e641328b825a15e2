//! # Archive Sync CLI (`arx`)
//!
//! The `arx` binary drives the ingestion engine: database setup, forced
//! updates, repair, status inspection, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! arx --config ./config/arx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `arx init` | Create the SQLite database and run schema migrations |
//! | `arx serve` | Start the HTTP server |
//! | `arx status <id>` | Print the status report of a document |
//! | `arx get <id>` | Print a document with its pages, notes and stamps |
//! | `arx update <id>` | Fetch and reconcile with retries (`--finalize` for one strict pass) |
//! | `arx repair [<id>] [--all]` | Repair one document or every broken one |
//! | `arx scan` | List broken documents |
//! | `arx dates <strings...>` | Show how date strings normalize |
//! | `arx stats` | Database summary |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use archive_sync::{config, get, migrate, server, stats, sync_cmd};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Archive Sync CLI: ingestion and status reconciliation for scanned
/// archive documents.
///
/// All commands except `dates` read a TOML configuration file. See
/// `config/arx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "arx",
    about = "Archive Sync: ingestion and status reconciliation for scanned archive documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/arx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print the status report of a document.
    ///
    /// A record that claims completion but is inconsistent is reconciled
    /// first.
    Status {
        /// Document id (primary, archive or old id).
        id: String,
    },

    /// Print a document with all of its pages, notes and stamps.
    Get {
        /// Document id (primary, archive or old id).
        id: String,
    },

    /// Fetch analysis results and reconcile them, marking the document
    /// complete.
    Update {
        id: String,

        /// Number of attempts (defaults to `[analysis].max_retries`).
        #[arg(long)]
        retries: Option<u32>,

        /// Analysis collection to query instead of the recorded one.
        #[arg(long)]
        collection: Option<String>,

        /// Single attempt that also requires a summary.
        #[arg(long)]
        finalize: bool,
    },

    /// Repair broken documents.
    ///
    /// Runs a standard repair and falls back to a forced update.
    Repair {
        /// Repair this document only.
        id: Option<String>,

        /// Repair every broken document.
        #[arg(long, conflicts_with = "id")]
        all: bool,

        /// Skip the standard repair and force an update.
        #[arg(long, requires = "id")]
        force: bool,

        /// Attempts for the forced update.
        #[arg(long)]
        retries: Option<u32>,
    },

    /// List broken documents without changing them.
    Scan,

    /// Normalize date strings and print the resulting timeline.
    Dates {
        #[arg(required = true)]
        raw: Vec<String>,
    },

    /// Show database statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Dates { raw } = &cli.command {
        return sync_cmd::run_dates(raw);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Status { id } => {
            sync_cmd::run_status(&cfg, &id).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Update {
            id,
            retries,
            collection,
            finalize,
        } => {
            sync_cmd::run_update(&cfg, &id, retries, collection, finalize).await?;
        }
        Commands::Repair {
            id,
            all,
            force,
            retries,
        } => {
            sync_cmd::run_repair(&cfg, id, all, force, retries).await?;
        }
        Commands::Scan => {
            sync_cmd::run_scan(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Dates { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
