//! # eCFR Analyzer CLI (`ecfr`)
//!
//! Builds a local SQLite copy of the Electronic Code of Federal Regulations
//! and serves it over a read-only JSON API.
//!
//! ## Usage
//!
//! ```bash
//! ecfr --config ./config/ecfr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ecfr init` | Create the SQLite database and run schema migrations |
//! | `ecfr ingest` | Fetch titles, agencies, and regulation text |
//! | `ecfr stats` | Print row counts |
//! | `ecfr search "<query>"` | Search enriched regulation text |
//! | `ecfr serve` | Start the JSON HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! # Everything, in order
//! ecfr ingest --config ./config/ecfr.toml
//!
//! # Only refresh agency metadata
//! ecfr ingest --agencies
//!
//! # Re-fetch text for every reference, not just missing ones
//! ecfr ingest --content --refresh
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ecfr_analyzer::ingest::{self, Phases};
use ecfr_analyzer::progress::ProgressMode;
use ecfr_analyzer::{config, migrate, search, server, stats};

/// eCFR Analyzer: ingest federal regulations into SQLite and serve them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ecfr.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ecfr",
    about = "eCFR Analyzer — ingest federal regulations into SQLite and serve them read-only",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ecfr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Fetch data from the eCFR API and store it.
    ///
    /// With no phase flags every phase runs, in the order titles,
    /// agencies, content.
    Ingest {
        /// Run the titles phase.
        #[arg(long)]
        titles: bool,

        /// Run the agencies phase.
        #[arg(long)]
        agencies: bool,

        /// Run the content phase.
        #[arg(long)]
        content: bool,

        /// Reprocess references that already have content.
        #[arg(long)]
        refresh: bool,

        /// Progress output on stderr. Defaults to human when stderr is a
        /// terminal, otherwise off.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print database statistics.
    Stats,

    /// Search enriched regulation text.
    Search {
        /// Words to search for; every word must match.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Start the read-only HTTP API on `[server].bind`.
    Serve,
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
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            titles,
            agencies,
            content,
            refresh,
            progress,
        } => {
            let phases = Phases::from_flags(titles, agencies, content);
            let reporter = progress
                .unwrap_or_else(ProgressMode::default_for_tty)
                .reporter();
            ingest::run_ingest(&cfg, phases, refresh, reporter.as_ref()).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
