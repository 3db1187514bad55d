//! # Intake Harness CLI (`intake`)
//!
//! The `intake` binary turns a folder of patient intake forms into rows of a
//! `patients_info` table: each document is converted to markdown, a language
//! model fills the patient record schema, and the results are reconciled
//! into SQLite keyed by filename.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `intake init` | Create the SQLite database and schema |
//! | `intake sources` | Check the source, converter and extractor |
//! | `intake sync` | Convert, extract and export every document |
//! | `intake get <filename>` | Print one exported row as JSON |
//! | `intake list` | List exported rows |
//! | `intake cache stats` | Cached conversions per converter version |
//! | `intake cache prune` | Drop cached conversions of other versions |
//!
//! ## Examples
//!
//! ```bash
//! intake init --config ./config/intake.toml
//! intake sync --config ./config/intake.toml
//! intake get forms/jane-doe.pdf --config ./config/intake.toml
//! RUST_LOG=intake_harness=debug intake sync
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use intake_harness::progress::ProgressMode;
use intake_harness::{cache_cmd, config, get, ingest, migrate, sources};

/// Intake Harness: patient intake forms in, structured rows out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/intake.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "intake",
    about = "Intake Harness: extract structured patient records from intake forms",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/intake.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `patients_info`,
    /// `conversion_cache` and `runs` tables. Running it again is a no-op.
    Init,

    /// Check the configured source, converter and extractor.
    Sources,

    /// Run the pipeline over every document and export the results.
    ///
    /// Rows whose document vanished from the source are deleted; rows whose
    /// extraction failed this run keep their previous value.
    Sync {
        /// Compare the source listing with the stored rows. Nothing is
        /// converted or extracted, and the database is opened read-only.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print the exported row for a filename as JSON.
    Get {
        /// Filename as reported by the source (relative to its root).
        filename: String,
    },

    /// List all exported rows.
    List,

    /// Inspect or prune the conversion cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cached conversions per converter version.
    Stats,
    /// Remove cached conversions not produced by the current converter version.
    Prune {
        /// Show how many entries would be removed.
        #[arg(long)]
        dry_run: bool,
    },
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
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync { dry_run, progress } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_sync(&cfg, dry_run, mode).await?;
        }
        Commands::Get { filename } => {
            get::run_get(&cfg, &filename).await?;
        }
        Commands::List => {
            get::run_list(&cfg).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => cache_cmd::run_cache_stats(&cfg).await?,
            CacheAction::Prune { dry_run } => cache_cmd::run_cache_prune(&cfg, dry_run).await?,
        },
    }

    Ok(())
}
