//! CLI commands implementation.

mod constraints;
mod migrate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use queue_schema::config::{load_settings, LoadOptions};

use constraints::cmd_constraints;
use migrate::{cmd_migrate, cmd_status, cmd_undo};

#[derive(Parser)]
#[command(name = "queue-schema")]
#[command(about = "Schema migrations for the Queues table")]
#[command(version)]
pub struct Cli {
    /// Config file (default: discovered queue-schema.{toml,yaml,json})
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the SQLite database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Database URL (sqlite:PATH or postgres://...)
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Disable TLS for PostgreSQL connections
    #[arg(
        long,
        global = true,
        env = "QUEUE_SCHEMA_NO_TLS",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    no_tls: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Migrate {
        /// Only report pending migrations
        #[arg(long)]
        check: bool,
    },

    /// Revert the most recently applied migrations
    Undo {
        /// Number of migrations to revert
        #[arg(short, long, default_value = "1")]
        steps: usize,
    },

    /// Show applied and pending migrations
    Status,

    /// List uniqueness constraints on a table
    Constraints {
        /// Table name
        #[arg(default_value = "Queues")]
        table: String,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data_dir: cli.data_dir,
        database_url: cli.database_url,
        no_tls: cli.no_tls,
    };
    let (settings, _config) = load_settings(&options).await?;

    match cli.command {
        Commands::Migrate { check } => cmd_migrate(&settings, check).await,
        Commands::Undo { steps } => cmd_undo(&settings, steps).await,
        Commands::Status => cmd_status(&settings).await,
        Commands::Constraints { table } => cmd_constraints(&settings, &table).await,
    }
}
