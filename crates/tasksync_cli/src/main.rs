//! TaskSync CLI
//!
//! Command-line front end for the task record sync engine.
//!
//! # Commands
//!
//! - `status` - Show repository and sync status
//! - `sync` - Run one pull, commit and push cycle
//! - `watch` - Watch for changes and sync until interrupted
//! - `branches` - List branch statuses
//! - `switch` - Check out another branch

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::error::CliResult;

/// Keeps a working copy of task records in sync with its remote.
#[derive(Parser)]
#[command(name = "tasksync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Working directory (defaults to the current directory)
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show repository and sync status
    Status,

    /// Run one pull, commit and push cycle
    Sync {
        /// Stage every changed file before syncing
        #[arg(short, long)]
        all: bool,
    },

    /// Watch for changes and sync until interrupted
    Watch {
        /// Paths to watch, relative to the working directory
        #[arg(short, long)]
        path: Vec<PathBuf>,
    },

    /// List branch statuses
    Branches,

    /// Check out another branch
    Switch {
        /// Branch to check out
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
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

    run(cli).await?;
    Ok(())
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = commands::load_config(cli.config.as_deref(), cli.dir.as_deref())?;

    match cli.command {
        Commands::Status => commands::status::run(config, cli.format).await,
        Commands::Sync { all } => commands::sync::run(config, all, cli.format).await,
        Commands::Watch { path } => commands::watch::run(config, path).await,
        Commands::Branches => commands::branches::list(config, cli.format).await,
        Commands::Switch { name } => commands::branches::switch(config, &name, cli.format).await,
    }
}
