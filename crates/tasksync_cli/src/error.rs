//! CLI error type.

use std::path::PathBuf;
use tasksync_engine::{BranchError, SyncError};
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by the CLI.
#[derive(Error, Debug)]
pub enum CliError {
    /// The configuration file could not be read.
    #[error("cannot read config {path}: {source}")]
    ConfigRead {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON.
    #[error("invalid config {path}: {source}")]
    ConfigParse {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The working directory is not a repository.
    #[error("{0} is not a git repository")]
    NotARepository(PathBuf),

    /// The repository needs attention before it can sync.
    #[error("repository is in state {0}; resolve it and retry")]
    Blocked(String),

    /// A sync operation failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A branch operation failed.
    #[error(transparent)]
    Branch(#[from] BranchError),

    /// Output could not be serialized.
    #[error("cannot render output: {0}")]
    Render(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
