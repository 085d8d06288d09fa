//! CLI command implementations.

pub mod branches;
pub mod status;
pub mod sync;
pub mod watch;

use crate::error::{CliError, CliResult};
use crate::Format;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tasksync_engine::{GitGateway, SyncConfig, SyncOrchestrator, SyncState};
use tracing::debug;

/// Loads the configuration file, if any, and applies `--dir`.
pub fn load_config(path: Option<&Path>, dir: Option<&Path>) -> CliResult<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| CliError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?
        }
        None => SyncConfig::default(),
    };
    if let Some(dir) = dir {
        config.repo_dir = dir.to_path_buf();
    }
    debug!(?config, "configuration loaded");
    Ok(config)
}

/// Creates an orchestrator over `git` and initializes it.
///
/// Fails unless the working directory is a repository.
pub async fn open(config: SyncConfig) -> CliResult<SyncOrchestrator<GitGateway>> {
    let dir = config.repo_dir.clone();
    let orchestrator = SyncOrchestrator::new(config, Arc::new(GitGateway::new()));
    match orchestrator.initialize().await? {
        SyncState::NotConfigured => Err(CliError::NotARepository(dir)),
        _ => Ok(orchestrator),
    }
}

/// Prints `value` as JSON, or runs `text` for the text format.
pub fn emit<T, F>(format: Format, value: &T, text: F) -> CliResult<()>
where
    T: Serialize,
    F: FnOnce(&T),
{
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Text => text(value),
    }
    Ok(())
}
