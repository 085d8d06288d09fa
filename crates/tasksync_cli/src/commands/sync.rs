//! Sync command implementation.

use super::{emit, open};
use crate::error::{CliError, CliResult};
use crate::Format;
use serde::Serialize;
use tasksync_engine::{SyncConfig, SyncState};
use tracing::info;

/// Sync cycle summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// Pull output.
    pub pulled: String,
    /// Committed paths.
    pub committed: Vec<String>,
    /// Whether the commit was pushed.
    pub pushed: bool,
    /// Cycle duration in milliseconds.
    pub duration_ms: u64,
}

/// Runs the sync command.
pub async fn run(config: SyncConfig, all: bool, format: Format) -> CliResult<()> {
    let orchestrator = open(config).await?;
    let state = orchestrator.state();
    if state != SyncState::Idle {
        orchestrator.stop();
        return Err(CliError::Blocked(state.to_string()));
    }

    if all {
        let status = orchestrator.status();
        let repo = status.repo_status;
        let dir = status.config.repo_dir;
        for path in repo
            .modified
            .iter()
            .chain(&repo.added)
            .chain(&repo.deleted)
            .chain(&repo.untracked)
        {
            orchestrator.notify_change(dir.join(path));
        }
        info!(files = orchestrator.pending().len(), "staged working copy changes");
    }

    let result = orchestrator.sync_now().await;
    orchestrator.stop();
    let result = result?;

    let summary = SyncSummary {
        pulled: result.pulled,
        committed: result
            .committed
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        pushed: result.pushed,
        duration_ms: result.duration.as_millis() as u64,
    };
    emit(format, &summary, |s| {
        if s.committed.is_empty() {
            println!("Pulled, nothing to commit");
        } else {
            println!("Committed {} file(s)", s.committed.len());
            for path in &s.committed {
                println!("  {path}");
            }
            if s.pushed {
                println!("Pushed");
            }
        }
        println!("Done in {} ms", s.duration_ms);
    })
}
