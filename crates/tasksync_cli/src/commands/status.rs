//! Status command implementation.

use super::{emit, open};
use crate::error::CliResult;
use crate::Format;
use tasksync_engine::{SyncConfig, SyncStatus};

/// Runs the status command.
pub async fn run(config: SyncConfig, format: Format) -> CliResult<()> {
    let orchestrator = open(config).await?;
    let status = orchestrator.status();
    orchestrator.stop();
    emit(format, &status, print_status)
}

fn print_status(status: &SyncStatus) {
    let repo = &status.repo_status;
    println!("Directory: {}", status.config.repo_dir.display());
    println!("State:     {}", status.state);
    println!("Branch:    {}", repo.branch);
    if let Some(error) = &status.error {
        println!("Error:     {error}");
    }

    let sections = [
        ("Conflicted", &repo.conflicted),
        ("Modified", &repo.modified),
        ("Added", &repo.added),
        ("Deleted", &repo.deleted),
        ("Untracked", &repo.untracked),
    ];
    if !repo.has_changes {
        println!("Working copy clean");
        return;
    }
    for (label, paths) in sections {
        if paths.is_empty() {
            continue;
        }
        println!("{label} ({}):", paths.len());
        for path in paths {
            println!("  {path}");
        }
    }
}
