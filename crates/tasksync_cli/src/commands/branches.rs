//! Branch commands.

use super::emit;
use crate::error::CliResult;
use crate::Format;
use std::sync::Arc;
use tasksync_engine::{
    BranchManager, BranchStatus, EventBus, GitGateway, RetryConfig, RetryManager, SyncConfig,
};

async fn manager(config: &SyncConfig) -> CliResult<BranchManager<GitGateway>> {
    let events = EventBus::new();
    let retry = Arc::new(RetryManager::new(RetryConfig::default(), events.clone()));
    let manager = BranchManager::new(
        Arc::new(GitGateway::new()),
        &config.repo_dir,
        retry,
        events,
    )
    .with_remote(config.remote.clone());
    manager.initialize().await?;
    Ok(manager)
}

/// Lists branch statuses.
pub async fn list(config: SyncConfig, format: Format) -> CliResult<()> {
    let manager = manager(&config).await?;
    emit(format, &manager.statuses(), |statuses| print_statuses(statuses))
}

/// Checks out `name` and lists the refreshed statuses.
pub async fn switch(config: SyncConfig, name: &str, format: Format) -> CliResult<()> {
    let manager = manager(&config).await?;
    manager.switch_branch(name).await?;
    emit(format, &manager.statuses(), |statuses| {
        println!("Switched to {name}");
        print_statuses(statuses);
    })
}

fn print_statuses(statuses: &[BranchStatus]) {
    for status in statuses {
        let marker = if status.is_active { '*' } else { ' ' };
        let conflicts = if status.has_conflicts { " conflicts" } else { "" };
        println!(
            "{marker} {:<30} ahead {:<4} behind {:<4}{conflicts}",
            status.name, status.ahead, status.behind
        );
    }
}
