//! Watch command implementation.

use super::open;
use crate::error::CliResult;
use std::path::PathBuf;
use tasksync_engine::{SyncConfig, SyncEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Runs the watch command until Ctrl-C.
pub async fn run(mut config: SyncConfig, paths: Vec<PathBuf>) -> CliResult<()> {
    config.watched_paths.extend(paths);
    if config.watched_paths.is_empty() {
        config.watched_paths.push(PathBuf::from("."));
    }

    let orchestrator = open(config).await?;
    let mut events = orchestrator.subscribe();
    info!(state = %orchestrator.state(), "watching for changes, press Ctrl-C to stop");

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "cannot listen for Ctrl-C");
                }
                break;
            }
        }
    }

    orchestrator.stop();
    info!("stopped");
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Status(status) => info!(state = %status.state, pending = status.pending_changes, "status"),
        SyncEvent::Error { message } => error!(%message, "sync error"),
        SyncEvent::Conflict { files } => warn!(?files, "merge conflict, resolve and restart"),
        SyncEvent::Committed { message, paths, .. } => info!(files = paths.len(), %message, "committed"),
        SyncEvent::Pushed { remote, branch, .. } => info!(%remote, %branch, "pushed"),
        other => info!(event = other.name(), "{}", serde_json::to_string(other).unwrap_or_default()),
    }
}
