//! Events published to UI collaborators.
//!
//! Every component publishes onto an [`EventBus`], a cloneable fan-out over a
//! tokio broadcast channel. Components built from the same bus share one
//! stream. Event names returned by [`SyncEvent::name`] and the serialized
//! `event` tag are a stable contract.

use crate::branch::{BranchConfig, BranchStatus};
use crate::retry::RetryStatus;
use crate::snapshot::RestoreVerification;
use crate::state::SyncStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SyncEvent {
    /// The orchestrator changed state. Carries the full status.
    Status(Box<SyncStatus>),
    /// A sync phase failed.
    Error {
        /// Error description.
        message: String,
    },
    /// A pull left conflicted files behind.
    Conflict {
        /// Conflicted paths.
        files: Vec<String>,
    },
    /// A pull succeeded.
    Pulled {
        /// Gateway output.
        output: String,
    },
    /// A commit succeeded.
    Committed {
        /// Commit message.
        message: String,
        /// Paths included in the commit.
        paths: Vec<String>,
        /// Gateway output.
        output: String,
    },
    /// A push succeeded.
    Pushed {
        /// Remote pushed to.
        remote: String,
        /// Branch pushed.
        branch: String,
        /// Gateway output.
        output: String,
    },
    /// The active branch changed.
    BranchChanged {
        /// Previously active branch.
        from: Option<String>,
        /// Newly active branch.
        to: String,
    },
    /// Branch statuses were refreshed.
    StatusesUpdated {
        /// All known branch statuses.
        statuses: Vec<BranchStatus>,
    },
    /// A queued operation failed an attempt and will be retried.
    OperationRetrying(RetryStatus),
    /// A queued operation succeeded.
    OperationComplete {
        /// Operation id.
        id: u64,
        /// Operation name.
        name: String,
        /// Attempts used.
        attempts: u32,
    },
    /// A queued operation failed terminally.
    OperationFailed {
        /// Operation id.
        id: u64,
        /// Operation name.
        name: String,
        /// Attempts used.
        attempts: u32,
        /// Final error.
        error: String,
    },
    /// A branch configuration changed.
    ConfigUpdated {
        /// Branch name.
        branch: String,
        /// Merged configuration.
        config: BranchConfig,
    },
    /// A snapshot was taken.
    SnapshotCreated {
        /// Snapshot id.
        id: String,
        /// Snapshot description.
        description: String,
        /// Snapshot tags.
        tags: Vec<String>,
    },
    /// A restore point was attached to a snapshot.
    RestorePointCreated {
        /// Snapshot id.
        snapshot_id: String,
        /// Verification record.
        verification: RestoreVerification,
    },
    /// Live state was replaced by a snapshot.
    StateRestored {
        /// Restored snapshot id.
        snapshot_id: String,
        /// Id of the automatic pre-restore backup.
        backup_id: String,
        /// State version after the restore.
        version: u64,
    },
}

impl SyncEvent {
    /// Returns the contract name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Status(_) => "status",
            SyncEvent::Error { .. } => "error",
            SyncEvent::Conflict { .. } => "conflict",
            SyncEvent::Pulled { .. } => "pulled",
            SyncEvent::Committed { .. } => "committed",
            SyncEvent::Pushed { .. } => "pushed",
            SyncEvent::BranchChanged { .. } => "branchChanged",
            SyncEvent::StatusesUpdated { .. } => "statusesUpdated",
            SyncEvent::OperationRetrying(_) => "operationRetrying",
            SyncEvent::OperationComplete { .. } => "operationComplete",
            SyncEvent::OperationFailed { .. } => "operationFailed",
            SyncEvent::ConfigUpdated { .. } => "configUpdated",
            SyncEvent::SnapshotCreated { .. } => "snapshotCreated",
            SyncEvent::RestorePointCreated { .. } => "restorePointCreated",
            SyncEvent::StateRestored { .. } => "stateRestored",
        }
    }
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
///
/// Emitting never blocks and never fails. Events sent while nobody listens
/// are dropped; a slow subscriber observes `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a bus buffering `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event.
    pub fn emit(&self, event: SyncEvent) {
        trace!(event = event.name(), "emit");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
