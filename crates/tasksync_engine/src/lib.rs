//! # TaskSync Engine
//!
//! Keeps a local working copy of task records in step with a remote git
//! repository, without blocking its caller.
//!
//! This crate provides:
//! - Sync state machine (idle → pulling → committing → pushing → idle)
//! - Change batching with threshold and single-flight debounce
//! - Priority-queued retry with exponential backoff
//! - Branch status, protection and configuration tracking
//! - Snapshot and verified restore of engine state
//! - A VCS gateway abstraction with a `git` driver and an in-memory fake
//!
//! ## Architecture
//!
//! The orchestrator follows a **pull-then-commit-then-push** cycle:
//! 1. Pull remote changes first
//! 2. Stop in `CONFLICT` if the working copy reports conflicted files
//! 3. Commit the batched local changes, then push them
//!
//! All components publish onto a shared [`EventBus`]; UI collaborators
//! subscribe to it instead of polling.
//!
//! ## Key Invariants
//!
//! - State only moves along the edges of the state machine
//! - Pending changes survive any failed commit
//! - At most one queued operation runs at a time
//! - Restores re-verify their checksum before touching live state

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batcher;
mod branch;
mod config;
mod error;
mod events;
mod gateway;
mod git;
mod message;
mod retry;
mod snapshot;
mod state;
mod watcher;

pub use batcher::{Batch, BatchDecision, ChangeBatcher, FlushReason};
pub use branch::{
    BranchConfig, BranchConfigUpdate, BranchManager, BranchProtection, BranchResult, BranchStatus,
    BRANCH_CONFIG_SETTING, DEFAULT_SYNC_INTERVAL,
};
pub use config::{RetryConfig, SyncConfig};
pub use error::{BranchError, BranchErrorCode, StateError, StateResult, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent, DEFAULT_EVENT_CAPACITY};
pub use gateway::{
    is_nothing_to_commit, AddTarget, GatewayOp, MemoryGateway, RecordedCommit, RemoteBranch,
    RepoStatus, VcsGateway,
};
pub use git::GitGateway;
pub use message::{auto_commit_message, task_refs, AUTO_COMMIT_SUMMARY, PLACEHOLDER_REF};
pub use retry::{
    OperationInfo, OperationStatus, RetryManager, RetryStatus, PRIORITY_BACKGROUND,
    PRIORITY_INITIAL_FETCH, PRIORITY_USER,
};
pub use snapshot::{
    EngineState, RestoreOutcome, RestorePoint, RestoreVerification, StateManager, StateSnapshot,
    AUTO_BACKUP_TAG,
};
pub use state::{SyncCycleResult, SyncOrchestrator, SyncState, SyncStats, SyncStatus};
pub use watcher::{spawn_watcher, PollWatcher};
