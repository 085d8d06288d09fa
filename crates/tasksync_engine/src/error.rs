//! Error types for the sync engine.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for snapshot and restore operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// An attempt ran longer than its configured timeout.
    #[error("operation {operation} timed out")]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
    },

    /// Another process holds the repository lock.
    #[error("repository lock contention: {0}")]
    LockContention(String),

    /// The remote changes could not be merged automatically.
    #[error("merge conflict: {message}")]
    MergeConflict {
        /// Gateway output describing the conflict.
        message: String,
        /// Conflicted paths, when the gateway reported them.
        files: Vec<String>,
    },

    /// Authentication against the remote failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote repository does not exist or is unreachable by name.
    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    /// A VCS command failed for a reason that is not classified further.
    #[error("{command} failed: {message}")]
    Command {
        /// The command that failed.
        command: String,
        /// Captured error output.
        message: String,
    },

    /// The working directory is not a repository.
    #[error("not a repository: {0}")]
    NotARepository(PathBuf),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// All attempts of a queued operation failed.
    #[error("operation {operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Name of the operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: Box<SyncError>,
    },

    /// The operation was dropped before it could run.
    #[error("operation {0} cancelled")]
    Cancelled(String),

    /// Branch-level failure.
    #[error(transparent)]
    Branch(#[from] BranchError),

    /// Snapshot or restore failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a merge conflict error without a file list.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::MergeConflict {
            message: message.into(),
            files: Vec::new(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout { .. } | SyncError::LockContention(_) => true,
            SyncError::Io(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error reports a merge conflict, possibly wrapped.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::MergeConflict { .. } => true,
            SyncError::RetriesExhausted { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Machine-readable classification of a [`BranchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchErrorCode {
    /// Initial fetch of the current branch and statuses failed.
    InitFailed,
    /// The branch is not known to the manager.
    BranchNotFound,
    /// The branch is protected against this operation.
    BranchProtected,
    /// The operation requires the branch to be active.
    NotActive,
    /// The gateway failed to switch branches.
    SwitchFailed,
    /// Refreshing statuses failed.
    RefreshFailed,
    /// Push refused by branch policy.
    PushRejected,
    /// The gateway failed to push.
    PushFailed,
    /// The gateway failed to pull.
    PullFailed,
}

impl BranchErrorCode {
    /// Returns the stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchErrorCode::InitFailed => "INIT_FAILED",
            BranchErrorCode::BranchNotFound => "BRANCH_NOT_FOUND",
            BranchErrorCode::BranchProtected => "BRANCH_PROTECTED",
            BranchErrorCode::NotActive => "NOT_ACTIVE",
            BranchErrorCode::SwitchFailed => "SWITCH_FAILED",
            BranchErrorCode::RefreshFailed => "REFRESH_FAILED",
            BranchErrorCode::PushRejected => "PUSH_REJECTED",
            BranchErrorCode::PushFailed => "PUSH_FAILED",
            BranchErrorCode::PullFailed => "PULL_FAILED",
        }
    }
}

impl fmt::Display for BranchErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured branch operation failure.
#[derive(Error, Debug, Clone, Serialize)]
#[error("{operation} on branch '{branch}' failed ({code}): {message}")]
pub struct BranchError {
    /// Failure classification.
    pub code: BranchErrorCode,
    /// Branch the operation targeted.
    pub branch: String,
    /// Operation name.
    pub operation: String,
    /// Whether the caller may retry later.
    pub recoverable: bool,
    /// Human readable detail.
    pub message: String,
}

impl BranchError {
    /// Creates a branch error. Only [`BranchErrorCode::InitFailed`] is non-recoverable.
    pub fn new(
        code: BranchErrorCode,
        branch: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            branch: branch.into(),
            operation: operation.into(),
            recoverable: code != BranchErrorCode::InitFailed,
            message: message.into(),
        }
    }

    /// Wraps a gateway or retry error.
    pub fn wrap(
        code: BranchErrorCode,
        branch: impl Into<String>,
        operation: impl Into<String>,
        source: &SyncError,
    ) -> Self {
        Self::new(code, branch, operation, source.to_string())
    }
}

/// Errors raised by the snapshot and restore subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No snapshot with the given id exists.
    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),

    /// No restore point exists for the given snapshot id.
    #[error("Restore point {0} not found")]
    RestorePointNotFound(String),

    /// The stored snapshot no longer matches its restore point.
    #[error("State verification failed")]
    VerificationFailed {
        /// Checksum recorded by the restore point.
        expected: String,
        /// Checksum recomputed from the stored snapshot.
        actual: String,
    },

    /// A state failed its consistency check.
    #[error("invalid state: {0}")]
    InvalidState(String),
}
