//! Change batching.
//!
//! [`ChangeBatcher`] is a pure counter/timer state machine: it owns the set of
//! uncommitted paths and decides when a commit should be requested, but it
//! never sleeps or spawns anything itself. The orchestrator turns each
//! [`BatchDecision`] into a timer or an immediate commit task.
//!
//! The debounce is single-flight. A notification arms the timer only when no
//! timer is outstanding; later notifications join the batch without pushing
//! the deadline back. Reaching the threshold disarms the debounce and asks
//! for an immediate flush, and until that flush is taken further
//! notifications only join the batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the caller must do after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Start the debounce timer for the given duration.
    ArmDebounce(Duration),
    /// Cancel any debounce timer and commit now.
    FlushNow,
    /// Nothing to do; a timer or flush is already outstanding.
    Wait,
}

/// Why a batch is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The threshold was reached.
    Threshold,
    /// The debounce timer fired.
    Debounce,
}

/// Paths handed out for one commit.
///
/// Each path keeps the notification sequence it had when the batch was
/// taken, so a path notified again mid-commit stays pending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<(PathBuf, u64)>,
}

impl Batch {
    /// Returns the paths of the batch in order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|(path, _)| path.clone()).collect()
    }

    /// Iterates over the paths of the batch.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(path, _)| path.as_path())
    }

    /// Number of paths in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch holds no paths.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Aggregates change notifications into commit requests.
#[derive(Debug, Clone)]
pub struct ChangeBatcher {
    threshold: usize,
    timeout: Duration,
    /// Pending paths with the sequence of their latest notification.
    pending: BTreeMap<PathBuf, u64>,
    next_seq: u64,
    debounce_armed: bool,
    flush_requested: bool,
}

impl ChangeBatcher {
    /// Creates a batcher. A threshold of zero is treated as one.
    pub fn new(threshold: usize, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            pending: BTreeMap::new(),
            next_seq: 0,
            debounce_armed: false,
            flush_requested: false,
        }
    }

    /// Records a changed path and returns the action to take.
    pub fn notify(&mut self, path: impl Into<PathBuf>) -> BatchDecision {
        self.next_seq += 1;
        self.pending.insert(path.into(), self.next_seq);

        if self.flush_requested {
            return BatchDecision::Wait;
        }
        if self.pending.len() >= self.threshold {
            self.debounce_armed = false;
            self.flush_requested = true;
            return BatchDecision::FlushNow;
        }
        if self.debounce_armed {
            return BatchDecision::Wait;
        }
        self.debounce_armed = true;
        BatchDecision::ArmDebounce(self.timeout)
    }

    /// Called when the debounce timer fires. Returns true if a flush should
    /// be attempted.
    pub fn debounce_fired(&mut self) -> bool {
        if !self.debounce_armed {
            return false;
        }
        self.debounce_armed = false;
        self.flush_requested = true;
        !self.pending.is_empty()
    }

    /// Hands out the current batch for committing.
    ///
    /// Paths stay pending until [`ChangeBatcher::acknowledge`] so a failed
    /// commit loses nothing.
    pub fn take_batch(&mut self) -> Batch {
        self.flush_requested = false;
        self.debounce_armed = false;
        Batch {
            entries: self
                .pending
                .iter()
                .map(|(path, seq)| (path.clone(), *seq))
                .collect(),
        }
    }

    /// Drops a flush request that could not run.
    pub fn release(&mut self) {
        self.flush_requested = false;
    }

    /// Removes committed paths, except those notified again since the batch
    /// was taken.
    pub fn acknowledge(&mut self, committed: &Batch) {
        for (path, seq) in &committed.entries {
            if self.pending.get(path) == Some(seq) {
                self.pending.remove(path);
            }
        }
    }

    /// Forgets outstanding timers and flush requests, keeping pending paths.
    pub fn cancel_timers(&mut self) {
        self.debounce_armed = false;
        self.flush_requested = false;
    }

    /// Re-arms the debounce for paths left over after a commit.
    pub fn rearm(&mut self) -> Option<Duration> {
        if self.pending.is_empty() || self.debounce_armed || self.flush_requested {
            return None;
        }
        self.debounce_armed = true;
        Some(self.timeout)
    }

    /// Number of distinct uncommitted paths.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the pending paths in order.
    pub fn pending(&self) -> impl Iterator<Item = &PathBuf> {
        self.pending.keys()
    }

    /// Returns true if a debounce timer is outstanding.
    pub fn is_debounce_armed(&self) -> bool {
        self.debounce_armed
    }

    /// Returns true if an immediate flush has been requested.
    pub fn is_flush_requested(&self) -> bool {
        self.flush_requested
    }
}
