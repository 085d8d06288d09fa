//! Sync orchestrator state machine.
//!
//! [`SyncOrchestrator`] drives the pull, commit and push cycle against a
//! [`VcsGateway`]. Its state only moves along the edges checked by
//! [`SyncState::can_transition_to`]; `initialize()` and `stop()` are the only
//! resets. Every transition publishes a full [`SyncStatus`].
//!
//! Locks are never held across an await. Long running work (sync cycles,
//! batched commits, auto-pull) runs in spawned tasks that capture the cycle
//! epoch; a cycle that finishes after `stop()` or a re-initialisation finds
//! a newer epoch and leaves state alone.

use crate::batcher::{Batch, BatchDecision, ChangeBatcher, FlushReason};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::gateway::{is_nothing_to_commit, AddTarget, RepoStatus, VcsGateway};
use crate::message::auto_commit_message;
use crate::watcher::{is_inside_git_dir, spawn_watcher};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// The current state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Waiting for work.
    Idle,
    /// Pulling from the remote.
    Pulling,
    /// Pushing to the remote.
    Pushing,
    /// Committing batched changes.
    Committing,
    /// A pull left conflicts that need external resolution.
    Conflict,
    /// A gateway call failed.
    Error,
    /// No repository has been confirmed yet.
    NotConfigured,
}

impl SyncState {
    /// Returns true while a pull, commit or push is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Committing
        )
    }

    /// Returns true if the machine has an edge from `self` to `next`.
    ///
    /// Resets performed by `initialize()` and `stop()` are not edges.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle, Pulling)
                | (Idle, Committing)
                | (Pulling, Idle)
                | (Pulling, Committing)
                | (Pulling, Conflict)
                | (Pulling, Error)
                | (Committing, Pushing)
                | (Committing, Idle)
                | (Committing, Error)
                | (Pushing, Idle)
                | (Pushing, Error)
        )
    }

    /// Returns the wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "IDLE",
            SyncState::Pulling => "PULLING",
            SyncState::Pushing => "PUSHING",
            SyncState::Committing => "COMMITTING",
            SyncState::Conflict => "CONFLICT",
            SyncState::Error => "ERROR",
            SyncState::NotConfigured => "NOT_CONFIGURED",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full status published on every transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current state.
    pub state: SyncState,
    /// End of the last completed cycle.
    pub last_sync: Option<DateTime<Utc>>,
    /// Distinct uncommitted changed paths.
    pub pending_changes: usize,
    /// Active configuration.
    pub config: SyncConfig,
    /// Last recorded error.
    pub error: Option<String>,
    /// Last working-copy status seen.
    pub repo_status: RepoStatus,
}

/// Counters about orchestrator activity.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Sync cycles started.
    pub cycles: u64,
    /// Successful pulls.
    pub pulls: u64,
    /// Successful commits.
    pub commits: u64,
    /// Successful pushes.
    pub pushes: u64,
    /// Conflicts entered.
    pub conflicts: u64,
    /// Errors entered.
    pub errors: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of [`SyncOrchestrator::sync_now`].
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Gateway output of the pull.
    pub pulled: String,
    /// Paths committed in this cycle.
    pub committed: Vec<PathBuf>,
    /// Whether a push ran.
    pub pushed: bool,
    /// Duration of the cycle.
    pub duration: Duration,
}

struct Core {
    status: SyncStatus,
    batcher: ChangeBatcher,
    stats: SyncStats,
    epoch: u64,
}

#[derive(Default)]
struct Tasks {
    auto_pull: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.auto_pull.take(),
            self.debounce.take(),
            self.watcher.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Outcome of a commit phase.
struct Committed {
    paths: Vec<PathBuf>,
    pushed: bool,
}

struct Inner<G: VcsGateway + 'static> {
    config: SyncConfig,
    gateway: Arc<G>,
    events: EventBus,
    core: Mutex<Core>,
    tasks: Mutex<Tasks>,
}

/// Coordinates pulls, batched commits and pushes for one working directory.
///
/// Cloning is cheap; clones drive the same orchestrator.
pub struct SyncOrchestrator<G: VcsGateway + 'static> {
    inner: Arc<Inner<G>>,
}

impl<G: VcsGateway + 'static> Clone for SyncOrchestrator<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: VcsGateway + 'static> SyncOrchestrator<G> {
    /// Creates an orchestrator with its own event bus.
    pub fn new(config: SyncConfig, gateway: Arc<G>) -> Self {
        Self::with_events(config, gateway, EventBus::new())
    }

    /// Creates an orchestrator publishing onto `events`.
    pub fn with_events(config: SyncConfig, gateway: Arc<G>, events: EventBus) -> Self {
        let batcher = ChangeBatcher::new(config.batch_commits_threshold, config.batch_commits_timeout);
        let status = SyncStatus {
            state: SyncState::NotConfigured,
            last_sync: None,
            pending_changes: 0,
            config: config.clone(),
            error: None,
            repo_status: RepoStatus::default(),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                events,
                core: Mutex::new(Core {
                    status,
                    batcher,
                    stats: SyncStats::default(),
                    epoch: 0,
                }),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Probes the repository and starts the watcher and auto-pull timer.
    ///
    /// Also the way out of `CONFLICT` and `ERROR` once the cause is resolved.
    pub async fn initialize(&self) -> SyncResult<SyncState> {
        Inner::initialize(&self.inner).await
    }

    /// Runs a full cycle: pull, then commit and push pending changes.
    ///
    /// Only runs from `IDLE`. Failures are recorded on the status before
    /// being returned.
    pub async fn sync_now(&self) -> SyncResult<SyncCycleResult> {
        Inner::sync_now(&self.inner).await
    }

    /// Records a changed path and schedules a batched commit.
    ///
    /// Must be called from within a tokio runtime.
    pub fn notify_change(&self, path: impl Into<PathBuf>) {
        Inner::notify_change(&self.inner, path.into());
    }

    /// Cancels the watcher and timers and resets to `IDLE`. Idempotent.
    ///
    /// In-flight gateway calls are not aborted; their results are discarded.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.inner.core.lock().status.clone()
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        self.inner.core.lock().status.state
    }

    /// Returns activity counters.
    pub fn stats(&self) -> SyncStats {
        self.inner.core.lock().stats.clone()
    }

    /// Returns the paths waiting to be committed.
    pub fn pending(&self) -> Vec<PathBuf> {
        self.inner.core.lock().batcher.pending().cloned().collect()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl<G: VcsGateway + 'static> Inner<G> {
    async fn initialize(this: &Arc<Self>) -> SyncResult<SyncState> {
        this.tasks.lock().abort_all();
        let epoch = {
            let mut core = this.core.lock();
            core.epoch += 1;
            core.batcher.cancel_timers();
            core.epoch
        };

        let repo = match this.gateway.status(&this.config.repo_dir).await {
            Ok(repo) => repo,
            Err(err) => {
                error!(error = %err, dir = %this.config.repo_dir.display(), "repository probe failed");
                this.reset(epoch, SyncState::Error, |status| {
                    status.error = Some(err.to_string());
                });
                this.record_error(&err);
                this.events.emit(SyncEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        if !repo.is_repo {
            warn!(dir = %this.config.repo_dir.display(), "not a repository");
            this.reset(epoch, SyncState::NotConfigured, |status| {
                status.repo_status = repo;
                status.error = None;
            });
            return Ok(SyncState::NotConfigured);
        }

        if repo.has_conflicts() {
            let files = repo.conflicted.clone();
            warn!(files = ?files, "repository still has conflicts");
            this.reset(epoch, SyncState::Conflict, |status| {
                status.repo_status = repo;
                status.error = Some("unresolved merge conflicts".to_string());
            });
            this.events.emit(SyncEvent::Conflict { files });
            return Ok(SyncState::Conflict);
        }

        let applied = this.reset(epoch, SyncState::Idle, |status| {
            status.repo_status = repo;
            status.error = None;
        });
        if applied {
            Self::start_watcher(this);
            Self::start_auto_pull(this);
            info!(dir = %this.config.repo_dir.display(), "sync orchestrator ready");
        }
        Ok(SyncState::Idle)
    }

    async fn sync_now(this: &Arc<Self>) -> SyncResult<SyncCycleResult> {
        let started = Instant::now();
        let (epoch, status) = {
            let mut core = this.core.lock();
            let current = core.status.state;
            if current != SyncState::Idle {
                return Err(SyncError::InvalidStateTransition {
                    from: current.to_string(),
                    to: SyncState::Pulling.to_string(),
                });
            }
            core.status.state = SyncState::Pulling;
            core.stats.cycles += 1;
            // The cycle picks up whatever is pending.
            core.batcher.cancel_timers();
            (core.epoch, core.status.clone())
        };
        if let Some(debounce) = this.tasks.lock().debounce.take() {
            debounce.abort();
        }
        this.events.emit(SyncEvent::Status(Box::new(status)));
        info!("sync cycle started");

        let pulled = this.pull_phase(epoch).await?;

        let batch = {
            let mut core = this.core.lock();
            if core.batcher.pending_len() == 0 {
                None
            } else {
                Some(core.batcher.take_batch())
            }
        };

        let committed = match batch {
            Some(batch) => {
                this.advance(epoch, SyncState::Committing, |_| {})?;
                Some(this.commit_phase(epoch, batch).await?)
            }
            None => None,
        };

        this.finish_cycle(epoch)?;
        Self::rearm(this);

        let result = SyncCycleResult {
            pulled,
            pushed: committed.as_ref().is_some_and(|c| c.pushed),
            committed: committed.map(|c| c.paths).unwrap_or_default(),
            duration: started.elapsed(),
        };
        info!(
            committed = result.committed.len(),
            pushed = result.pushed,
            duration_ms = result.duration.as_millis() as u64,
            "sync cycle complete"
        );
        Ok(result)
    }

    fn notify_change(this: &Arc<Self>, path: PathBuf) {
        if is_inside_git_dir(&path) {
            return;
        }
        let decision = {
            let mut core = this.core.lock();
            let decision = core.batcher.notify(path);
            core.status.pending_changes = core.batcher.pending_len();
            decision
        };

        match decision {
            BatchDecision::ArmDebounce(delay) => Self::schedule_debounce(this, delay),
            BatchDecision::FlushNow => {
                if let Some(debounce) = this.tasks.lock().debounce.take() {
                    debounce.abort();
                }
                debug!("batch threshold reached");
                tokio::spawn(Self::flush(Arc::clone(this), FlushReason::Threshold));
            }
            BatchDecision::Wait => {}
        }
    }

    fn stop(&self) {
        self.tasks.lock().abort_all();
        let status = {
            let mut core = self.core.lock();
            core.epoch += 1;
            core.batcher.cancel_timers();
            if core.status.state == SyncState::Idle && core.status.error.is_none() {
                None
            } else {
                core.status.state = SyncState::Idle;
                core.status.error = None;
                Some(core.status.clone())
            }
        };
        if let Some(status) = status {
            info!("sync orchestrator stopped");
            self.events.emit(SyncEvent::Status(Box::new(status)));
        }
    }

    /// Pulls, then checks the working copy for conflicts.
    async fn pull_phase(&self, epoch: u64) -> SyncResult<String> {
        let dir = &self.config.repo_dir;
        let output = match self.gateway.pull(dir).await {
            Ok(output) => output,
            Err(err) => return Err(self.fail_pull(epoch, err).await),
        };
        self.core.lock().stats.pulls += 1;
        self.events.emit(SyncEvent::Pulled {
            output: output.clone(),
        });

        let repo = match self.gateway.status(dir).await {
            Ok(repo) => repo,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        if repo.has_conflicts() {
            let files = repo.conflicted.clone();
            let err = SyncError::MergeConflict {
                message: "pull left conflicted files".to_string(),
                files: files.clone(),
            };
            self.enter_conflict(epoch, &err, files, Some(repo));
            return Err(err);
        }
        self.core.lock().status.repo_status = repo;
        Ok(output)
    }

    /// Adds and commits `batch`, then pushes when enabled. Expects
    /// `COMMITTING`.
    async fn commit_phase(&self, epoch: u64, batch: Batch) -> SyncResult<Committed> {
        let dir = &self.config.repo_dir;
        let paths = batch.paths();
        let message = auto_commit_message(&paths);

        let commit = async {
            self.gateway
                .add(&AddTarget::Paths(paths.clone()), dir)
                .await?;
            self.gateway.commit(&message, dir).await
        };
        let output = match commit.await {
            Ok(output) => output,
            Err(err) => {
                self.core.lock().batcher.release();
                return Err(self.fail(epoch, err));
            }
        };

        let made_commit = !is_nothing_to_commit(&output);
        {
            let mut core = self.core.lock();
            core.batcher.acknowledge(&batch);
            core.status.pending_changes = core.batcher.pending_len();
            if made_commit {
                core.stats.commits += 1;
            }
        }
        if !made_commit {
            debug!(files = paths.len(), "nothing to commit, push skipped");
            return Ok(Committed {
                paths: Vec::new(),
                pushed: false,
            });
        }

        info!(files = paths.len(), %message, "committed");
        self.events.emit(SyncEvent::Committed {
            message,
            paths: paths.iter().map(|p| self.display_path(p)).collect(),
            output,
        });

        if !self.config.auto_push_enabled {
            return Ok(Committed {
                paths,
                pushed: false,
            });
        }

        self.advance(epoch, SyncState::Pushing, |_| {})?;
        let branch = match self.push_target().await {
            Ok(branch) => branch,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        let output = match self.gateway.push(&self.config.remote, &branch, dir).await {
            Ok(output) => output,
            Err(err) => return Err(self.fail(epoch, err)),
        };
        self.core.lock().stats.pushes += 1;
        info!(remote = %self.config.remote, %branch, "pushed");
        self.events.emit(SyncEvent::Pushed {
            remote: self.config.remote.clone(),
            branch,
            output,
        });

        Ok(Committed {
            paths,
            pushed: true,
        })
    }

    async fn flush(this: Arc<Self>, reason: FlushReason) {
        let started = {
            let mut core = this.core.lock();
            if core.status.state != SyncState::Idle || core.batcher.pending_len() == 0 {
                core.batcher.release();
                None
            } else {
                let batch = core.batcher.take_batch();
                core.status.state = SyncState::Committing;
                Some((core.epoch, batch, core.status.clone()))
            }
        };
        let Some((epoch, batch, status)) = started else {
            debug!(?reason, "batched commit skipped");
            return;
        };
        this.events.emit(SyncEvent::Status(Box::new(status)));
        debug!(?reason, files = batch.len(), "flushing batch");

        if this.commit_phase(epoch, batch).await.is_ok() && this.finish_cycle(epoch).is_ok() {
            Self::rearm(&this);
        }
    }

    async fn auto_pull(this: &Arc<Self>) {
        let started = {
            let mut core = this.core.lock();
            if core.status.state != SyncState::Idle {
                None
            } else {
                core.status.state = SyncState::Pulling;
                Some((core.epoch, core.status.clone()))
            }
        };
        let Some((epoch, status)) = started else {
            debug!("auto-pull skipped, orchestrator busy");
            return;
        };
        this.events.emit(SyncEvent::Status(Box::new(status)));

        if this.pull_phase(epoch).await.is_ok() && this.finish_cycle(epoch).is_ok() {
            Self::rearm(this);
        }
    }

    fn schedule_debounce(this: &Arc<Self>, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let fire = inner.core.lock().batcher.debounce_fired();
            if fire {
                // Detached so aborting the timer never interrupts a commit.
                tokio::spawn(Self::flush(inner, FlushReason::Debounce));
            }
        });
        if let Some(previous) = this.tasks.lock().debounce.replace(handle) {
            previous.abort();
        }
    }

    /// Arms a debounce for changes that arrived while a cycle was running.
    fn rearm(this: &Arc<Self>) {
        let delay = this.core.lock().batcher.rearm();
        if let Some(delay) = delay {
            debug!("changes left after cycle, debounce re-armed");
            Self::schedule_debounce(this, delay);
        }
    }

    fn start_watcher(this: &Arc<Self>) {
        let roots = this.config.resolved_watch_paths();
        if roots.is_empty() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(this);
        let handle = spawn_watcher(roots, this.config.watch_poll_interval, move |path| {
            if let Some(inner) = weak.upgrade() {
                Self::notify_change(&inner, path);
            }
        });
        if let Some(previous) = this.tasks.lock().watcher.replace(handle) {
            previous.abort();
        }
    }

    fn start_auto_pull(this: &Arc<Self>) {
        let interval = this.config.auto_pull_interval;
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(this);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Self::auto_pull(&inner).await;
            }
        });
        if let Some(previous) = this.tasks.lock().auto_pull.replace(handle) {
            previous.abort();
        }
    }

    async fn push_target(&self) -> SyncResult<String> {
        if let Some(branch) = &self.config.branch {
            return Ok(branch.clone());
        }
        let known = self.core.lock().status.repo_status.branch.clone();
        if !known.is_empty() {
            return Ok(known);
        }
        self.gateway.current_branch(&self.config.repo_dir).await
    }

    /// Moves along an edge of the machine, unless the cycle went stale.
    fn advance<F>(&self, epoch: u64, next: SyncState, update: F) -> SyncResult<()>
    where
        F: FnOnce(&mut SyncStatus),
    {
        let status = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return Err(SyncError::Cancelled("sync cycle".to_string()));
            }
            let current = core.status.state;
            if !current.can_transition_to(next) {
                return Err(SyncError::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            core.status.state = next;
            update(&mut core.status);
            core.status.clone()
        };
        debug!(state = %next, "transition");
        self.events.emit(SyncEvent::Status(Box::new(status)));
        Ok(())
    }

    /// Resets to `next` regardless of the current state. Returns false if
    /// the epoch moved on.
    fn reset<F>(&self, epoch: u64, next: SyncState, update: F) -> bool
    where
        F: FnOnce(&mut SyncStatus),
    {
        let status = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return false;
            }
            core.status.state = next;
            update(&mut core.status);
            core.status.clone()
        };
        self.events.emit(SyncEvent::Status(Box::new(status)));
        true
    }

    fn finish_cycle(&self, epoch: u64) -> SyncResult<()> {
        self.advance(epoch, SyncState::Idle, |status| {
            status.last_sync = Some(Utc::now());
            status.error = None;
        })
    }

    /// Classifies a failed pull. The working copy is consulted because some
    /// gateways only report conflicts through `status`.
    async fn fail_pull(&self, epoch: u64, err: SyncError) -> SyncError {
        let repo = self.gateway.status(&self.config.repo_dir).await.ok();
        match repo {
            Some(repo) if repo.has_conflicts() => {
                let files = repo.conflicted.clone();
                self.enter_conflict(epoch, &err, files, Some(repo));
                err
            }
            _ if err.is_conflict() => {
                let files = match &err {
                    SyncError::MergeConflict { files, .. } => files.clone(),
                    _ => Vec::new(),
                };
                self.enter_conflict(epoch, &err, files, None);
                err
            }
            _ => self.fail(epoch, err),
        }
    }

    fn enter_conflict(&self, epoch: u64, err: &SyncError, files: Vec<String>, repo: Option<RepoStatus>) {
        warn!(files = ?files, "merge conflict");
        let entered = self
            .advance(epoch, SyncState::Conflict, |status| {
                status.error = Some(err.to_string());
                if let Some(repo) = repo {
                    status.repo_status = repo;
                }
            })
            .is_ok();
        if entered {
            {
                let mut core = self.core.lock();
                core.stats.conflicts += 1;
                core.stats.last_error = Some(err.to_string());
            }
            self.events.emit(SyncEvent::Conflict { files });
        }
    }

    /// Records `err` and enters `ERROR`. Returns `err` for propagation.
    fn fail(&self, epoch: u64, err: SyncError) -> SyncError {
        error!(error = %err, "sync failed");
        let entered = self
            .advance(epoch, SyncState::Error, |status| {
                status.error = Some(err.to_string());
            })
            .is_ok();
        if entered {
            self.record_error(&err);
            self.events.emit(SyncEvent::Error {
                message: err.to_string(),
            });
        }
        err
    }

    fn record_error(&self, err: &SyncError) {
        let mut core = self.core.lock();
        core.stats.errors += 1;
        core.stats.last_error = Some(err.to_string());
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.config.repo_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

impl<G: VcsGateway + 'static> Drop for Inner<G> {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayOp, MemoryGateway};

    fn config() -> SyncConfig {
        SyncConfig::new("/records")
            .with_batch_threshold(5)
            .with_batch_timeout(Duration::from_secs(30))
            .with_auto_pull_interval(Duration::ZERO)
    }

    async fn ready(config: SyncConfig) -> (Arc<MemoryGateway>, SyncOrchestrator<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        let orchestrator = SyncOrchestrator::new(config, Arc::clone(&gateway));
        assert_eq!(orchestrator.initialize().await.unwrap(), SyncState::Idle);
        (gateway, orchestrator)
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SyncEvent]) -> Vec<SyncState> {
        events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Status(status) => Some(status.state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn transition_table() {
        assert!(SyncState::Idle.can_transition_to(SyncState::Pulling));
        assert!(SyncState::Pulling.can_transition_to(SyncState::Conflict));
        assert!(SyncState::Committing.can_transition_to(SyncState::Pushing));
        assert!(!SyncState::Conflict.can_transition_to(SyncState::Pulling));
        assert!(!SyncState::Error.can_transition_to(SyncState::Idle));
        assert!(!SyncState::NotConfigured.can_transition_to(SyncState::Pulling));
        assert!(!SyncState::Idle.can_transition_to(SyncState::Pushing));
    }

    #[test]
    fn state_serializes_to_wire_names() {
        let json = serde_json::to_string(&SyncState::NotConfigured).unwrap();
        assert_eq!(json, "\"NOT_CONFIGURED\"");
        assert_eq!(SyncState::Committing.to_string(), "COMMITTING");
    }

    #[tokio::test(start_paused = true)]
    async fn starts_not_configured() {
        let orchestrator = SyncOrchestrator::new(config(), Arc::new(MemoryGateway::new()));
        assert_eq!(orchestrator.state(), SyncState::NotConfigured);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_outside_repository() {
        let orchestrator = SyncOrchestrator::new(config(), Arc::new(MemoryGateway::not_a_repo()));
        assert_eq!(
            orchestrator.initialize().await.unwrap(),
            SyncState::NotConfigured
        );
        assert!(orchestrator.sync_now().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_without_changes_only_pulls() {
        let (gateway, orchestrator) = ready(config()).await;
        let mut rx = orchestrator.subscribe();

        let result = orchestrator.sync_now().await.unwrap();

        assert!(result.committed.is_empty());
        assert!(!result.pushed);
        assert_eq!(gateway.call_count(GatewayOp::Pull), 1);
        assert!(gateway.commits().is_empty());

        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![SyncState::Pulling, SyncState::Idle]);
        assert!(events.iter().any(|e| e.name() == "pulled"));
        assert!(orchestrator.status().last_sync.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_commits_and_pushes_pending_changes() {
        let (gateway, orchestrator) = ready(config()).await;
        orchestrator.notify_change("/records/tasks/TSK-7.md");
        let mut rx = orchestrator.subscribe();

        let result = orchestrator.sync_now().await.unwrap();

        assert_eq!(result.committed, vec![PathBuf::from("/records/tasks/TSK-7.md")]);
        assert!(result.pushed);
        assert_eq!(gateway.commits()[0].message, "[TSK-7] chore: auto-sync task updates");
        assert_eq!(gateway.pushes(), vec![("origin".to_string(), "main".to_string())]);
        assert_eq!(orchestrator.status().pending_changes, 0);

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                SyncState::Pulling,
                SyncState::Committing,
                SyncState::Pushing,
                SyncState::Idle
            ]
        );
        let names: Vec<_> = events.iter().map(SyncEvent::name).collect();
        let committed = names.iter().position(|n| *n == "committed").unwrap();
        let pushed = names.iter().position(|n| *n == "pushed").unwrap();
        assert!(committed < pushed);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_burst_commits_once_without_waiting() {
        let (gateway, orchestrator) = ready(config()).await;
        let started = tokio::time::Instant::now();

        for i in 1..=6 {
            orchestrator.notify_change(format!("/records/tasks/TSK-{i}.md"));
        }
        assert_eq!(orchestrator.status().pending_changes, 6);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let commits = gateway.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].paths.len(), 6);
        assert_eq!(orchestrator.status().pending_changes, 0);
        assert_eq!(orchestrator.state(), SyncState::Idle);
        assert!(started.elapsed() < Duration::from_secs(30));

        // The cancelled debounce never fires a second commit.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.commits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_commits_after_timeout() {
        let (gateway, orchestrator) = ready(config().with_auto_push(false)).await;

        orchestrator.notify_change("/records/tasks/TSK-1.md");
        tokio::time::sleep(Duration::from_secs(10)).await;
        orchestrator.notify_change("/records/tasks/TSK-2.md");

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(gateway.commits().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let commits = gateway.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].paths.len(), 2);
        assert!(gateway.pushes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_keeps_changes() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.fail_next(GatewayOp::Commit, SyncError::LockContention("index.lock".into()));

        orchestrator.notify_change("/records/tasks/TSK-1.md");
        let err = orchestrator.sync_now().await.unwrap_err();

        assert!(matches!(err, SyncError::LockContention(_)));
        let status = orchestrator.status();
        assert_eq!(status.state, SyncState::Error);
        assert!(status.error.unwrap().contains("index.lock"));
        assert_eq!(status.pending_changes, 1);
        assert_eq!(orchestrator.pending(), vec![PathBuf::from("/records/tasks/TSK-1.md")]);

        assert_eq!(orchestrator.initialize().await.unwrap(), SyncState::Idle);
        let result = orchestrator.sync_now().await.unwrap();
        assert_eq!(result.committed.len(), 1);
        assert_eq!(orchestrator.stats().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn change_renotified_during_commit_stays_pending() {
        let (gateway, orchestrator) = ready(config().with_auto_push(false)).await;
        gateway.set_latency(GatewayOp::Commit, Duration::from_secs(5));
        orchestrator.notify_change("/records/tasks/TSK-1.md");

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.sync_now().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orchestrator.state(), SyncState::Committing);
        orchestrator.notify_change("/records/tasks/TSK-1.md");
        orchestrator.notify_change("/records/tasks/TSK-2.md");

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.committed, vec![PathBuf::from("/records/tasks/TSK-1.md")]);
        assert_eq!(
            orchestrator.pending(),
            vec![
                PathBuf::from("/records/tasks/TSK-1.md"),
                PathBuf::from("/records/tasks/TSK-2.md")
            ]
        );
        assert_eq!(orchestrator.status().pending_changes, 2);

        // The debounce armed mid-commit picks up the second edit.
        tokio::time::sleep(Duration::from_secs(40)).await;
        let commits = gateway.commits();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[1].paths.len(), 2);
        assert!(orchestrator.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_failed_commit_is_kept() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.set_latency(GatewayOp::Commit, Duration::from_secs(5));
        gateway.fail_next(GatewayOp::Commit, SyncError::LockContention("index.lock".into()));
        orchestrator.notify_change("/records/tasks/TSK-1.md");

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.sync_now().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.notify_change("/records/tasks/TSK-1.md");
        orchestrator.notify_change("/records/tasks/TSK-2.md");

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::LockContention(_)));
        assert_eq!(orchestrator.state(), SyncState::Error);
        assert_eq!(orchestrator.status().pending_changes, 2);

        assert_eq!(orchestrator.initialize().await.unwrap(), SyncState::Idle);
        let result = orchestrator.sync_now().await.unwrap();
        assert_eq!(
            result.committed,
            vec![
                PathBuf::from("/records/tasks/TSK-1.md"),
                PathBuf::from("/records/tasks/TSK-2.md")
            ]
        );
        assert!(orchestrator.pending().is_empty());
        assert_eq!(gateway.commits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_conflict_reported_through_status() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.simulate_conflict(["tasks/TSK-3.md", "epics/EP-1.md"]);
        let mut rx = orchestrator.subscribe();

        let err = orchestrator.sync_now().await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(orchestrator.state(), SyncState::Conflict);
        let files = drain(&mut rx).into_iter().find_map(|e| match e {
            SyncEvent::Conflict { files } => Some(files),
            _ => None,
        });
        assert_eq!(
            files,
            Some(vec!["tasks/TSK-3.md".to_string(), "epics/EP-1.md".to_string()])
        );
        assert!(orchestrator.sync_now().await.is_err());
        assert_eq!(orchestrator.initialize().await.unwrap(), SyncState::Conflict);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_enters_error() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.fail_next(GatewayOp::Pull, SyncError::AuthenticationFailed("denied".into()));
        let mut rx = orchestrator.subscribe();

        assert!(orchestrator.sync_now().await.is_err());
        assert_eq!(orchestrator.state(), SyncState::Error);
        assert!(drain(&mut rx).iter().any(|e| e.name() == "error"));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_rejected_while_busy() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.set_latency(GatewayOp::Pull, Duration::from_secs(5));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.sync_now().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orchestrator.state(), SyncState::Pulling);
        assert!(matches!(
            orchestrator.sync_now().await,
            Err(SyncError::InvalidStateTransition { .. })
        ));
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn changes_during_cycle_are_buffered() {
        let (gateway, orchestrator) = ready(config().with_batch_timeout(Duration::from_secs(1))).await;
        gateway.set_latency(GatewayOp::Pull, Duration::from_secs(5));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.sync_now().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        orchestrator.notify_change("/records/tasks/TSK-9.md");

        // The debounce fires mid-cycle and is skipped.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(gateway.commits().is_empty());

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.committed, vec![PathBuf::from("/records/tasks/TSK-9.md")]);
        assert_eq!(orchestrator.status().pending_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_resets() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.fail_next(GatewayOp::Pull, SyncError::transport_fatal("offline"));
        let _ = orchestrator.sync_now().await;
        assert_eq!(orchestrator.state(), SyncState::Error);

        let mut rx = orchestrator.subscribe();
        orchestrator.stop();
        orchestrator.stop();
        assert_eq!(orchestrator.state(), SyncState::Idle);
        assert_eq!(states(&drain(&mut rx)), vec![SyncState::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_debounce() {
        let (gateway, orchestrator) = ready(config()).await;
        orchestrator.notify_change("/records/tasks/TSK-1.md");
        orchestrator.stop();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(gateway.commits().is_empty());
        assert_eq!(orchestrator.status().pending_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cycle_does_not_overwrite_stop() {
        let (gateway, orchestrator) = ready(config()).await;
        gateway.set_latency(GatewayOp::Pull, Duration::from_secs(5));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.sync_now().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        orchestrator.stop();

        let result = running.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
        assert_eq!(orchestrator.state(), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_pull_runs_only_when_idle() {
        let (gateway, orchestrator) =
            ready(config().with_auto_pull_interval(Duration::from_secs(60))).await;

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(gateway.call_count(GatewayOp::Pull), 2);

        gateway.fail_next(GatewayOp::Pull, SyncError::transport_fatal("offline"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(orchestrator.state(), SyncState::Error);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.call_count(GatewayOp::Pull), 3);
        orchestrator.stop();
    }
}
