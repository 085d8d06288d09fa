//! Per-branch status, protection and configuration tracking.
//!
//! [`BranchManager`] keeps the last known status of every local branch. The
//! tracking numbers (`ahead`, `behind`, `has_conflicts`, `last_sync`) are
//! only ever taken from the gateway by [`BranchManager::refresh_branch_statuses`]
//! and are never inferred locally, so they may be stale between refreshes.
//! Every gateway call is routed through the shared [`RetryManager`].

use crate::config::duration_ms;
use crate::error::{BranchError, BranchErrorCode};
use crate::events::{EventBus, SyncEvent};
use crate::gateway::VcsGateway;
use crate::retry::{RetryManager, PRIORITY_BACKGROUND, PRIORITY_INITIAL_FETCH, PRIORITY_USER};
use crate::snapshot::EngineState;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result type for branch operations.
pub type BranchResult<T> = Result<T, BranchError>;

/// Settings key under which branch configurations travel in [`EngineState`].
pub const BRANCH_CONFIG_SETTING: &str = "branchConfigs";

/// Default interval for `require_sync` branches.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Branch protection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchProtection {
    /// Pushing is refused while the branch is behind its upstream.
    pub require_pull_before_push: bool,
    /// Force pushes are never issued.
    pub prevent_force_push: bool,
    /// The branch must be synced at least every `sync_interval_ms`.
    pub require_sync: bool,
    /// Maximum time between syncs when `require_sync` is set.
    pub sync_interval_ms: u64,
}

impl Default for BranchProtection {
    fn default() -> Self {
        Self {
            require_pull_before_push: false,
            prevent_force_push: true,
            require_sync: false,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL.as_millis() as u64,
        }
    }
}

/// Last known status of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchStatus {
    /// Branch name.
    pub name: String,
    /// Whether this is the checked out branch.
    pub is_active: bool,
    /// When the status was last refreshed from the gateway.
    pub last_sync: Option<DateTime<Utc>>,
    /// Commits not yet on the upstream.
    pub ahead: u32,
    /// Upstream commits not yet local.
    pub behind: u32,
    /// Whether the branch has unresolved conflicts.
    pub has_conflicts: bool,
    /// Protection policy.
    pub protection: BranchProtection,
}

impl BranchStatus {
    /// Creates an untracked status for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_active: false,
            last_sync: None,
            ahead: 0,
            behind: 0,
            has_conflicts: false,
            protection: BranchProtection::default(),
        }
    }
}

/// Per-branch sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchConfig {
    /// Pull automatically.
    pub auto_pull: bool,
    /// Push automatically.
    pub auto_push: bool,
    /// Switching to and pushing the branch is refused.
    pub protected: bool,
    /// Changes must go through a pull request.
    pub require_pull_request: bool,
    /// Sync interval.
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            auto_pull: true,
            auto_push: true,
            protected: false,
            require_pull_request: false,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// A partial [`BranchConfig`]. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchConfigUpdate {
    /// New `auto_pull`.
    pub auto_pull: Option<bool>,
    /// New `auto_push`.
    pub auto_push: Option<bool>,
    /// New `protected`.
    pub protected: Option<bool>,
    /// New `require_pull_request`.
    pub require_pull_request: Option<bool>,
    /// New `sync_interval`.
    pub sync_interval: Option<Duration>,
}

impl BranchConfigUpdate {
    /// Marks the branch protected or unprotected.
    pub fn protected(protected: bool) -> Self {
        Self {
            protected: Some(protected),
            ..Self::default()
        }
    }

    fn apply(&self, config: &mut BranchConfig) {
        if let Some(v) = self.auto_pull {
            config.auto_pull = v;
        }
        if let Some(v) = self.auto_push {
            config.auto_push = v;
        }
        if let Some(v) = self.protected {
            config.protected = v;
        }
        if let Some(v) = self.require_pull_request {
            config.require_pull_request = v;
        }
        if let Some(v) = self.sync_interval {
            config.sync_interval = v;
        }
    }
}

#[derive(Debug, Default)]
struct BranchTable {
    statuses: BTreeMap<String, BranchStatus>,
    configs: BTreeMap<String, BranchConfig>,
    protections: BTreeMap<String, BranchProtection>,
    active: Option<String>,
}

impl BranchTable {
    fn is_protected(&self, name: &str) -> bool {
        self.configs.get(name).is_some_and(|c| c.protected)
    }

    fn mark_active(&mut self) {
        for (name, status) in self.statuses.iter_mut() {
            status.is_active = self.active.as_deref() == Some(name.as_str());
        }
    }
}

/// Tracks branch statuses and mediates branch operations.
pub struct BranchManager<G: VcsGateway + 'static> {
    gateway: Arc<G>,
    dir: PathBuf,
    remote: String,
    retry: Arc<RetryManager>,
    events: EventBus,
    table: RwLock<BranchTable>,
    auto_refresh: Mutex<Option<JoinHandle<()>>>,
}

impl<G: VcsGateway + 'static> BranchManager<G> {
    /// Creates a manager for the repository at `dir`.
    pub fn new(
        gateway: Arc<G>,
        dir: impl Into<PathBuf>,
        retry: Arc<RetryManager>,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            dir: dir.into(),
            remote: "origin".to_string(),
            retry,
            events,
            table: RwLock::new(BranchTable::default()),
            auto_refresh: Mutex::new(None),
        }
    }

    /// Sets the remote used by [`BranchManager::push_branch`].
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Fetches the current branch and all statuses at initial-fetch priority.
    pub async fn initialize(&self) -> BranchResult<()> {
        let gateway = Arc::clone(&self.gateway);
        let dir = self.dir.clone();
        let current = self
            .retry
            .enqueue("getCurrentBranch", PRIORITY_INITIAL_FETCH, None, move || {
                let gateway = Arc::clone(&gateway);
                let dir = dir.clone();
                async move { gateway.current_branch(&dir).await }
            })
            .await
            .map_err(|e| BranchError::wrap(BranchErrorCode::InitFailed, "", "initialize", &e))?;

        self.table.write().active = Some(current.clone());
        self.refresh_at(PRIORITY_INITIAL_FETCH)
            .await
            .map_err(|e| BranchError::new(BranchErrorCode::InitFailed, &current, "initialize", e.message))?;

        info!(branch = %current, "branch manager initialized");
        Ok(())
    }

    /// Refreshes every branch status from the gateway at background priority.
    pub async fn refresh_branch_statuses(&self) -> BranchResult<Vec<BranchStatus>> {
        self.refresh_at(PRIORITY_BACKGROUND).await
    }

    async fn refresh_at(&self, priority: i32) -> BranchResult<Vec<BranchStatus>> {
        let gateway = Arc::clone(&self.gateway);
        let dir = self.dir.clone();
        let branches = self
            .retry
            .enqueue("fetchBranchStatuses", priority, None, move || {
                let gateway = Arc::clone(&gateway);
                let dir = dir.clone();
                async move { gateway.branches(&dir).await }
            })
            .await
            .map_err(|e| {
                let active = self.active_branch().unwrap_or_default();
                BranchError::wrap(BranchErrorCode::RefreshFailed, active, "refreshBranchStatuses", &e)
            })?;

        let now = Utc::now();
        let statuses = {
            let mut table = self.table.write();
            let mut refreshed = BTreeMap::new();
            for remote in branches {
                let protection = table
                    .protections
                    .get(&remote.name)
                    .cloned()
                    .unwrap_or_default();
                refreshed.insert(
                    remote.name.clone(),
                    BranchStatus {
                        name: remote.name,
                        is_active: false,
                        last_sync: Some(now),
                        ahead: remote.ahead,
                        behind: remote.behind,
                        has_conflicts: remote.has_conflicts,
                        protection,
                    },
                );
            }
            // A freshly created branch may not be listed yet.
            if let Some(active) = table.active.clone() {
                refreshed.entry(active.clone()).or_insert_with(|| {
                    let mut status = BranchStatus::new(&active);
                    status.protection = table.protections.get(&active).cloned().unwrap_or_default();
                    status
                });
            }
            table.statuses = refreshed;
            table.mark_active();
            table.statuses.values().cloned().collect::<Vec<_>>()
        };

        debug!(count = statuses.len(), "branch statuses refreshed");
        self.events.emit(SyncEvent::StatusesUpdated {
            statuses: statuses.clone(),
        });
        Ok(statuses)
    }

    /// Checks out `name`.
    ///
    /// Unknown and protected branches are refused without touching the
    /// gateway.
    pub async fn switch_branch(&self, name: &str) -> BranchResult<()> {
        let previous = {
            let table = self.table.read();
            if !table.statuses.contains_key(name) {
                return Err(BranchError::new(
                    BranchErrorCode::BranchNotFound,
                    name,
                    "switchBranch",
                    "branch is not known",
                ));
            }
            if table.is_protected(name) {
                return Err(BranchError::new(
                    BranchErrorCode::BranchProtected,
                    name,
                    "switchBranch",
                    "branch is protected",
                ));
            }
            table.active.clone()
        };

        let gateway = Arc::clone(&self.gateway);
        let dir = self.dir.clone();
        let target = name.to_string();
        self.retry
            .enqueue("switchBranch", PRIORITY_USER, None, move || {
                let gateway = Arc::clone(&gateway);
                let dir = dir.clone();
                let target = target.clone();
                async move { gateway.switch_branch(&target, &dir).await }
            })
            .await
            .map_err(|e| BranchError::wrap(BranchErrorCode::SwitchFailed, name, "switchBranch", &e))?;

        {
            let mut table = self.table.write();
            table.active = Some(name.to_string());
            table.mark_active();
        }
        info!(from = ?previous, to = name, "switched branch");

        if let Err(e) = self.refresh_at(PRIORITY_USER).await {
            warn!(error = %e, "status refresh after switch failed");
        }
        self.events.emit(SyncEvent::BranchChanged {
            from: previous,
            to: name.to_string(),
        });
        Ok(())
    }

    /// Pushes `name` to the configured remote.
    ///
    /// Unknown and protected branches, and branches that must be pulled
    /// first, are refused without touching the gateway.
    pub async fn push_branch(&self, name: &str) -> BranchResult<String> {
        {
            let table = self.table.read();
            let Some(status) = table.statuses.get(name) else {
                return Err(BranchError::new(
                    BranchErrorCode::BranchNotFound,
                    name,
                    "pushBranch",
                    "branch is not known",
                ));
            };
            if table.is_protected(name) {
                return Err(BranchError::new(
                    BranchErrorCode::BranchProtected,
                    name,
                    "pushBranch",
                    "branch is protected",
                ));
            }
            if status.protection.require_pull_before_push && status.behind > 0 {
                return Err(BranchError::new(
                    BranchErrorCode::PushRejected,
                    name,
                    "pushBranch",
                    format!("branch is {} commit(s) behind; pull first", status.behind),
                ));
            }
        }

        let gateway = Arc::clone(&self.gateway);
        let dir = self.dir.clone();
        let remote = self.remote.clone();
        let branch = name.to_string();
        let output = self
            .retry
            .enqueue("pushBranch", PRIORITY_USER, None, move || {
                let gateway = Arc::clone(&gateway);
                let dir = dir.clone();
                let remote = remote.clone();
                let branch = branch.clone();
                async move { gateway.push(&remote, &branch, &dir).await }
            })
            .await
            .map_err(|e| BranchError::wrap(BranchErrorCode::PushFailed, name, "pushBranch", &e))?;

        if let Err(e) = self.refresh_at(PRIORITY_USER).await {
            warn!(error = %e, "status refresh after push failed");
        }
        Ok(output)
    }

    /// Pulls into `name`, which must be the active branch.
    pub async fn pull_branch(&self, name: &str) -> BranchResult<String> {
        {
            let table = self.table.read();
            if !table.statuses.contains_key(name) {
                return Err(BranchError::new(
                    BranchErrorCode::BranchNotFound,
                    name,
                    "pullBranch",
                    "branch is not known",
                ));
            }
            if table.active.as_deref() != Some(name) {
                return Err(BranchError::new(
                    BranchErrorCode::NotActive,
                    name,
                    "pullBranch",
                    "only the active branch can be pulled",
                ));
            }
        }

        let gateway = Arc::clone(&self.gateway);
        let dir = self.dir.clone();
        let output = self
            .retry
            .enqueue("pullBranch", PRIORITY_USER, None, move || {
                let gateway = Arc::clone(&gateway);
                let dir = dir.clone();
                async move { gateway.pull(&dir).await }
            })
            .await
            .map_err(|e| BranchError::wrap(BranchErrorCode::PullFailed, name, "pullBranch", &e))?;

        if let Err(e) = self.refresh_at(PRIORITY_USER).await {
            warn!(error = %e, "status refresh after pull failed");
        }
        Ok(output)
    }

    /// Merges `update` into the branch's configuration and returns the result.
    pub fn update_branch_config(&self, branch: &str, update: BranchConfigUpdate) -> BranchConfig {
        let merged = {
            let mut table = self.table.write();
            let config = table.configs.entry(branch.to_string()).or_default();
            update.apply(config);
            config.clone()
        };
        self.events.emit(SyncEvent::ConfigUpdated {
            branch: branch.to_string(),
            config: merged.clone(),
        });
        merged
    }

    /// Returns the configuration of `branch`, or the defaults.
    pub fn branch_config(&self, branch: &str) -> BranchConfig {
        self.table
            .read()
            .configs
            .get(branch)
            .cloned()
            .unwrap_or_default()
    }

    /// Sets the protection policy of `branch`. Survives refreshes.
    pub fn set_protection(&self, branch: &str, protection: BranchProtection) {
        let mut table = self.table.write();
        if let Some(status) = table.statuses.get_mut(branch) {
            status.protection = protection.clone();
        }
        table.protections.insert(branch.to_string(), protection);
    }

    /// Returns every known branch status, ordered by name.
    pub fn statuses(&self) -> Vec<BranchStatus> {
        self.table.read().statuses.values().cloned().collect()
    }

    /// Returns the status of `name`.
    pub fn status(&self, name: &str) -> Option<BranchStatus> {
        self.table.read().statuses.get(name).cloned()
    }

    /// Returns the checked out branch.
    pub fn active_branch(&self) -> Option<String> {
        self.table.read().active.clone()
    }

    /// Returns `require_sync` branches whose sync interval has elapsed at `now`.
    pub fn branches_due_for_sync(&self, now: DateTime<Utc>) -> Vec<String> {
        self.table
            .read()
            .statuses
            .values()
            .filter(|s| s.protection.require_sync)
            .filter(|s| match s.last_sync {
                None => true,
                Some(last) => {
                    let elapsed = now.signed_duration_since(last).num_milliseconds();
                    elapsed >= 0 && elapsed as u64 >= s.protection.sync_interval_ms
                }
            })
            .map(|s| s.name.clone())
            .collect()
    }

    /// Exports branch state for snapshotting.
    pub fn engine_state(&self) -> EngineState {
        let table = self.table.read();
        let mut settings = BTreeMap::new();
        if let Ok(configs) = serde_json::to_value(&table.configs) {
            settings.insert(BRANCH_CONFIG_SETTING.to_string(), configs);
        }
        EngineState {
            branches: table.statuses.clone(),
            settings,
            current_branch: table.active.clone(),
        }
    }

    /// Replaces branch state with a restored snapshot.
    pub fn apply_engine_state(&self, state: &EngineState) {
        let statuses = {
            let mut table = self.table.write();
            table.statuses = state.branches.clone();
            table.protections = state
                .branches
                .iter()
                .map(|(name, s)| (name.clone(), s.protection.clone()))
                .collect();
            table.active = state.current_branch.clone();
            if let Some(configs) = state.settings.get(BRANCH_CONFIG_SETTING) {
                match serde_json::from_value(configs.clone()) {
                    Ok(configs) => table.configs = configs,
                    Err(e) => warn!(error = %e, "ignoring unreadable branch configs"),
                }
            }
            table.mark_active();
            table.statuses.values().cloned().collect::<Vec<_>>()
        };
        self.events.emit(SyncEvent::StatusesUpdated { statuses });
    }
}

impl<G: VcsGateway + 'static> BranchManager<G> {
    /// Starts refreshing statuses every `interval` at background priority.
    ///
    /// Replaces any running refresh loop. The loop ends when the manager is
    /// dropped.
    pub fn start_auto_refresh(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = manager.refresh_branch_statuses().await {
                    warn!(error = %e, "background branch refresh failed");
                }
            }
        });
        if let Some(previous) = self.auto_refresh.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background refresh loop.
    pub fn stop_auto_refresh(&self) {
        if let Some(handle) = self.auto_refresh.lock().take() {
            handle.abort();
        }
    }
}

impl<G: VcsGateway + 'static> Drop for BranchManager<G> {
    fn drop(&mut self) {
        self.stop_auto_refresh();
    }
}
