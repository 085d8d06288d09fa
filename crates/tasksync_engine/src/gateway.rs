//! VCS gateway abstraction.
//!
//! The engine never talks to a version-control system directly. Every remote
//! or working-copy operation goes through a [`VcsGateway`], which allows the
//! real `git` driver ([`crate::GitGateway`]) and the in-memory fake
//! ([`MemoryGateway`]) to be swapped freely.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Working-copy status reported by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    /// Whether the directory is a repository at all.
    pub is_repo: bool,
    /// Whether any tracked or untracked change exists.
    pub has_changes: bool,
    /// Currently checked out branch.
    pub branch: String,
    /// Paths with unresolved merge conflicts.
    pub conflicted: Vec<String>,
    /// Modified paths.
    pub modified: Vec<String>,
    /// Added paths.
    pub added: Vec<String>,
    /// Deleted paths.
    pub deleted: Vec<String>,
    /// Untracked paths.
    pub untracked: Vec<String>,
}

impl RepoStatus {
    /// Status of a directory that is not a repository.
    pub fn not_a_repo() -> Self {
        Self::default()
    }

    /// Returns true if the working copy has unresolved conflicts.
    pub fn has_conflicts(&self) -> bool {
        !self.conflicted.is_empty()
    }
}

/// Branch tracking information reported by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBranch {
    /// Local branch name.
    pub name: String,
    /// Commits present locally but not on the upstream.
    pub ahead: u32,
    /// Commits present on the upstream but not locally.
    pub behind: u32,
    /// Whether the branch currently has unresolved conflicts.
    pub has_conflicts: bool,
}

impl RemoteBranch {
    /// Creates an in-sync branch entry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// What to stage with [`VcsGateway::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTarget {
    /// Stage everything (`'.'`).
    All,
    /// Stage exactly these paths.
    Paths(Vec<PathBuf>),
}

/// A version-control gateway.
///
/// `commit` reports "nothing to commit" as a normal output string rather than
/// an error.
#[async_trait]
pub trait VcsGateway: Send + Sync {
    /// Reports the working-copy status.
    async fn status(&self, dir: &Path) -> SyncResult<RepoStatus>;

    /// Pulls from the tracked upstream.
    async fn pull(&self, dir: &Path) -> SyncResult<String>;

    /// Stages changes.
    async fn add(&self, target: &AddTarget, dir: &Path) -> SyncResult<String>;

    /// Commits staged changes.
    async fn commit(&self, message: &str, dir: &Path) -> SyncResult<String>;

    /// Pushes a branch to a remote.
    async fn push(&self, remote: &str, branch: &str, dir: &Path) -> SyncResult<String>;

    /// Returns the checked out branch.
    async fn current_branch(&self, dir: &Path) -> SyncResult<String>;

    /// Lists local branches with their upstream tracking counts.
    async fn branches(&self, dir: &Path) -> SyncResult<Vec<RemoteBranch>>;

    /// Checks out another branch.
    async fn switch_branch(&self, name: &str, dir: &Path) -> SyncResult<String>;
}

/// Returns true if `commit` output reports that nothing was committed.
pub fn is_nothing_to_commit(output: &str) -> bool {
    output.contains("nothing to commit")
        || output.contains("nothing added to commit")
        || output.contains("no changes added to commit")
}

/// Gateway operation identifiers, used by [`MemoryGateway`] for call logs
/// and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    /// `status`
    Status,
    /// `pull`
    Pull,
    /// `add`
    Add,
    /// `commit`
    Commit,
    /// `push`
    Push,
    /// `current_branch`
    CurrentBranch,
    /// `branches`
    Branches,
    /// `switch_branch`
    SwitchBranch,
}

impl GatewayOp {
    /// Returns true for operations that reach the remote.
    pub fn is_network(&self) -> bool {
        matches!(self, GatewayOp::Pull | GatewayOp::Push | GatewayOp::Branches)
    }
}

/// A commit recorded by [`MemoryGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    /// Commit message.
    pub message: String,
    /// Paths staged when the commit was made.
    pub paths: BTreeSet<String>,
}

type FailureFactory = Box<dyn Fn() -> SyncError + Send + Sync>;

#[derive(Default)]
struct MemoryRepo {
    status: RepoStatus,
    branches: BTreeMap<String, RemoteBranch>,
    staged: BTreeSet<String>,
    commits: Vec<RecordedCommit>,
    pushes: Vec<(String, String)>,
    calls: Vec<GatewayOp>,
    queued_failures: HashMap<GatewayOp, VecDeque<SyncError>>,
    persistent_failures: HashMap<GatewayOp, FailureFactory>,
    latency: HashMap<GatewayOp, Duration>,
    conflict_on_pull: Option<Vec<String>>,
}

/// An in-memory gateway for testing.
///
/// Behaves like a clean repository on branch `main` until configured
/// otherwise. Failures can be queued per operation, and every call is logged.
pub struct MemoryGateway {
    repo: Mutex<MemoryRepo>,
}

impl MemoryGateway {
    /// Creates a gateway reporting a clean repository on `main`.
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert("main".to_string(), RemoteBranch::new("main"));
        Self {
            repo: Mutex::new(MemoryRepo {
                status: RepoStatus {
                    is_repo: true,
                    branch: "main".into(),
                    ..RepoStatus::default()
                },
                branches,
                ..MemoryRepo::default()
            }),
        }
    }

    /// Creates a gateway whose directory is not a repository.
    pub fn not_a_repo() -> Self {
        Self {
            repo: Mutex::new(MemoryRepo::default()),
        }
    }

    /// Replaces the reported working-copy status.
    pub fn set_status(&self, status: RepoStatus) {
        self.repo.lock().status = status;
    }

    /// Adds or replaces a branch.
    pub fn set_branch(&self, branch: RemoteBranch) {
        self.repo.lock().branches.insert(branch.name.clone(), branch);
    }

    /// Makes the next `pull` fail with a merge conflict on `files`, after
    /// which `status` reports them as conflicted.
    pub fn simulate_conflict<I, S>(&self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.repo.lock().conflict_on_pull = Some(files.into_iter().map(Into::into).collect());
    }

    /// Queues a one-shot failure for the next call of `op`.
    pub fn fail_next(&self, op: GatewayOp, error: SyncError) {
        self.repo
            .lock()
            .queued_failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Makes every call of `op` fail until [`MemoryGateway::clear_failures`].
    pub fn fail_always<F>(&self, op: GatewayOp, make_error: F)
    where
        F: Fn() -> SyncError + Send + Sync + 'static,
    {
        self.repo
            .lock()
            .persistent_failures
            .insert(op, Box::new(make_error));
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        let mut repo = self.repo.lock();
        repo.queued_failures.clear();
        repo.persistent_failures.clear();
    }

    /// Delays every call of `op`.
    pub fn set_latency(&self, op: GatewayOp, latency: Duration) {
        self.repo.lock().latency.insert(op, latency);
    }

    /// Returns every call made so far, in order.
    pub fn calls(&self) -> Vec<GatewayOp> {
        self.repo.lock().calls.clone()
    }

    /// Returns the number of calls made to `op`.
    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.repo.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Returns true if any call reached the remote.
    pub fn made_network_call(&self) -> bool {
        self.repo.lock().calls.iter().any(GatewayOp::is_network)
    }

    /// Returns recorded commits.
    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.repo.lock().commits.clone()
    }

    /// Returns recorded pushes as `(remote, branch)`.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.repo.lock().pushes.clone()
    }

    async fn enter(&self, op: GatewayOp) -> SyncResult<()> {
        let latency = {
            let mut repo = self.repo.lock();
            repo.calls.push(op);
            repo.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut repo = self.repo.lock();
        if let Some(error) = repo.queued_failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(make_error) = repo.persistent_failures.get(&op) {
            return Err(make_error());
        }
        Ok(())
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsGateway for MemoryGateway {
    async fn status(&self, _dir: &Path) -> SyncResult<RepoStatus> {
        self.enter(GatewayOp::Status).await?;
        Ok(self.repo.lock().status.clone())
    }

    async fn pull(&self, _dir: &Path) -> SyncResult<String> {
        self.enter(GatewayOp::Pull).await?;
        let mut repo = self.repo.lock();
        let current = repo.status.branch.clone();
        if let Some(files) = repo.conflict_on_pull.take() {
            repo.status.conflicted = files.clone();
            repo.status.has_changes = true;
            if let Some(branch) = repo.branches.get_mut(&current) {
                branch.has_conflicts = true;
            }
            return Err(SyncError::MergeConflict {
                message: "CONFLICT (content): Merge conflict".into(),
                files,
            });
        }
        if let Some(branch) = repo.branches.get_mut(&current) {
            branch.behind = 0;
        }
        Ok("Already up to date.".into())
    }

    async fn add(&self, target: &AddTarget, _dir: &Path) -> SyncResult<String> {
        self.enter(GatewayOp::Add).await?;
        let mut repo = self.repo.lock();
        match target {
            AddTarget::All => {
                let status = repo.status.clone();
                repo.staged.extend(
                    status
                        .modified
                        .into_iter()
                        .chain(status.added)
                        .chain(status.deleted)
                        .chain(status.untracked),
                );
            }
            AddTarget::Paths(paths) => {
                repo.staged
                    .extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
            }
        }
        Ok(String::new())
    }

    async fn commit(&self, message: &str, _dir: &Path) -> SyncResult<String> {
        self.enter(GatewayOp::Commit).await?;
        let mut repo = self.repo.lock();
        if repo.staged.is_empty() {
            return Ok("nothing to commit, working tree clean".into());
        }
        let paths = std::mem::take(&mut repo.staged);
        let count = paths.len();
        repo.commits.push(RecordedCommit {
            message: message.to_string(),
            paths,
        });
        let current = repo.status.branch.clone();
        if let Some(branch) = repo.branches.get_mut(&current) {
            branch.ahead += 1;
        }
        repo.status.modified.clear();
        repo.status.added.clear();
        repo.status.deleted.clear();
        repo.status.untracked.clear();
        repo.status.has_changes = !repo.status.conflicted.is_empty();
        Ok(format!("[{current}] {message}\n {count} file(s) changed"))
    }

    async fn push(&self, remote: &str, branch: &str, _dir: &Path) -> SyncResult<String> {
        self.enter(GatewayOp::Push).await?;
        let mut repo = self.repo.lock();
        repo.pushes.push((remote.to_string(), branch.to_string()));
        if let Some(entry) = repo.branches.get_mut(branch) {
            entry.ahead = 0;
        }
        Ok(format!("{branch} -> {remote}/{branch}"))
    }

    async fn current_branch(&self, _dir: &Path) -> SyncResult<String> {
        self.enter(GatewayOp::CurrentBranch).await?;
        Ok(self.repo.lock().status.branch.clone())
    }

    async fn branches(&self, _dir: &Path) -> SyncResult<Vec<RemoteBranch>> {
        self.enter(GatewayOp::Branches).await?;
        Ok(self.repo.lock().branches.values().cloned().collect())
    }

    async fn switch_branch(&self, name: &str, _dir: &Path) -> SyncResult<String> {
        self.enter(GatewayOp::SwitchBranch).await?;
        let mut repo = self.repo.lock();
        if !repo.branches.contains_key(name) {
            return Err(SyncError::Command {
                command: "switch".into(),
                message: format!("pathspec '{name}' did not match any known branch"),
            });
        }
        repo.status.branch = name.to_string();
        Ok(format!("Switched to branch '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> &'static Path {
        Path::new("/records")
    }

    #[test]
    fn nothing_to_commit_outputs() {
        assert!(is_nothing_to_commit("On branch main\nnothing to commit, working tree clean"));
        assert!(is_nothing_to_commit("nothing added to commit but untracked files present"));
        assert!(!is_nothing_to_commit("[main abc123] message\n 1 file changed"));
    }

    #[tokio::test]
    async fn memory_gateway_commit_flow() {
        let gateway = MemoryGateway::new();

        let out = gateway.commit("empty", dir()).await.unwrap();
        assert!(is_nothing_to_commit(&out));

        gateway
            .add(&AddTarget::Paths(vec!["tasks/TSK-1.md".into()]), dir())
            .await
            .unwrap();
        gateway.commit("first", dir()).await.unwrap();

        let commits = gateway.commits();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].paths.contains("tasks/TSK-1.md"));
        assert_eq!(gateway.branches(dir()).await.unwrap()[0].ahead, 1);
    }

    #[tokio::test]
    async fn memory_gateway_failure_injection() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(GatewayOp::Pull, SyncError::transport_retryable("offline"));

        assert!(gateway.pull(dir()).await.is_err());
        assert!(gateway.pull(dir()).await.is_ok());

        gateway.fail_always(GatewayOp::Push, || SyncError::AuthenticationFailed("denied".into()));
        assert!(gateway.push("origin", "main", dir()).await.is_err());
        assert!(gateway.push("origin", "main", dir()).await.is_err());
        gateway.clear_failures();
        assert!(gateway.push("origin", "main", dir()).await.is_ok());
        assert_eq!(gateway.call_count(GatewayOp::Push), 3);
    }

    #[tokio::test]
    async fn memory_gateway_conflict_simulation() {
        let gateway = MemoryGateway::new();
        gateway.simulate_conflict(["tasks/TSK-7.md"]);

        let err = gateway.pull(dir()).await.unwrap_err();
        assert!(err.is_conflict());

        let status = gateway.status(dir()).await.unwrap();
        assert_eq!(status.conflicted, vec!["tasks/TSK-7.md".to_string()]);
    }

    #[tokio::test]
    async fn memory_gateway_not_a_repo() {
        let gateway = MemoryGateway::not_a_repo();
        let status = gateway.status(dir()).await.unwrap();
        assert!(!status.is_repo);
    }

    #[tokio::test]
    async fn switch_to_unknown_branch_fails() {
        let gateway = MemoryGateway::new();
        assert!(gateway.switch_branch("nope", dir()).await.is_err());

        gateway.set_branch(RemoteBranch::new("dev"));
        gateway.switch_branch("dev", dir()).await.unwrap();
        assert_eq!(gateway.current_branch(dir()).await.unwrap(), "dev");
    }
}
