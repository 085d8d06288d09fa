//! Gateway implementation driving the `git` command-line client.
//!
//! Every call spawns `git` in the working directory through
//! `tokio::process`, so nothing blocks the runtime. Failures are classified
//! from the command's error output into the retryable and non-retryable
//! variants of [`SyncError`].

use crate::error::{SyncError, SyncResult};
use crate::gateway::{is_nothing_to_commit, AddTarget, RemoteBranch, RepoStatus, VcsGateway};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Output of a finished `git` invocation.
#[derive(Debug)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

/// A [`VcsGateway`] that runs the `git` binary.
#[derive(Debug, Clone)]
pub struct GitGateway {
    program: OsString,
}

impl GitGateway {
    /// Creates a gateway using `git` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: OsString::from("git"),
        }
    }

    /// Creates a gateway using a specific `git` binary.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> SyncResult<GitOutput> {
        debug!(?args, dir = %dir.display(), "running git");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_checked(&self, dir: &Path, args: &[&str]) -> SyncResult<String> {
        let output = self.run(dir, args).await?;
        if output.success {
            Ok(output.combined())
        } else {
            Err(classify_failure(args.first().copied().unwrap_or("git"), &output.combined()))
        }
    }
}

impl Default for GitGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsGateway for GitGateway {
    async fn status(&self, dir: &Path) -> SyncResult<RepoStatus> {
        let probe = match self.run(dir, &["rev-parse", "--is-inside-work-tree"]).await {
            Ok(probe) => probe,
            // A directory that does not exist cannot hold a repository.
            Err(_) if !is_directory(dir).await => return Ok(RepoStatus::not_a_repo()),
            Err(err) => return Err(err),
        };
        if !probe.success || probe.stdout.trim() != "true" {
            return Ok(RepoStatus::not_a_repo());
        }
        let args = ["status", "--porcelain=v1", "--branch", "-z"];
        let output = self.run(dir, &args).await?;
        if !output.success {
            return Err(classify_failure("status", &output.combined()));
        }
        Ok(parse_porcelain(&output.stdout))
    }

    async fn pull(&self, dir: &Path) -> SyncResult<String> {
        self.run_checked(dir, &["pull", "--no-rebase", "--no-edit"])
            .await
    }

    async fn add(&self, target: &AddTarget, dir: &Path) -> SyncResult<String> {
        match target {
            AddTarget::All => self.run_checked(dir, &["add", "--all", "."]).await,
            AddTarget::Paths(paths) => {
                let rendered: Vec<String> = paths
                    .iter()
                    .map(|p| p.strip_prefix(dir).unwrap_or(p).to_string_lossy().into_owned())
                    .collect();
                let mut args = vec!["add", "--all", "--"];
                args.extend(rendered.iter().map(String::as_str));
                self.run_checked(dir, &args).await
            }
        }
    }

    async fn commit(&self, message: &str, dir: &Path) -> SyncResult<String> {
        let output = self.run(dir, &["commit", "-m", message]).await?;
        let text = output.combined();
        if output.success || is_nothing_to_commit(&text) {
            Ok(text)
        } else {
            Err(classify_failure("commit", &text))
        }
    }

    async fn push(&self, remote: &str, branch: &str, dir: &Path) -> SyncResult<String> {
        self.run_checked(dir, &["push", remote, branch]).await
    }

    async fn current_branch(&self, dir: &Path) -> SyncResult<String> {
        self.run_checked(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map(|s| s.trim().to_string())
    }

    async fn branches(&self, dir: &Path) -> SyncResult<Vec<RemoteBranch>> {
        let listing = self
            .run_checked(
                dir,
                &[
                    "for-each-ref",
                    "--format=%(refname:short)\t%(upstream:track)",
                    "refs/heads",
                ],
            )
            .await?;
        let mut branches: Vec<RemoteBranch> = listing.lines().filter_map(parse_branch_line).collect();

        // Only the checked out branch can carry conflicts.
        let status = self.status(dir).await?;
        if status.has_conflicts() {
            if let Some(current) = branches.iter_mut().find(|b| b.name == status.branch) {
                current.has_conflicts = true;
            }
        }
        Ok(branches)
    }

    async fn switch_branch(&self, name: &str, dir: &Path) -> SyncResult<String> {
        self.run_checked(dir, &["checkout", name]).await
    }
}

async fn is_directory(dir: &Path) -> bool {
    tokio::fs::metadata(dir)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Maps `git` error output onto the error taxonomy.
pub(crate) fn classify_failure(command: &str, text: &str) -> SyncError {
    let lower = text.to_lowercase();

    if text.contains("CONFLICT") || lower.contains("merge conflict") || lower.contains("unmerged") {
        return SyncError::conflict(text.trim());
    }
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
    {
        return SyncError::AuthenticationFailed(text.trim().to_string());
    }
    if lower.contains("repository not found")
        || lower.contains("does not appear to be a git repository")
    {
        return SyncError::RemoteNotFound(text.trim().to_string());
    }
    if lower.contains("index.lock")
        || (lower.contains("unable to create") && lower.contains(".lock"))
    {
        return SyncError::LockContention(text.trim().to_string());
    }
    if lower.contains("could not resolve host")
        || lower.contains("connection timed out")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("unable to access")
        || lower.contains("early eof")
    {
        return SyncError::transport_retryable(text.trim());
    }

    SyncError::Command {
        command: format!("git {command}"),
        message: text.trim().to_string(),
    }
}

/// Parses `git status --porcelain=v1 --branch -z` output.
///
/// Entries are NUL-terminated and paths are never quoted. A rename or copy
/// entry is followed by an extra field holding the source path.
pub(crate) fn parse_porcelain(text: &str) -> RepoStatus {
    let mut status = RepoStatus {
        is_repo: true,
        ..RepoStatus::default()
    };

    let mut fields = text.split('\0');
    while let Some(entry) = fields.next() {
        if let Some(header) = entry.strip_prefix("## ") {
            status.branch = parse_branch_header(header);
            continue;
        }
        if entry.len() < 4 || !entry.is_char_boundary(3) {
            continue;
        }
        let (code, path) = (&entry[..2], entry[3..].to_string());
        if code.starts_with(['R', 'C']) {
            fields.next();
        }

        match code {
            "??" => status.untracked.push(path),
            "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU" => status.conflicted.push(path),
            _ => {
                let mut chars = code.chars();
                let index = chars.next().unwrap_or(' ');
                let worktree = chars.next().unwrap_or(' ');
                if index == 'A' {
                    status.added.push(path);
                } else if index == 'D' || worktree == 'D' {
                    status.deleted.push(path);
                } else {
                    status.modified.push(path);
                }
            }
        }
    }

    status.has_changes = !(status.conflicted.is_empty()
        && status.modified.is_empty()
        && status.added.is_empty()
        && status.deleted.is_empty()
        && status.untracked.is_empty());
    status
}

fn parse_branch_header(header: &str) -> String {
    if let Some(rest) = header.strip_prefix("No commits yet on ") {
        return rest.trim().to_string();
    }
    let name = header.split("...").next().unwrap_or(header);
    name.split_whitespace().next().unwrap_or("").to_string()
}

fn parse_branch_line(line: &str) -> Option<RemoteBranch> {
    let mut parts = line.splitn(2, '\t');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let track = parts.next().unwrap_or("");
    let mut branch = RemoteBranch::new(name);
    for item in track.trim_matches(|c| c == '[' || c == ']').split(',') {
        let item = item.trim();
        if let Some(n) = item.strip_prefix("ahead ") {
            branch.ahead = n.parse().unwrap_or(0);
        } else if let Some(n) = item.strip_prefix("behind ") {
            branch.behind = n.parse().unwrap_or(0);
        }
    }
    Some(branch)
}
