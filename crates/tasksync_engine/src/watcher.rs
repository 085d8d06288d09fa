//! Polling file watcher.
//!
//! Walks the watched paths every poll interval and compares modification
//! times with the previous walk. Created, modified and deleted files are all
//! reported as changed. `.git` directories are never entered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Detects file changes by comparing modification times between walks.
#[derive(Debug, Default)]
pub struct PollWatcher {
    roots: Vec<PathBuf>,
    seen: HashMap<PathBuf, SystemTime>,
}

impl PollWatcher {
    /// Creates a watcher over `roots`. Files and directories are both accepted.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            seen: HashMap::new(),
        }
    }

    /// Records the current tree without reporting anything.
    pub fn prime(&mut self) {
        self.seen = self.walk();
    }

    /// Returns paths created, modified or deleted since the last walk.
    pub fn scan(&mut self) -> Vec<PathBuf> {
        let current = self.walk();
        let mut changed: Vec<PathBuf> = current
            .iter()
            .filter(|(path, mtime)| self.seen.get(*path) != Some(*mtime))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            self.seen
                .keys()
                .filter(|path| !current.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        self.seen = current;
        changed
    }

    /// Number of files currently tracked.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    fn walk(&self) -> HashMap<PathBuf, SystemTime> {
        let mut files = HashMap::new();
        for root in &self.roots {
            if !root.exists() {
                trace!(root = %root.display(), "watched path missing");
                continue;
            }
            let walker = WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !is_git_dir(e));
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        trace!(error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.insert(entry.into_path(), mtime);
            }
        }
        files
    }
}

fn is_git_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == ".git"
}

/// Spawns a task polling `roots` every `interval` and calling `on_change`
/// for each changed path.
pub fn spawn_watcher<F>(roots: Vec<PathBuf>, interval: Duration, on_change: F) -> JoinHandle<()>
where
    F: Fn(PathBuf) + Send + 'static,
{
    tokio::spawn(async move {
        let mut watcher = PollWatcher::new(roots);
        watcher = match tokio::task::spawn_blocking(move || {
            watcher.prime();
            watcher
        })
        .await
        {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %e, "watcher failed to start");
                return;
            }
        };
        debug!(files = watcher.tracked(), "watcher started");

        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let scanned = tokio::task::spawn_blocking(move || {
                let changes = watcher.scan();
                (watcher, changes)
            })
            .await;
            let changes = match scanned {
                Ok((returned, changes)) => {
                    watcher = returned;
                    changes
                }
                Err(e) => {
                    warn!(error = %e, "watcher scan failed");
                    return;
                }
            };
            for path in changes {
                trace!(path = %path.display(), "file changed");
                on_change(path);
            }
        }
    })
}

/// Returns true if `path` lies inside a `.git` directory.
pub fn is_inside_git_dir(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == ".git")
}
