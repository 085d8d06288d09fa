//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync orchestrator.
///
/// Durations are serialized as integer milliseconds so the whole structure
/// can be loaded from a JSON file with any subset of fields present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Working directory mirrored to and from the remote.
    pub repo_dir: PathBuf,
    /// Remote name used for push.
    pub remote: String,
    /// Branch to push to. Falls back to the branch reported by the repository.
    pub branch: Option<String>,
    /// Interval of the background pull. Zero disables it.
    #[serde(with = "duration_ms")]
    pub auto_pull_interval: Duration,
    /// Whether a successful commit is followed by a push.
    pub auto_push_enabled: bool,
    /// Number of distinct changed paths that triggers an immediate commit.
    pub batch_commits_threshold: usize,
    /// Debounce window before pending changes are committed.
    #[serde(with = "duration_ms")]
    pub batch_commits_timeout: Duration,
    /// Paths watched for changes, relative to `repo_dir` or absolute.
    pub watched_paths: Vec<PathBuf>,
    /// How often the file watcher rescans the watched paths.
    #[serde(with = "duration_ms")]
    pub watch_poll_interval: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration for the given working directory.
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: "origin".into(),
            branch: None,
            auto_pull_interval: Duration::from_secs(300),
            auto_push_enabled: true,
            batch_commits_threshold: 10,
            batch_commits_timeout: Duration::from_secs(30),
            watched_paths: Vec::new(),
            watch_poll_interval: Duration::from_secs(2),
        }
    }

    /// Sets the remote name.
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Pins the branch pushed to.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Sets the auto-pull interval.
    pub fn with_auto_pull_interval(mut self, interval: Duration) -> Self {
        self.auto_pull_interval = interval;
        self
    }

    /// Enables or disables pushing after each commit.
    pub fn with_auto_push(mut self, enabled: bool) -> Self {
        self.auto_push_enabled = enabled;
        self
    }

    /// Sets the batch commit threshold.
    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_commits_threshold = threshold.max(1);
        self
    }

    /// Sets the batch commit debounce window.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_commits_timeout = timeout;
        self
    }

    /// Adds a watched path.
    pub fn watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.watched_paths.push(path.into());
        self
    }

    /// Sets the watcher poll interval.
    pub fn with_watch_poll_interval(mut self, interval: Duration) -> Self {
        self.watch_poll_interval = interval;
        self
    }

    /// Resolves watched paths against the working directory.
    pub fn resolved_watch_paths(&self) -> Vec<PathBuf> {
        self.watched_paths
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.repo_dir.join(p)
                }
            })
            .collect()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
    /// Per-attempt timeout. An attempt running longer counts as failed.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            timeout: Duration::from_secs(30),
            add_jitter: false,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            timeout: Duration::from_secs(30),
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff factor.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay after the given failed attempt (0-indexed).
    ///
    /// `min(initial_delay * backoff_factor^attempt, max_delay)`, plus jitter
    /// when enabled. A backoff factor below 1.0 (or NaN) counts as 1.0, and
    /// an overflowing product is capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.max(1.0);
        let max_secs = self.max_delay.as_secs_f64();
        let base = self.initial_delay.as_secs_f64() * factor.powi(exponent);
        let delay_secs = if base.is_finite() {
            base.clamp(0.0, max_secs)
        } else {
            max_secs
        };

        let delay_secs = if self.add_jitter {
            delay_secs + delay_secs * 0.25 * rand::random::<f64>()
        } else {
            delay_secs
        };
        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
