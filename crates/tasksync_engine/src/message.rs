//! Auto-commit message construction.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Summary part of every auto-commit message.
pub const AUTO_COMMIT_SUMMARY: &str = "chore: auto-sync task updates";

/// Reference used when no changed file names a task.
pub const PLACEHOLDER_REF: &str = "TSK-0";

/// Number of references listed before collapsing into "and N more".
const MAX_LISTED_REFS: usize = 3;

static TASK_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TSK-\d+").expect("task reference pattern is valid"));

/// Extracts distinct task references from file names, in first-seen order.
pub fn task_refs<I, P>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut refs: Vec<String> = Vec::new();
    for path in paths {
        let Some(name) = path.as_ref().file_name() else {
            continue;
        };
        let name = name.to_string_lossy();
        for found in TASK_REF.find_iter(&name) {
            if !refs.iter().any(|r| r == found.as_str()) {
                refs.push(found.as_str().to_string());
            }
        }
    }
    refs
}

/// Builds `[REF1, REF2, REF3 and N more] chore: auto-sync task updates`.
pub fn auto_commit_message<I, P>(paths: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let refs = task_refs(paths);
    let prefix = if refs.is_empty() {
        PLACEHOLDER_REF.to_string()
    } else if refs.len() > MAX_LISTED_REFS {
        format!(
            "{} and {} more",
            refs[..MAX_LISTED_REFS].join(", "),
            refs.len() - MAX_LISTED_REFS
        )
    } else {
        refs.join(", ")
    };
    format!("[{prefix}] {AUTO_COMMIT_SUMMARY}")
}
