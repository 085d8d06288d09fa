//! Snapshot and restore of the engine's in-memory state.
//!
//! Snapshots are immutable deep copies of the live [`EngineState`]. A
//! [`RestorePoint`] pairs a snapshot with a verification record, and
//! [`StateManager::restore`] re-verifies that record before touching live
//! state. Every restore first snapshots the current live state as an
//! automatic backup.

use crate::branch::BranchStatus;
use crate::error::{StateError, StateResult};
use crate::events::{EventBus, SyncEvent};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Tag attached to automatic pre-restore backups.
pub const AUTO_BACKUP_TAG: &str = "auto-backup";

/// The engine state covered by snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    /// Branch statuses keyed by name.
    pub branches: BTreeMap<String, BranchStatus>,
    /// Free-form settings.
    pub settings: BTreeMap<String, Value>,
    /// The checked out branch.
    pub current_branch: Option<String>,
}

/// An immutable copy of [`EngineState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Snapshot id.
    pub id: String,
    /// Copied state.
    pub state: EngineState,
    /// Human readable description.
    pub description: String,
    /// Tags for lookup.
    pub tags: Vec<String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// Verification record of a restore point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVerification {
    /// Number of branches in the snapshot.
    pub branch_count: usize,
    /// Checked out branch in the snapshot.
    pub current_branch: Option<String>,
    /// Content checksum, see [`StateManager::checksum_of`].
    pub checksum: String,
}

/// A snapshot that can be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePoint {
    /// Snapshot id.
    pub snapshot_id: String,
    /// Verification record computed when the point was created.
    pub verification: RestoreVerification,
}

/// Result of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Restored snapshot id.
    pub snapshot_id: String,
    /// Id of the automatic backup of the replaced live state.
    pub backup_id: String,
    /// State version after the restore.
    pub version: u64,
}

#[derive(Default)]
struct StateStore {
    live: EngineState,
    snapshots: Vec<Arc<StateSnapshot>>,
    restore_points: HashMap<String, RestorePoint>,
    version: u64,
}

impl StateStore {
    fn snapshot(&self, id: &str) -> Option<&Arc<StateSnapshot>> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    fn take_snapshot(&mut self, description: String, tags: Vec<String>) -> Arc<StateSnapshot> {
        let snapshot = Arc::new(StateSnapshot {
            id: Uuid::new_v4().to_string(),
            state: self.live.clone(),
            description,
            tags,
            timestamp: Utc::now(),
        });
        self.snapshots.push(Arc::clone(&snapshot));
        snapshot
    }
}

/// Owns live engine state and its snapshots.
pub struct StateManager {
    events: EventBus,
    store: RwLock<StateStore>,
}

impl StateManager {
    /// Creates a manager with empty live state.
    pub fn new(events: EventBus) -> Self {
        Self::with_state(EngineState::default(), events)
    }

    /// Creates a manager starting from `initial`.
    pub fn with_state(initial: EngineState, events: EventBus) -> Self {
        Self {
            events,
            store: RwLock::new(StateStore {
                live: initial,
                ..StateStore::default()
            }),
        }
    }

    /// Returns a copy of live state.
    pub fn live(&self) -> EngineState {
        self.store.read().live.clone()
    }

    /// Mutates live state in place and returns the new version.
    pub fn update<F>(&self, f: F) -> u64
    where
        F: FnOnce(&mut EngineState),
    {
        let mut store = self.store.write();
        f(&mut store.live);
        store.version += 1;
        store.version
    }

    /// Returns the live state version.
    pub fn version(&self) -> u64 {
        self.store.read().version
    }

    /// Snapshots live state and returns the snapshot id.
    pub fn create_snapshot<I, S>(&self, description: &str, tags: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        let snapshot = self
            .store
            .write()
            .take_snapshot(description.to_string(), tags);

        info!(id = %snapshot.id, description, "snapshot created");
        self.events.emit(SyncEvent::SnapshotCreated {
            id: snapshot.id.clone(),
            description: snapshot.description.clone(),
            tags: snapshot.tags.clone(),
        });
        snapshot.id.clone()
    }

    /// Attaches a restore point to snapshot `id`.
    pub fn create_restore_point(&self, id: &str) -> StateResult<RestoreVerification> {
        let verification = {
            let mut store = self.store.write();
            let snapshot = store
                .snapshot(id)
                .ok_or_else(|| StateError::SnapshotNotFound(id.to_string()))?;
            let verification = Self::verification_of(&snapshot.state);
            store.restore_points.insert(
                id.to_string(),
                RestorePoint {
                    snapshot_id: id.to_string(),
                    verification: verification.clone(),
                },
            );
            verification
        };

        self.events.emit(SyncEvent::RestorePointCreated {
            snapshot_id: id.to_string(),
            verification: verification.clone(),
        });
        Ok(verification)
    }

    /// Replaces live state with snapshot `id`.
    ///
    /// The snapshot is re-verified against its restore point first; a
    /// mismatch fails without touching live state. The replaced live state is
    /// kept as an `auto-backup` snapshot. If the restored state fails its
    /// consistency check, live state is rolled back to that backup.
    pub fn restore(&self, id: &str) -> StateResult<RestoreOutcome> {
        let (backup, applied) = {
            let mut store = self.store.write();
            let point = store
                .restore_points
                .get(id)
                .cloned()
                .ok_or_else(|| StateError::RestorePointNotFound(id.to_string()))?;
            let target = store
                .snapshot(id)
                .cloned()
                .ok_or_else(|| StateError::SnapshotNotFound(id.to_string()))?;

            let actual = Self::verification_of(&target.state);
            if actual != point.verification {
                warn!(id, expected = %point.verification.checksum, actual = %actual.checksum, "restore verification failed");
                return Err(StateError::VerificationFailed {
                    expected: point.verification.checksum,
                    actual: actual.checksum,
                });
            }

            let backup = store.take_snapshot(
                format!("Auto-backup before restoring {id}"),
                vec![AUTO_BACKUP_TAG.to_string()],
            );

            store.live = target.state.clone();
            let applied = match validate(&store.live) {
                Ok(()) => {
                    store.version += 1;
                    Ok(store.version)
                }
                Err(e) => {
                    store.live = backup.state.clone();
                    Err(e)
                }
            };
            (backup, applied)
        };

        // The backup is kept either way.
        self.events.emit(SyncEvent::SnapshotCreated {
            id: backup.id.clone(),
            description: backup.description.clone(),
            tags: backup.tags.clone(),
        });
        let version = match applied {
            Ok(version) => version,
            Err(e) => {
                warn!(id, backup = %backup.id, error = %e, "restored state invalid, rolled back");
                return Err(e);
            }
        };

        let outcome = RestoreOutcome {
            snapshot_id: id.to_string(),
            backup_id: backup.id.clone(),
            version,
        };
        info!(id, backup = %outcome.backup_id, version, "state restored");
        self.events.emit(SyncEvent::StateRestored {
            snapshot_id: outcome.snapshot_id.clone(),
            backup_id: outcome.backup_id.clone(),
            version,
        });
        Ok(outcome)
    }

    /// Returns every snapshot in creation order.
    pub fn list_snapshots(&self) -> Vec<Arc<StateSnapshot>> {
        self.store.read().snapshots.clone()
    }

    /// Returns snapshots carrying `tag`, in creation order.
    pub fn find_snapshots_by_tag(&self, tag: &str) -> Vec<Arc<StateSnapshot>> {
        self.store
            .read()
            .snapshots
            .iter()
            .filter(|s| s.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    /// Returns snapshot `id`.
    pub fn get_snapshot(&self, id: &str) -> Option<Arc<StateSnapshot>> {
        self.store.read().snapshot(id).cloned()
    }

    /// Returns the restore point of snapshot `id`.
    pub fn restore_point(&self, id: &str) -> Option<RestorePoint> {
        self.store.read().restore_points.get(id).cloned()
    }

    /// Deletes snapshot `id` and its restore point.
    pub fn delete_snapshot(&self, id: &str) -> StateResult<()> {
        let mut store = self.store.write();
        let before = store.snapshots.len();
        store.snapshots.retain(|s| s.id != id);
        if store.snapshots.len() == before {
            return Err(StateError::SnapshotNotFound(id.to_string()));
        }
        store.restore_points.remove(id);
        Ok(())
    }

    /// Computes the content checksum of `state`.
    ///
    /// A 32-bit polynomial rolling hash (`h = h * 31 + byte`) over the
    /// canonical JSON of branches, settings and current branch. Refresh
    /// timestamps are excluded, so the result depends on content only. Not
    /// collision resistant.
    pub fn checksum_of(state: &EngineState) -> String {
        let canonical = canonical_json(state).to_string();
        let hash = canonical
            .bytes()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
        format!("{hash:08x}")
    }

    fn verification_of(state: &EngineState) -> RestoreVerification {
        RestoreVerification {
            branch_count: state.branches.len(),
            current_branch: state.current_branch.clone(),
            checksum: Self::checksum_of(state),
        }
    }

    #[cfg(test)]
    fn tamper<F: FnOnce(&mut EngineState)>(&self, id: &str, f: F) {
        let mut store = self.store.write();
        if let Some(slot) = store.snapshots.iter_mut().find(|s| s.id == id) {
            let mut copy = StateSnapshot::clone(slot);
            f(&mut copy.state);
            *slot = Arc::new(copy);
        }
    }
}

fn canonical_json(state: &EngineState) -> Value {
    let branches: BTreeMap<&str, Value> = state
        .branches
        .iter()
        .map(|(name, b)| {
            (
                name.as_str(),
                json!({
                    "name": b.name,
                    "isActive": b.is_active,
                    "ahead": b.ahead,
                    "behind": b.behind,
                    "hasConflicts": b.has_conflicts,
                    "protection": b.protection,
                }),
            )
        })
        .collect();
    json!({
        "branches": branches,
        "settings": state.settings,
        "currentBranch": state.current_branch,
    })
}

fn validate(state: &EngineState) -> StateResult<()> {
    if let Some(current) = &state.current_branch {
        if !state.branches.is_empty() && !state.branches.contains_key(current) {
            return Err(StateError::InvalidState(format!(
                "current branch '{current}' is not a known branch"
            )));
        }
    }
    let active = state.branches.values().filter(|b| b.is_active).count();
    if active > 1 {
        return Err(StateError::InvalidState(format!(
            "{active} branches are marked active"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str, active: bool) -> BranchStatus {
        BranchStatus {
            is_active: active,
            ..BranchStatus::new(name)
        }
    }

    fn sample_state() -> EngineState {
        let mut state = EngineState {
            current_branch: Some("main".into()),
            ..EngineState::default()
        };
        state.branches.insert("main".into(), branch("main", true));
        state.branches.insert("dev".into(), branch("dev", false));
        state.settings.insert("theme".into(), json!("dark"));
        state
    }

    fn manager() -> StateManager {
        StateManager::with_state(sample_state(), EventBus::new())
    }

    #[test]
    fn checksum_ignores_refresh_times() {
        let a = sample_state();
        let mut b = sample_state();
        b.branches.get_mut("dev").unwrap().last_sync = Some(Utc::now());
        assert_eq!(StateManager::checksum_of(&a), StateManager::checksum_of(&b));

        b.branches.get_mut("dev").unwrap().ahead = 1;
        assert_ne!(StateManager::checksum_of(&a), StateManager::checksum_of(&b));
    }

    #[test]
    fn snapshots_do_not_alias_live_state() {
        let manager = manager();
        let id = manager.create_snapshot("s1", ["manual"]);
        manager.update(|s| {
            s.branches.remove("dev");
        });

        let snapshot = manager.get_snapshot(&id).unwrap();
        assert_eq!(snapshot.state.branches.len(), 2);
        assert_eq!(manager.live().branches.len(), 1);
    }

    #[test]
    fn restore_brings_back_pre_mutation_branches() {
        let manager = manager();
        let before = manager.live().branches;
        let id = manager.create_snapshot("s1", Vec::<String>::new());
        manager.create_restore_point(&id).unwrap();

        manager.update(|s| {
            s.branches.get_mut("dev").unwrap().behind = 7;
            s.branches.insert("scratch".into(), branch("scratch", false));
        });

        manager.restore(&id).unwrap();
        assert_eq!(manager.live().branches, before);
    }

    #[test]
    fn restore_twice_is_idempotent() {
        let manager = manager();
        let id = manager.create_snapshot("s1", ["release"]);
        manager.create_restore_point(&id).unwrap();
        manager.update(|s| s.current_branch = Some("dev".into()));

        manager.restore(&id).unwrap();
        let first = StateManager::checksum_of(&manager.live());
        let second_outcome = manager.restore(&id).unwrap();
        let second = StateManager::checksum_of(&manager.live());

        assert_eq!(first, second);
        assert_eq!(second_outcome.version, manager.version());
    }

    #[test]
    fn restore_keeps_an_auto_backup() {
        let manager = manager();
        let id = manager.create_snapshot("s1", ["release"]);
        manager.create_restore_point(&id).unwrap();
        manager.update(|s| {
            s.settings.insert("theme".into(), json!("light"));
        });
        let replaced = manager.live();

        let outcome = manager.restore(&id).unwrap();

        let backups = manager.find_snapshots_by_tag(AUTO_BACKUP_TAG);
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, outcome.backup_id);
        assert_eq!(backups[0].state, replaced);
        assert!(manager.restore_point(&outcome.backup_id).is_none());
        assert!(manager
            .list_snapshots()
            .iter()
            .any(|s| s.id == outcome.backup_id));
    }

    #[test]
    fn missing_snapshot_and_restore_point() {
        let manager = manager();
        let err = manager.create_restore_point("nope").unwrap_err();
        assert_eq!(err.to_string(), "Snapshot nope not found");

        let id = manager.create_snapshot("s1", Vec::<String>::new());
        let err = manager.restore(&id).unwrap_err();
        assert_eq!(err.to_string(), format!("Restore point {id} not found"));
    }

    #[test]
    fn tampered_snapshot_fails_verification_without_mutation() {
        let manager = manager();
        let id = manager.create_snapshot("s1", Vec::<String>::new());
        manager.create_restore_point(&id).unwrap();
        manager.tamper(&id, |s| {
            s.branches.get_mut("main").unwrap().ahead = 99;
        });
        manager.update(|s| s.current_branch = Some("dev".into()));
        let live_before = manager.live();
        let version_before = manager.version();
        let snapshot_count = manager.list_snapshots().len();

        let err = manager.restore(&id).unwrap_err();
        assert_eq!(err.to_string(), "State verification failed");
        assert_eq!(manager.live(), live_before);
        assert_eq!(manager.version(), version_before);
        assert_eq!(manager.list_snapshots().len(), snapshot_count);
    }

    #[test]
    fn invalid_restored_state_rolls_back() {
        let manager = manager();
        manager.update(|s| s.current_branch = Some("gone".into()));
        let id = manager.create_snapshot("broken", Vec::<String>::new());
        manager.create_restore_point(&id).unwrap();

        manager.update(|s| s.current_branch = Some("main".into()));
        let live_before = manager.live();

        let err = manager.restore(&id).unwrap_err();
        assert!(matches!(err, StateError::InvalidState(_)));
        assert_eq!(manager.live(), live_before);
        assert_eq!(manager.find_snapshots_by_tag(AUTO_BACKUP_TAG).len(), 1);
    }

    #[test]
    fn delete_drops_restore_point() {
        let manager = manager();
        let id = manager.create_snapshot("s1", Vec::<String>::new());
        manager.create_restore_point(&id).unwrap();

        manager.delete_snapshot(&id).unwrap();
        assert!(manager.get_snapshot(&id).is_none());
        assert!(manager.restore_point(&id).is_none());
        assert!(matches!(
            manager.delete_snapshot(&id),
            Err(StateError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_emits_backup_and_restored_events() {
        let events = EventBus::new();
        let manager = StateManager::with_state(sample_state(), events.clone());
        let id = manager.create_snapshot("s1", ["release"]);
        manager.create_restore_point(&id).unwrap();
        let mut rx = events.subscribe();

        manager.restore(&id).unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "snapshotCreated");
        assert_eq!(rx.recv().await.unwrap().name(), "stateRestored");
    }

    #[test]
    fn rolled_back_restore_announces_its_backup() {
        let events = EventBus::new();
        let manager = StateManager::with_state(sample_state(), events.clone());
        manager.update(|s| s.current_branch = Some("gone".into()));
        let id = manager.create_snapshot("broken", Vec::<String>::new());
        manager.create_restore_point(&id).unwrap();
        manager.update(|s| s.current_branch = Some("main".into()));
        let mut rx = events.subscribe();

        assert!(manager.restore(&id).is_err());

        let backups = manager.find_snapshots_by_tag(AUTO_BACKUP_TAG);
        assert_eq!(backups.len(), 1);
        match rx.try_recv().unwrap() {
            SyncEvent::SnapshotCreated { id, tags, .. } => {
                assert_eq!(id, backups[0].id);
                assert_eq!(tags, vec![AUTO_BACKUP_TAG.to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
