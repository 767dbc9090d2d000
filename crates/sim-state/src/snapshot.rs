//! Point-in-time copies of the cluster state
//!
//! A snapshot owns a deep copy of the state taken at capture time and is
//! never modified afterwards. Restoring clones the copy back into the store,
//! replacing the live state wholesale.
//!
//! When more than `max_snapshots` are held, the oldest snapshot that is not
//! the baseline is evicted first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sim_core::ClusterState;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::ClusterStore;
use crate::{Result, StateError};

/// Size summary stored next to the state copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub node_count: usize,
    pub gpu_count: usize,
}

/// An immutable captured copy of the cluster state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub is_baseline: bool,
    pub metadata: SnapshotMetadata,
    pub cluster_state_copy: ClusterState,
}

impl StateSnapshot {
    fn capture(state: &ClusterState, name: String, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            timestamp: Utc::now(),
            scenario_id: None,
            is_baseline: false,
            metadata: SnapshotMetadata {
                node_count: state.nodes.len(),
                gpu_count: state.gpu_count(),
            },
            cluster_state_copy: state.clone(),
        }
    }
}

/// Holds snapshots most recent first, optionally mirrored to a JSON file
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    snapshots: Vec<StateSnapshot>,
    max_snapshots: usize,
    storage_path: Option<PathBuf>,
}

impl SnapshotManager {
    /// In-memory manager
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: Vec::new(),
            max_snapshots: max_snapshots.max(1),
            storage_path: None,
        }
    }

    /// Manager backed by a JSON file; existing snapshots are loaded from it
    pub fn with_storage(path: impl Into<PathBuf>, max_snapshots: usize) -> Result<Self> {
        let path = path.into();
        let mut manager = Self::new(max_snapshots);
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            if !text.trim().is_empty() {
                manager.snapshots = serde_json::from_str(&text).map_err(|e| {
                    StateError::Persistence(format!("{}: {}", path.display(), e))
                })?;
                manager.snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            }
            info!("Loaded {} snapshots from {}", manager.snapshots.len(), path.display());
        }
        manager.storage_path = Some(path);
        Ok(manager)
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// All snapshots, most recent first
    pub fn snapshots(&self) -> &[StateSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Look up a snapshot by full id or unique id prefix
    pub fn get(&self, id: &str) -> Option<&StateSnapshot> {
        if let Some(exact) = self.snapshots.iter().find(|s| s.id == id) {
            return Some(exact);
        }
        let mut matches = self.snapshots.iter().filter(|s| s.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(only), None) if !id.is_empty() => Some(only),
            _ => None,
        }
    }

    pub fn baseline(&self) -> Option<&StateSnapshot> {
        self.snapshots.iter().find(|s| s.is_baseline)
    }

    /// Capture the current state; returns the new snapshot id
    pub fn create_snapshot(
        &mut self,
        state: &ClusterState,
        name: &str,
        description: Option<&str>,
    ) -> String {
        let snapshot =
            StateSnapshot::capture(state, name.to_string(), description.map(str::to_string));
        self.insert(snapshot)
    }

    /// Capture the canonical clean state, replacing any previous baseline
    pub fn create_baseline_snapshot(&mut self, state: &ClusterState) -> String {
        self.snapshots.retain(|s| !s.is_baseline);
        let mut snapshot = StateSnapshot::capture(
            state,
            "Baseline".to_string(),
            Some("Clean cluster state".to_string()),
        );
        snapshot.is_baseline = true;
        self.insert(snapshot)
    }

    /// Capture the state just before a scenario is loaded
    pub fn snapshot_before_scenario(&mut self, state: &ClusterState, scenario_id: &str) -> String {
        let mut snapshot = StateSnapshot::capture(
            state,
            format!("Before scenario {}", scenario_id),
            Some(format!("Automatic snapshot taken before loading {}", scenario_id)),
        );
        snapshot.scenario_id = Some(scenario_id.to_string());
        self.insert(snapshot)
    }

    /// Replace the live state with a copy of the snapshot.
    ///
    /// Returns false and leaves the store untouched if `id` is unknown.
    pub fn restore_snapshot(&self, id: &str, store: &mut ClusterStore) -> bool {
        match self.get(id) {
            Some(snapshot) => {
                store.replace_state(snapshot.cluster_state_copy.clone());
                info!("Restored snapshot '{}' ({})", snapshot.name, snapshot.id);
                true
            }
            None => {
                debug!("No snapshot with id {}", id);
                false
            }
        }
    }

    /// Restore the baseline; false when none was captured
    pub fn restore_baseline(&self, store: &mut ClusterStore) -> bool {
        match self.baseline() {
            Some(baseline) => {
                store.replace_state(baseline.cluster_state_copy.clone());
                info!("Restored baseline snapshot");
                true
            }
            None => false,
        }
    }

    /// Delete a snapshot; returns whether one was removed
    pub fn delete_snapshot(&mut self, id: &str) -> bool {
        let Some(full_id) = self.get(id).map(|s| s.id.clone()) else {
            return false;
        };
        self.snapshots.retain(|s| s.id != full_id);
        info!("Deleted snapshot {}", full_id);
        self.persist();
        true
    }

    fn insert(&mut self, snapshot: StateSnapshot) -> String {
        let id = snapshot.id.clone();
        info!("Created snapshot '{}' ({})", snapshot.name, id);
        self.snapshots.insert(0, snapshot);
        self.evict();
        self.persist();
        id
    }

    fn evict(&mut self) {
        while self.snapshots.len() > self.max_snapshots {
            let Some(oldest) = self.snapshots.iter().rposition(|s| !s.is_baseline) else {
                break;
            };
            let evicted = self.snapshots.remove(oldest);
            info!("Evicted snapshot '{}' ({})", evicted.name, evicted.id);
        }
    }

    fn persist(&self) {
        let Some(path) = &self.storage_path else {
            return;
        };
        if let Err(e) = self.write_to(path) {
            warn!("Failed to persist snapshots to {}: {}", path.display(), e);
        }
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshots)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::{FaultInjectionConfig, FaultKind};
    use sim_core::fixtures::demo_cluster;
    use sim_core::ClusterConfig;

    fn store() -> ClusterStore {
        ClusterStore::new(demo_cluster(&ClusterConfig {
            nodes: 2,
            gpus_per_node: 4,
            ..ClusterConfig::default()
        }))
    }

    #[test]
    fn test_snapshot_is_isolated_from_live_state() {
        let mut store = store();
        let mut manager = SnapshotManager::new(10);
        let id = manager.create_snapshot(store.state(), "before", None);
        let captured = store.state().clone();

        store.apply_faults(&[FaultInjectionConfig::new(
            "dgx-00",
            Some(0),
            FaultKind::XidError { xid: 79 },
        )]);
        store.state_mut().nodes[1].gpus[2].temperature = 88;
        store.state_mut().nodes[1].gpus[2].utilization = 55;
        store.state_mut().nodes.pop();

        assert_eq!(manager.get(&id).unwrap().cluster_state_copy, captured);

        assert!(manager.restore_snapshot(&id, &mut store));
        assert_eq!(store.state(), &captured);
        assert_eq!(store.state().gpu_count(), 8);
        assert!(store.state().nodes[0].gpus[0].xid_errors.is_empty());

        // Mutating after restore must not reach back into the snapshot
        store.state_mut().nodes[0].gpus[0].temperature = 99;
        assert_eq!(manager.get(&id).unwrap().cluster_state_copy, captured);
    }

    #[test]
    fn test_unknown_id_and_missing_baseline() {
        let mut store = store();
        let manager = SnapshotManager::new(10);
        let before = store.state().clone();
        assert!(!manager.restore_snapshot("nope", &mut store));
        assert!(!manager.restore_baseline(&mut store));
        assert_eq!(store.state(), &before);
    }

    #[test]
    fn test_ordering_metadata_and_duplicate_names() {
        let store = store();
        let mut manager = SnapshotManager::new(10);
        let first = manager.create_snapshot(store.state(), "same", Some("one"));
        let second = manager.create_snapshot(store.state(), "same", None);
        assert_ne!(first, second);

        let ids: Vec<&str> = manager.snapshots().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert_eq!(
            manager.snapshots()[0].metadata,
            SnapshotMetadata {
                node_count: 2,
                gpu_count: 8
            }
        );
    }

    #[test]
    fn test_scenario_snapshot_is_tagged() {
        let store = store();
        let mut manager = SnapshotManager::new(10);
        let id = manager.snapshot_before_scenario(store.state(), "xid-79-drill");
        let snapshot = manager.get(&id).unwrap();
        assert_eq!(snapshot.scenario_id.as_deref(), Some("xid-79-drill"));
        assert!(snapshot.name.contains("xid-79-drill"));
    }

    #[test]
    fn test_eviction_keeps_baseline() {
        let store = store();
        let mut manager = SnapshotManager::new(3);
        let baseline = manager.create_baseline_snapshot(store.state());
        let a = manager.create_snapshot(store.state(), "a", None);
        manager.create_snapshot(store.state(), "b", None);
        manager.create_snapshot(store.state(), "c", None);

        assert_eq!(manager.len(), 3);
        assert!(manager.get(&baseline).is_some());
        assert!(manager.get(&a).is_none());
    }

    #[test]
    fn test_baseline_restore_and_replace() {
        let mut store = store();
        let mut manager = SnapshotManager::new(10);
        manager.create_baseline_snapshot(store.state());
        let clean = store.state().clone();
        manager.create_baseline_snapshot(store.state());
        assert_eq!(manager.snapshots().iter().filter(|s| s.is_baseline).count(), 1);

        store.state_mut().nodes[0].gpus[0].utilization = 80;
        assert!(manager.restore_baseline(&mut store));
        assert_eq!(store.state(), &clean);
    }

    #[test]
    fn test_delete_by_prefix() {
        let store = store();
        let mut manager = SnapshotManager::new(10);
        let id = manager.create_snapshot(store.state(), "x", None);
        assert!(manager.delete_snapshot(&id[..8]));
        assert!(manager.is_empty());
        assert!(!manager.delete_snapshot(&id));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshots.json");
        let store = store();

        let id = {
            let mut manager = SnapshotManager::with_storage(&path, 10).unwrap();
            manager.create_snapshot(store.state(), "saved", Some("persisted"))
        };

        let text = std::fs::read_to_string(&path).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(raw.is_array());
        assert!(raw[0].get("clusterStateCopy").is_some());
        assert_eq!(raw[0]["metadata"]["gpuCount"], 8);

        let reloaded = SnapshotManager::with_storage(&path, 10).unwrap();
        let snapshot = reloaded.get(&id).unwrap();
        assert_eq!(snapshot.description.as_deref(), Some("persisted"));
        assert_eq!(&snapshot.cluster_state_copy, store.state());
    }

    #[test]
    fn test_corrupt_storage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SnapshotManager::with_storage(&path, 10),
            Err(StateError::Persistence(_))
        ));
    }
}
