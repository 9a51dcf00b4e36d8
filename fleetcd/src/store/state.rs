//! Lock-guarded in-memory state shared by the reconciler, persistence and observers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use super::force::ForceTarget;
use super::logs::{LogBuffer, LogEntry, LogLevel};
use super::persist::{PersistedState, read_state, write_state};
use crate::error::StoreError;
use crate::resource::{
    ClusterReadiness, ConnectivityHealth, GitState, HealthStatus, ReconcileRun, ResourceKind,
    ResourceRecord, ResourceStatus, RunStatus, RunType, VersionInfo,
};

/// Point-in-time copy of the full state, ready for serialization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub omni_endpoint: String,
    #[serde(flatten)]
    pub versions: VersionInfo,
    pub git: GitState,
    pub last_reconcile: ReconcileRun,
    pub connectivity: ConnectivityHealth,
    pub machine_classes: Vec<ResourceRecord>,
    pub clusters: Vec<ResourceRecord>,
    pub clusters_enabled: bool,
    pub logs: Vec<LogEntry>,
}

impl Snapshot {
    /// Look up a record by kind and id.
    pub fn record(&self, kind: ResourceKind, id: &str) -> Option<&ResourceRecord> {
        let records = match kind {
            ResourceKind::MachineClass => &self.machine_classes,
            ResourceKind::Cluster => &self.clusters,
        };
        records.iter().find(|r| r.id == id)
    }
}

/// Store construction parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub omni_endpoint: String,
    pub clusters_enabled: bool,
    pub max_logs: usize,
    /// Where durable state lives. `None` disables persistence.
    pub state_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            omni_endpoint: String::new(),
            clusters_enabled: true,
            max_logs: 500,
            state_file: None,
        }
    }
}

struct Inner {
    versions: VersionInfo,
    git: GitState,
    last_reconcile: ReconcileRun,
    connectivity: ConnectivityHealth,
    machine_classes: Vec<ResourceRecord>,
    clusters: Vec<ResourceRecord>,
    clusters_enabled: bool,
    logs: LogBuffer,
}

impl Inner {
    fn records_mut(&mut self, kind: ResourceKind) -> &mut Vec<ResourceRecord> {
        match kind {
            ResourceKind::MachineClass => &mut self.machine_classes,
            ResourceKind::Cluster => &mut self.clusters,
        }
    }

    fn records(&self, kind: ResourceKind) -> &[ResourceRecord] {
        match kind {
            ResourceKind::MachineClass => &self.machine_classes,
            ResourceKind::Cluster => &self.clusters,
        }
    }

    fn durable(&self) -> PersistedState {
        PersistedState {
            versions: self.versions.clone(),
            last_reconcile: self.last_reconcile.clone(),
            machine_classes: self.machine_classes.clone(),
            clusters: self.clusters.clone(),
            clusters_enabled: self.clusters_enabled,
        }
        .sanitized()
    }
}

/// Concurrency-safe holder of all controller state.
///
/// Every accessor takes the lock briefly and returns owned data; no guard
/// escapes the store. Each mutation bumps a generation counter on a watch
/// channel, so bursts of updates collapse into a single wake-up for
/// subscribers, who then re-read [`StateStore::snapshot`].
pub struct StateStore {
    omni_endpoint: String,
    state_file: Option<PathBuf>,
    inner: RwLock<Inner>,
    force: ForceTarget,
    changes: watch::Sender<u64>,
    /// Held across copy, write and rename so writers never share the temp file.
    persisting: Mutex<()>,
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            omni_endpoint: config.omni_endpoint,
            state_file: config.state_file,
            inner: RwLock::new(Inner {
                versions: VersionInfo::default(),
                git: GitState::default(),
                last_reconcile: ReconcileRun::default(),
                connectivity: ConnectivityHealth::default(),
                machine_classes: Vec::new(),
                clusters: Vec::new(),
                clusters_enabled: config.clusters_enabled,
                logs: LogBuffer::new(config.max_logs),
            }),
            force: ForceTarget::new(),
            changes,
            persisting: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation under the write lock, then signal observers.
    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let result = {
            let mut inner = self.write();
            f(&mut inner)
        };
        self.notify_change();
        result
    }

    // === Observation ===

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.read();
        Snapshot {
            omni_endpoint: self.omni_endpoint.clone(),
            versions: inner.versions.clone(),
            git: inner.git.clone(),
            last_reconcile: inner.last_reconcile.clone(),
            connectivity: inner.connectivity.clone(),
            machine_classes: inner.machine_classes.clone(),
            clusters: inner.clusters.clone(),
            clusters_enabled: inner.clusters_enabled,
            logs: inner.logs.to_vec(),
        }
    }

    /// Subscribe to change notifications. The value carries no payload
    /// beyond "something changed".
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Signal observers without blocking. Never fails, even with no subscribers.
    pub fn notify_change(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    // === Resources ===

    pub fn records(&self, kind: ResourceKind) -> Vec<ResourceRecord> {
        self.read().records(kind).to_vec()
    }

    pub fn record(&self, kind: ResourceKind, id: &str) -> Option<ResourceRecord> {
        self.read().records(kind).iter().find(|r| r.id == id).cloned()
    }

    pub fn machine_classes(&self) -> Vec<ResourceRecord> {
        self.records(ResourceKind::MachineClass)
    }

    pub fn clusters(&self) -> Vec<ResourceRecord> {
        self.records(ResourceKind::Cluster)
    }

    /// Replace the whole set for a kind. Records are kept sorted by id.
    pub fn replace(&self, kind: ResourceKind, mut records: Vec<ResourceRecord>) {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.dedup_by(|a, b| a.id == b.id);
        self.mutate(|inner| *inner.records_mut(kind) = records);
    }

    pub fn replace_machine_classes(&self, records: Vec<ResourceRecord>) {
        self.replace(ResourceKind::MachineClass, records);
    }

    /// Replace the cluster set. Readiness is owned by the readiness poll, so
    /// each record takes the value currently stored for its id.
    pub fn replace_clusters(&self, mut records: Vec<ResourceRecord>) {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.dedup_by(|a, b| a.id == b.id);
        self.mutate(|inner| {
            let readiness: HashMap<&str, ClusterReadiness> = inner
                .clusters
                .iter()
                .filter_map(|r| r.readiness.map(|ready| (r.id.as_str(), ready)))
                .collect();
            for record in records.iter_mut() {
                record.readiness = readiness.get(record.id.as_str()).copied();
            }
            inner.clusters = records;
        });
    }

    /// Insert or replace a single record.
    pub fn upsert(&self, record: ResourceRecord) {
        self.mutate(|inner| {
            let records = inner.records_mut(record.kind);
            match records.binary_search_by(|r| r.id.cmp(&record.id)) {
                Ok(pos) => records[pos] = record,
                Err(pos) => records.insert(pos, record),
            }
        });
    }

    /// Targeted status update for progress reporting. Creates a bare record
    /// if the id is not tracked yet; keeps every other field otherwise.
    pub fn set_status(&self, kind: ResourceKind, id: &str, status: ResourceStatus) {
        self.mutate(|inner| {
            let records = inner.records_mut(kind);
            match records.binary_search_by(|r| r.id.as_str().cmp(id)) {
                Ok(pos) => records[pos].status = status,
                Err(pos) => records.insert(pos, ResourceRecord::new(kind, id, status)),
            }
        });
    }

    /// Stop tracking a record. Returns whether it was tracked.
    pub fn remove(&self, kind: ResourceKind, id: &str) -> bool {
        self.mutate(|inner| {
            let records = inner.records_mut(kind);
            let before = records.len();
            records.retain(|r| r.id != id);
            records.len() != before
        })
    }

    pub fn upsert_machine_class(&self, record: ResourceRecord) {
        debug_assert_eq!(record.kind, ResourceKind::MachineClass);
        self.upsert(record);
    }

    pub fn upsert_cluster(&self, record: ResourceRecord) {
        debug_assert_eq!(record.kind, ResourceKind::Cluster);
        self.upsert(record);
    }

    pub fn set_cluster_status(&self, id: &str, status: ResourceStatus) {
        self.set_status(ResourceKind::Cluster, id, status);
    }

    /// Apply readiness to tracked clusters. Statuses are left untouched.
    pub fn update_cluster_readiness(&self, readiness: &HashMap<String, ClusterReadiness>) {
        self.mutate(|inner| {
            for cluster in inner.clusters.iter_mut() {
                cluster.readiness = readiness.get(&cluster.id).copied();
            }
        });
    }

    // === Runs, health, versions ===

    pub fn last_run(&self) -> ReconcileRun {
        self.read().last_reconcile.clone()
    }

    pub fn is_running(&self) -> bool {
        self.read().last_reconcile.status == RunStatus::Running
    }

    pub fn run_started(&self, run_type: RunType) {
        self.mutate(|inner| {
            inner.last_reconcile = ReconcileRun {
                run_type: Some(run_type),
                status: RunStatus::Running,
                started_at: Some(Utc::now()),
                finished_at: None,
            }
        });
    }

    pub fn run_finished(&self, success: bool) {
        self.mutate(|inner| {
            inner.last_reconcile.status = if success {
                RunStatus::Success
            } else {
                RunStatus::Failed
            };
            inner.last_reconcile.finished_at = Some(Utc::now());
        });
    }

    pub fn set_git(&self, git: GitState) {
        self.mutate(|inner| inner.git = git);
    }

    pub fn connectivity(&self) -> ConnectivityHealth {
        self.read().connectivity.clone()
    }

    pub fn set_connectivity(&self, status: HealthStatus, error: Option<String>) {
        self.mutate(|inner| {
            inner.connectivity = ConnectivityHealth {
                status,
                last_checked: Some(Utc::now()),
                last_error: error,
            }
        });
    }

    pub fn versions(&self) -> VersionInfo {
        self.read().versions.clone()
    }

    pub fn version_mismatch(&self) -> bool {
        self.read().versions.version_mismatch
    }

    pub fn set_versions(&self, versions: VersionInfo) {
        self.mutate(|inner| inner.versions = versions);
    }

    // === Cluster sync toggle and force target ===

    pub fn clusters_enabled(&self) -> bool {
        self.read().clusters_enabled
    }

    pub fn set_clusters_enabled(&self, enabled: bool) {
        self.mutate(|inner| inner.clusters_enabled = enabled);
    }

    /// Flip cluster sync and return the new value.
    pub fn toggle_clusters_enabled(&self) -> bool {
        self.mutate(|inner| {
            inner.clusters_enabled = !inner.clusters_enabled;
            inner.clusters_enabled
        })
    }

    pub fn set_force_target(&self, id: impl Into<String>) {
        self.force.set(id);
        self.notify_change();
    }

    /// Consume the pending force target.
    pub fn take_force_target(&self) -> Option<String> {
        self.force.take()
    }

    pub fn has_force_target(&self) -> bool {
        self.force.is_set()
    }

    // === Logs ===

    pub fn add_log(&self, level: LogLevel, label: &str, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            label: label.to_string(),
            message: message.into(),
        };
        self.mutate(|inner| inner.logs.push(entry));
    }

    // === Persistence ===

    /// Durable subset without transient statuses.
    pub fn durable(&self) -> PersistedState {
        self.read().durable()
    }

    /// Write the durable subset to the configured state file.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let _guard = self.persisting.lock().await;
        // Copy under the state lock, write without it.
        let state = self.durable();
        write_state(path, &state).await?;
        debug!(path = %path.display(), "State persisted");
        Ok(())
    }

    /// Restore durable state. Returns false if there was nothing to load.
    pub async fn load(&self) -> Result<bool, StoreError> {
        let Some(path) = &self.state_file else {
            return Ok(false);
        };
        let Some(state) = read_state(path).await? else {
            return Ok(false);
        };
        self.restore(state);
        Ok(true)
    }

    fn restore(&self, state: PersistedState) {
        let mut state = state.sanitized();
        state.machine_classes.sort_by(|a, b| a.id.cmp(&b.id));
        state.clusters.sort_by(|a, b| a.id.cmp(&b.id));
        self.mutate(|inner| {
            inner.versions = state.versions;
            inner.last_reconcile = state.last_reconcile;
            inner.machine_classes = state.machine_classes;
            inner.clusters = state.clusters;
            inner.clusters_enabled = state.clusters_enabled;
        });
    }
}
