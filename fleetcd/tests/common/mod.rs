//! In-memory control plane and source repository for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use fleetcd::catalog::{extract_ids, extract_name};
use fleetcd::clients::{ControlPlane, SourceRepository};
use fleetcd::error::{ClientError, ClientResult, SourceError};
use fleetcd::oracle::document_for_id;
use fleetcd::resource::{ClusterReadiness, GitState, ResourceKind};
use fleetcd::{Controller, ControllerConfig, StateStore, StoreConfig};

#[derive(Debug, Clone)]
pub struct LiveCluster {
    pub content: String,
    pub owned: bool,
    pub ready: bool,
}

#[derive(Default)]
struct Plane {
    machine_classes: BTreeMap<String, String>,
    clusters: BTreeMap<String, LiveCluster>,
    calls: Vec<String>,
    unreachable: bool,
    server_version: String,
    client_version: String,
    invalid: HashSet<String>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
    in_use: HashSet<String>,
    crash_on_sync: HashSet<String>,
}

/// Scriptable control plane. Mutating calls are recorded as
/// `"<op> <target>"` strings, e.g. `apply mc.yaml`, `sync alpha`,
/// `delete cluster alpha`.
pub struct FakeControlPlane {
    plane: Mutex<Plane>,
}

fn failed(command: &str, output: impl Into<String>) -> ClientError {
    ClientError::CommandFailed {
        command: command.to_string(),
        output: output.into(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read(path: &Path) -> ClientResult<String> {
    std::fs::read_to_string(path).map_err(|e| failed("read", e.to_string()))
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self {
            plane: Mutex::new(Plane {
                server_version: "v1.5.0".to_string(),
                client_version: "v1.5.0".to_string(),
                ..Default::default()
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Plane) -> T) -> T {
        let mut plane = self.plane.lock().unwrap();
        f(&mut plane)
    }

    pub fn add_machine_class(&self, id: &str, content: &str) {
        self.with(|p| p.machine_classes.insert(id.to_string(), content.to_string()));
    }

    pub fn add_cluster(&self, id: &str, content: &str, owned: bool) {
        self.with(|p| {
            let ready = p.clusters.get(id).is_some_and(|c| c.ready);
            p.clusters.insert(
                id.to_string(),
                LiveCluster {
                    content: content.to_string(),
                    owned,
                    ready,
                },
            )
        });
    }

    pub fn set_ready(&self, id: &str, ready: bool) {
        self.with(|p| {
            if let Some(c) = p.clusters.get_mut(id) {
                c.ready = ready;
            }
        });
    }

    pub fn machine_class_ids(&self) -> Vec<String> {
        self.with(|p| p.machine_classes.keys().cloned().collect())
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        self.with(|p| p.clusters.keys().cloned().collect())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|p| p.calls.clone())
    }

    /// Mutating calls only: apply, sync and delete.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("apply ") || c.starts_with("sync ") || c.starts_with("delete "))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.with(|p| p.calls.clear());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with(|p| p.unreachable = unreachable);
    }

    pub fn set_versions(&self, server: &str, client: &str) {
        self.with(|p| {
            p.server_version = server.to_string();
            p.client_version = client.to_string();
        });
    }

    /// Validation fails for this file name (machine classes) or cluster id.
    pub fn mark_invalid(&self, target: &str) {
        self.with(|p| p.invalid.insert(target.to_string()));
    }

    /// Apply fails for this file name; sync fails for this cluster id.
    pub fn fail_apply(&self, target: &str) {
        self.with(|p| p.fail_apply.insert(target.to_string()));
    }

    pub fn fail_delete(&self, id: &str) {
        self.with(|p| p.fail_delete.insert(id.to_string()));
    }

    pub fn mark_in_use(&self, id: &str) {
        self.with(|p| p.in_use.insert(id.to_string()));
    }

    /// Panic inside `sync` for the named cluster.
    pub fn crash_on_sync(&self, name: &str) {
        self.with(|p| p.crash_on_sync.insert(name.to_string()));
    }

    fn record(&self, call: String) {
        self.with(|p| p.calls.push(call));
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn check_connectivity(&self) -> ClientResult<()> {
        if self.with(|p| p.unreachable) {
            return Err(failed("get sysversion", "connection refused"));
        }
        Ok(())
    }

    async fn server_version(&self) -> ClientResult<String> {
        self.with(|p| {
            if p.unreachable {
                Err(failed("get sysversion", "connection refused"))
            } else {
                Ok(p.server_version.clone())
            }
        })
    }

    async fn client_version(&self) -> ClientResult<String> {
        Ok(self.with(|p| p.client_version.clone()))
    }

    async fn list_ids(&self, kind: ResourceKind) -> ClientResult<Vec<String>> {
        Ok(match kind {
            ResourceKind::MachineClass => self.machine_class_ids(),
            ResourceKind::Cluster => self.cluster_ids(),
        })
    }

    async fn get_live(&self, kind: ResourceKind, id: &str) -> ClientResult<String> {
        self.with(|p| match kind {
            ResourceKind::MachineClass => p.machine_classes.get(id).cloned(),
            ResourceKind::Cluster => p.clusters.get(id).map(|c| c.content.clone()),
        })
        .ok_or_else(|| failed("get", format!("{} not found", id)))
    }

    async fn get_all_live(&self, kind: ResourceKind) -> ClientResult<HashMap<String, String>> {
        Ok(self.with(|p| match kind {
            ResourceKind::MachineClass => p
                .machine_classes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ResourceKind::Cluster => p
                .clusters
                .iter()
                .map(|(k, c)| (k.clone(), c.content.clone()))
                .collect(),
        }))
    }

    async fn validate(&self, kind: ResourceKind, path: &Path) -> ClientResult<String> {
        let content = read(path)?;
        match kind {
            ResourceKind::MachineClass => {
                if self.with(|p| p.invalid.contains(&file_name(path))) {
                    return Err(failed("apply --dry-run", "spec.matchlabels: invalid"));
                }
                let ids = extract_ids(&content);
                let missing = self.with(|p| {
                    ids.iter()
                        .find(|id| !p.machine_classes.contains_key(*id))
                        .cloned()
                });
                // Dry-runs always dump the full resource, with fresh bookkeeping.
                let mut output = format!("Processing file {}\n", path.display());
                match missing {
                    Some(id) => output.push_str(&format!(
                        "Creating resource MachineClasses.omni.sidero.dev({})\n",
                        id
                    )),
                    None => output.push_str(&format!(
                        "Updating resource MachineClasses.omni.sidero.dev({})\n",
                        ids.join(",")
                    )),
                }
                output.push_str(&content);
                output.push_str("\n  version: 42\n");
                Ok(output)
            }
            ResourceKind::Cluster => {
                let name = extract_name(&content).unwrap_or_default();
                if self.with(|p| p.invalid.contains(&name)) {
                    return Err(failed("cluster template validate", "unknown machine class"));
                }
                Ok(String::new())
            }
        }
    }

    async fn diff(&self, path: &Path) -> ClientResult<String> {
        let content = read(path)?;
        let name = extract_name(&content).unwrap_or_default();
        let same = self.with(|p| p.clusters.get(&name).is_some_and(|c| c.content == content));
        if same {
            Ok(String::new())
        } else {
            Ok(format!("--- {}\n+++ {}\n+{}", name, name, content))
        }
    }

    async fn apply(&self, path: &Path) -> ClientResult<()> {
        let name = file_name(path);
        self.record(format!("apply {}", name));
        if self.with(|p| p.fail_apply.contains(&name)) {
            return Err(failed("apply", "admission webhook denied"));
        }
        let content = read(path)?;
        self.with(|p| {
            for id in extract_ids(&content) {
                let doc = document_for_id(&content, &id).trim().to_string();
                p.machine_classes.insert(id, doc);
            }
        });
        Ok(())
    }

    async fn sync(&self, path: &Path) -> ClientResult<()> {
        let content = read(path)?;
        let name = extract_name(&content).unwrap_or_default();
        self.record(format!("sync {}", name));
        if self.with(|p| p.crash_on_sync.contains(&name)) {
            panic!("sync of {} crashed", name);
        }
        if self.with(|p| p.fail_apply.contains(&name)) {
            return Err(failed("cluster template sync", "machine class not found"));
        }
        self.add_cluster(&name, &content, true);
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ClientResult<String> {
        let label = match kind {
            ResourceKind::MachineClass => "machineclass",
            ResourceKind::Cluster => "cluster",
        };
        self.record(format!("delete {} {}", label, id));
        self.with(|p| {
            if p.in_use.contains(id) {
                return Err(failed(
                    "delete",
                    format!("machine class {} is still in use by cluster", id),
                ));
            }
            if p.fail_delete.contains(id) {
                return Err(failed("delete", "timeout waiting for teardown"));
            }
            let removed = match kind {
                ResourceKind::MachineClass => p.machine_classes.remove(id).is_some(),
                ResourceKind::Cluster => p.clusters.remove(id).is_some(),
            };
            if !removed {
                return Err(failed("delete", format!("{} not found", id)));
            }
            Ok(format!("destroyed {}", id))
        })
    }

    async fn is_controller_owned(&self, kind: ResourceKind, id: &str) -> ClientResult<bool> {
        match kind {
            ResourceKind::MachineClass => Err(ClientError::Unsupported(
                "ownership of machine classes".to_string(),
            )),
            ResourceKind::Cluster => Ok(self.with(|p| p.clusters.get(id).is_some_and(|c| c.owned))),
        }
    }

    async fn export(&self, kind: ResourceKind, id: &str) -> ClientResult<String> {
        self.get_live(kind, id).await
    }

    async fn cluster_readiness(&self) -> ClientResult<HashMap<String, ClusterReadiness>> {
        Ok(self.with(|p| {
            p.clusters
                .iter()
                .map(|(id, c)| {
                    (
                        id.clone(),
                        ClusterReadiness {
                            ready: c.ready,
                            kubernetes_api_ready: c.ready,
                        },
                    )
                })
                .collect()
        }))
    }
}

/// Checkout in a temp directory. Every write is a new commit.
pub struct FakeSource {
    dir: TempDir,
    commits: Mutex<u32>,
    synced: Mutex<u32>,
    broken: Mutex<bool>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            commits: Mutex::new(1),
            synced: Mutex::new(0),
            broken: Mutex::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
        *self.commits.lock().unwrap() += 1;
    }

    pub fn remove(&self, rel: &str) {
        let path = self.dir.path().join(rel);
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
        *self.commits.lock().unwrap() += 1;
    }

    pub fn set_broken(&self, broken: bool) {
        *self.broken.lock().unwrap() = broken;
    }

    fn sha(commit: u32) -> String {
        format!("{:040x}", commit)
    }
}

#[async_trait]
impl SourceRepository for FakeSource {
    async fn sync(&self) -> Result<bool, SourceError> {
        if *self.broken.lock().unwrap() {
            return Err(SourceError::Clone("repository not found".to_string()));
        }
        let head = *self.commits.lock().unwrap();
        let mut synced = self.synced.lock().unwrap();
        let changed = *synced != head;
        *synced = head;
        Ok(changed)
    }

    fn current_commit(&self) -> Option<String> {
        let synced = *self.synced.lock().unwrap();
        (synced > 0).then(|| Self::sha(synced))
    }

    fn checkout_path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn git_state(&self) -> GitState {
        let sha = self.current_commit().unwrap_or_default();
        GitState {
            repo: "https://example.com/fleet.git".to_string(),
            branch: "main".to_string(),
            short_sha: sha.chars().take(8).collect(),
            sha,
            commit_message: "update fleet".to_string(),
            last_sync: Some(Utc::now()),
        }
    }
}

pub struct Harness {
    pub plane: Arc<FakeControlPlane>,
    pub source: Arc<FakeSource>,
    pub store: Arc<StateStore>,
    pub controller: Arc<Controller>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default(), ControllerConfig::default())
    }

    pub fn with_config(store_config: StoreConfig, config: ControllerConfig) -> Self {
        let plane = Arc::new(FakeControlPlane::new());
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(StateStore::new(store_config));
        let controller = Arc::new(Controller::new(
            Arc::clone(&store),
            plane.clone(),
            source.clone(),
            config,
        ));
        Self {
            plane,
            source,
            store,
            controller,
        }
    }
}

pub fn machine_class(id: &str, label: &str) -> String {
    format!(
        "metadata:\n  namespace: default\n  type: MachineClasses.omni.sidero.dev\n  id: {}\nspec:\n  matchlabels:\n    - {}\n",
        id, label
    )
}

pub fn provider_machine_class(id: &str) -> String {
    format!(
        "metadata:\n  type: MachineClasses.omni.sidero.dev\n  id: {}\nspec:\n  autoprovision:\n    providerid: kubevirt\n",
        id
    )
}

pub fn cluster_template(name: &str, kubernetes: &str) -> String {
    format!(
        "kind: Cluster\nname: {}\nkubernetes:\n  version: {}\ntalos:\n  version: v1.7.0\n---\nkind: ControlPlane\nmachineClass:\n  name: mc-cp\n  size: 3\n---\nkind: Workers\nname: workers\nmachineClass:\n  name: mc-worker\n  size: 2\n",
        name, kubernetes
    )
}
