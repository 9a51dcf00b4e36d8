//! Resource records and the run/health types published in snapshots.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    MachineClass,
    Cluster,
}

impl ResourceKind {
    /// Component label used in logs.
    pub fn component(&self) -> &'static str {
        match self {
            ResourceKind::MachineClass => "MachineClasses",
            ResourceKind::Cluster => "Clusters",
        }
    }

    /// Human-readable name used in conflict messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ResourceKind::MachineClass => "machine class",
            ResourceKind::Cluster => "cluster",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::MachineClass => write!(f, "MachineClass"),
            ResourceKind::Cluster => write!(f, "Cluster"),
        }
    }
}

/// Reconciliation status of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Success,
    Failed,
    OutOfSync,
    Syncing,
    Deleting,
    Unmanaged,
}

impl ResourceStatus {
    /// Statuses that only make sense while an operation is in flight.
    /// They must never be restored after a restart.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResourceStatus::Syncing | ResourceStatus::Deleting)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Success => "success",
            ResourceStatus::Failed => "failed",
            ResourceStatus::OutOfSync => "outofsync",
            ResourceStatus::Syncing => "syncing",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::Unmanaged => "unmanaged",
        };
        write!(f, "{}", s)
    }
}

/// How machines are provisioned into a machine class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionType {
    Auto,
    Manual,
}

impl ProvisionType {
    /// Auto-provisioned classes carry a `providerid:` field.
    pub fn detect(content: &str) -> Self {
        if content.contains("providerid:") {
            ProvisionType::Auto
        } else {
            ProvisionType::Manual
        }
    }
}

/// A group of cluster nodes (control plane or a worker pool).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    pub name: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machines: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
}

/// Cluster detail derived from the live export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub talos_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<NodeGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<NodeGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_extensions: BTreeMap<String, Vec<String>>,
}

/// Live readiness of a cluster as reported by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReadiness {
    pub ready: bool,
    pub kubernetes_api_ready: bool,
}

/// One tracked resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_type: Option<ProvisionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ClusterDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ClusterReadiness>,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, id: impl Into<String>, status: ResourceStatus) -> Self {
        Self {
            id: id.into(),
            kind,
            status,
            provision_type: None,
            diff: None,
            file_content: None,
            live_content: None,
            error: None,
            detail: None,
            readiness: None,
        }
    }

    pub fn machine_class(id: impl Into<String>, status: ResourceStatus) -> Self {
        Self::new(ResourceKind::MachineClass, id, status)
    }

    pub fn cluster(id: impl Into<String>, status: ResourceStatus) -> Self {
        Self::new(ResourceKind::Cluster, id, status)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        let diff = diff.into();
        self.diff = (!diff.is_empty()).then_some(diff);
        self
    }

    pub fn with_file_content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.file_content = (!content.is_empty()).then_some(content);
        self
    }

    pub fn with_live_content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.live_content = (!content.is_empty()).then_some(content);
        self
    }
}

/// Soft runs refresh the source without forcing a sync; hard runs always sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Soft,
    Hard,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunType::Soft => write!(f, "refresh"),
            RunType::Hard => write!(f, "sync"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Success,
    Failed,
}

/// One reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRun {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub run_type: Option<RunType>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ReconcileRun {
    fn default() -> Self {
        Self {
            run_type: None,
            status: RunStatus::Idle,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Source repository state. Transient: never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitState {
    pub repo: String,
    pub branch: String,
    pub sha: String,
    pub short_sha: String,
    pub commit_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Failed,
    #[default]
    Unknown,
}

/// Connectivity to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Control-plane server and client versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub omni_version: String,
    pub omnictl_version: String,
    pub version_mismatch: bool,
}

impl VersionInfo {
    pub fn new(omni_version: String, omnictl_version: String) -> Self {
        let version_mismatch = server_is_newer(&omni_version, &omnictl_version);
        Self {
            omni_version,
            omnictl_version,
            version_mismatch,
        }
    }
}

/// Returns true if the server version is strictly newer than the client.
/// Unparseable versions never count as a mismatch.
pub fn server_is_newer(server: &str, client: &str) -> bool {
    match (semver_triple(server), semver_triple(client)) {
        (Some(s), Some(c)) => s > c,
        _ => false,
    }
}

/// Parse `v1.5.1-rc1` into `(1, 5, 1)`.
fn semver_triple(version: &str) -> Option<(u64, u64, u64)> {
    let v = version.trim().trim_start_matches('v');
    let mut parts = v.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?;
    let patch = patch
        .split(['-', '+'])
        .next()
        .unwrap_or(patch)
        .parse()
        .ok()?;
    Some((major, minor, patch))
}
