//! On-disk representation of the durable state subset.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoreError;
use crate::resource::{ReconcileRun, ResourceRecord, RunStatus, VersionInfo};

/// Durable state. Git info and logs are not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(flatten)]
    pub versions: VersionInfo,
    #[serde(default)]
    pub last_reconcile: ReconcileRun,
    #[serde(default)]
    pub machine_classes: Vec<ResourceRecord>,
    #[serde(default)]
    pub clusters: Vec<ResourceRecord>,
    #[serde(default)]
    pub clusters_enabled: bool,
}

impl PersistedState {
    /// Drop records in transient statuses and any in-flight run marker.
    pub fn sanitized(mut self) -> Self {
        self.machine_classes.retain(|r| !r.status.is_transient());
        self.clusters.retain(|r| !r.status.is_transient());
        if self.last_reconcile.status == RunStatus::Running {
            self.last_reconcile.status = RunStatus::Failed;
        }
        self
    }
}

/// Write state as pretty JSON via a temp file and rename.
pub async fn write_state(path: &Path, state: &PersistedState) -> Result<(), StoreError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).await?;
    }

    let data = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read state if the file exists. A missing file is not an error.
pub async fn read_state(path: &Path) -> Result<Option<PersistedState>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(data) => {
            let state: PersistedState = serde_json::from_str(&data)?;
            Ok(Some(state.sanitized()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
