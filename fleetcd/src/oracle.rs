//! Decides whether a declaration needs to be applied.
//!
//! Clusters have a native diff on the control plane. Machine classes do not:
//! their dry-run always dumps the full resource, so an update is only real
//! when the normalized `spec:` sections of declaration and live state differ.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::Declaration;
use crate::clients::ControlPlane;
use crate::resource::ResourceKind;

/// Oracle verdict for one declaration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Noop,
    WouldCreate { diff: String },
    WouldUpdate { diff: String },
    Invalid { reason: String },
}

impl DiffOutcome {
    pub fn diff(&self) -> Option<&str> {
        match self {
            DiffOutcome::WouldCreate { diff } | DiffOutcome::WouldUpdate { diff } => Some(diff),
            _ => None,
        }
    }
}

/// Dry-run status lines that carry no resource content.
const STATUS_PREFIXES: [&str; 3] = ["Processing ", "Syncing resources from:", "Creating resource "];

/// Metadata fields that change on every write.
const BOOKKEEPING_PREFIXES: [&str; 3] = ["version:", "created:", "updated:"];

#[derive(Clone)]
pub struct DiffOracle {
    client: Arc<dyn ControlPlane>,
}

impl DiffOracle {
    pub fn new(client: Arc<dyn ControlPlane>) -> Self {
        Self { client }
    }

    /// Classify `decl`. `live` is a pre-fetched cache; ids missing from it are
    /// fetched individually.
    pub async fn needs_apply(
        &self,
        kind: ResourceKind,
        decl: &Declaration,
        live: &HashMap<String, String>,
    ) -> DiffOutcome {
        match kind {
            ResourceKind::Cluster => self.cluster_outcome(decl).await,
            ResourceKind::MachineClass => self.machine_class_outcome(decl, live).await,
        }
    }

    async fn cluster_outcome(&self, decl: &Declaration) -> DiffOutcome {
        if let Err(e) = self.client.validate(ResourceKind::Cluster, &decl.path).await {
            return DiffOutcome::Invalid {
                reason: e.to_string(),
            };
        }
        match self.client.diff(&decl.path).await {
            Ok(diff) if is_no_change(&diff) => DiffOutcome::Noop,
            Ok(diff) => DiffOutcome::WouldUpdate { diff },
            Err(e) => DiffOutcome::Invalid {
                reason: e.to_string(),
            },
        }
    }

    async fn machine_class_outcome(
        &self,
        decl: &Declaration,
        live: &HashMap<String, String>,
    ) -> DiffOutcome {
        let output = match self
            .client
            .validate(ResourceKind::MachineClass, &decl.path)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                return DiffOutcome::Invalid {
                    reason: e.to_string(),
                };
            }
        };

        if is_no_change(&output) {
            return DiffOutcome::Noop;
        }
        if output.contains("Creating resource") {
            return DiffOutcome::WouldCreate {
                diff: rendered_resource(&output),
            };
        }

        for id in &decl.ids {
            let live_content = match live.get(id) {
                Some(content) => content.clone(),
                None => match self.client.get_live(ResourceKind::MachineClass, id).await {
                    Ok(content) => content,
                    Err(e) => {
                        debug!(%id, error = %e, "No live machine class, apply needed");
                        return DiffOutcome::WouldUpdate { diff: output };
                    }
                },
            };
            let declared = document_for_id(&decl.content, id);
            if spec_section(declared) != spec_section(&live_content) {
                debug!(%id, "Machine class spec differs from live");
                return DiffOutcome::WouldUpdate { diff: output };
            }
        }

        DiffOutcome::Noop
    }
}

/// Empty output or an explicit `no changes` marker.
pub fn is_no_change(output: &str) -> bool {
    output.trim().is_empty() || output.contains("no changes")
}

/// Resource body of a create dry-run, from `metadata:`/`spec:` on, without
/// status lines and bookkeeping fields.
pub fn rendered_resource(output: &str) -> String {
    let mut in_resource = false;
    let mut lines = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if STATUS_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }
        if trimmed.starts_with("metadata:") || trimmed.starts_with("spec:") {
            in_resource = true;
        }
        if in_resource && !BOOKKEEPING_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            lines.push(line);
        }
    }

    lines.join("\n").trim().to_string()
}

/// The `---`-separated document containing the line `id: <id>`, or the whole
/// content if none matches.
pub fn document_for_id<'a>(content: &'a str, id: &str) -> &'a str {
    let needle = format!("id: {}", id);
    content
        .split("\n---")
        .find(|doc| doc.lines().any(|line| line.trim() == needle))
        .unwrap_or(content)
}

/// Normalized `spec:` block: trimmed non-blank lines up to the next top-level key.
pub fn spec_section(doc: &str) -> String {
    let mut lines = doc.lines().skip_while(|line| line.trim() != "spec:");
    if lines.next().is_none() {
        return String::new();
    }

    lines
        .take_while(|line| line.trim().is_empty() || line.starts_with([' ', '\t']))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
