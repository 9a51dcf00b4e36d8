//! Structural summary of cluster templates.
//!
//! Two text dialects exist: the legacy `kind: Cluster / ControlPlane / Workers`
//! template and the typed-resource dump (`type: MachineSets.omni.sidero.dev`
//! and friends). Parsing is line-oriented and best-effort: malformed input
//! yields whatever could be recognized, never an error.

mod legacy;
mod resource;

use std::collections::BTreeMap;

use crate::resource::{ClusterDetail, NodeGroup};

pub use legacy::LegacyDialect;
pub use resource::ResourceDialect;

/// Parsed summary of a cluster template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTemplateInfo {
    pub talos_version: String,
    pub kubernetes_version: String,
    pub control_plane: NodeGroup,
    pub workers: Vec<NodeGroup>,
    /// Extensions on the cluster document itself.
    pub cluster_extensions: Vec<String>,
    /// Extensions on individual machine documents, keyed by machine name.
    pub machine_extensions: BTreeMap<String, Vec<String>>,
}

impl ClusterTemplateInfo {
    fn has_control_plane(&self) -> bool {
        self.control_plane != NodeGroup::default()
    }
}

impl From<ClusterTemplateInfo> for ClusterDetail {
    fn from(info: ClusterTemplateInfo) -> Self {
        let control_plane = info.has_control_plane().then_some(info.control_plane);
        ClusterDetail {
            talos_version: info.talos_version,
            kubernetes_version: info.kubernetes_version,
            control_plane,
            workers: info.workers,
            cluster_extensions: info.cluster_extensions,
            machine_extensions: info.machine_extensions,
        }
    }
}

/// A template text format.
pub trait TemplateDialect: Send + Sync {
    /// Whether `text` is written in this dialect.
    fn detect(&self, text: &str) -> bool;

    fn parse(&self, text: &str) -> ClusterTemplateInfo;
}

static LEGACY: LegacyDialect = LegacyDialect;
static RESOURCE: ResourceDialect = ResourceDialect;

/// Pick the dialect for `text`. Falls back to the legacy format.
pub fn dialect_for(text: &str) -> &'static dyn TemplateDialect {
    if RESOURCE.detect(text) {
        &RESOURCE
    } else {
        &LEGACY
    }
}

/// Parse a cluster template in either dialect.
pub fn parse_cluster_template(text: &str) -> ClusterTemplateInfo {
    dialect_for(text).parse(text)
}

/// Live cluster detail from an exported template. Empty input gives an empty detail.
pub fn cluster_detail(live: &str) -> ClusterDetail {
    parse_cluster_template(live).into()
}

/// YAML documents separated by `---` lines, trimmed, empties dropped.
pub(crate) fn documents(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n---").map(str::trim).filter(|d| !d.is_empty())
}

/// Value after `key` on a trimmed line, trimmed.
pub(crate) fn value_after<'a>(trimmed: &'a str, key: &str) -> Option<&'a str> {
    trimmed.strip_prefix(key).map(str::trim)
}

/// Item of a `- item` list line.
pub(crate) fn list_item(trimmed: &str) -> Option<&str> {
    trimmed.strip_prefix("- ").map(str::trim)
}

/// Number in the second whitespace field, zero if absent or malformed.
pub(crate) fn count_field(trimmed: &str) -> u32 {
    trimmed
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
