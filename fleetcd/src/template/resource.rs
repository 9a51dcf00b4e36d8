//! Typed-resource documents as rendered by `omnictl cluster template render`.
//!
//! Roles and relationships live in `metadata.labels`; machine set sizing in
//! `spec.machineallocation`. Nesting is recognized by indentation depth
//! (0, 2 and 4 columns).

use std::collections::HashMap;

use super::{ClusterTemplateInfo, TemplateDialect, count_field, documents, list_item, value_after};
use crate::resource::NodeGroup;

const TYPE_MARKERS: [&str; 3] = [
    "type: MachineSets.omni.sidero.dev",
    "type: Clusters.omni.sidero.dev",
    "type: ExtensionsConfigurations.omni.sidero.dev",
];

const LABEL_CLUSTER: &str = "omni.sidero.dev/cluster:";
const LABEL_CONTROL_PLANE: &str = "omni.sidero.dev/role-controlplane";
const LABEL_WORKER: &str = "omni.sidero.dev/role-worker";
const LABEL_MACHINE_SET: &str = "omni.sidero.dev/machine-set:";

pub struct ResourceDialect;

impl TemplateDialect for ResourceDialect {
    fn detect(&self, text: &str) -> bool {
        text.lines().map(str::trim).any(|t| TYPE_MARKERS.iter().any(|m| t.starts_with(m)))
    }

    fn parse(&self, text: &str) -> ClusterTemplateInfo {
        let mut info = ClusterTemplateInfo::default();
        let mut machine_sets = Vec::new();
        let mut extensions: HashMap<String, Vec<String>> = HashMap::new();

        for doc in documents(text) {
            let scan = ResourceDoc::scan(doc, &mut info);
            if scan.doc_type.contains("MachineSets") {
                machine_sets.push(scan);
            } else if scan.doc_type.contains("ExtensionsConfigurations")
                && !scan.machine_set.is_empty()
            {
                extensions.insert(scan.machine_set, scan.extensions);
            }
        }

        for ms in machine_sets {
            let exts = extensions.get(&ms.id).cloned().unwrap_or_default();
            let name = ms.display_name();
            let group = NodeGroup {
                name,
                count: ms.machine_count,
                machine_class: (!ms.machine_class.is_empty()).then(|| ms.machine_class.clone()),
                machines: Vec::new(),
                extensions: exts,
            };
            if ms.control_plane {
                info.control_plane = group;
            } else if ms.worker {
                info.workers.push(group);
            }
        }

        info
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Metadata,
    Spec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubSection {
    None,
    Labels,
    MachineAllocation,
    Extensions,
}

#[derive(Debug, Default)]
struct ResourceDoc {
    doc_type: String,
    id: String,
    cluster: String,
    machine_set: String,
    control_plane: bool,
    worker: bool,
    machine_class: String,
    machine_count: u32,
    extensions: Vec<String>,
}

impl ResourceDoc {
    /// Scan one document. Versions found in any spec are written straight to `info`.
    fn scan(doc: &str, info: &mut ClusterTemplateInfo) -> Self {
        let mut scan = ResourceDoc::default();
        let mut section = Section::None;
        let mut sub = SubSection::None;

        for line in doc.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let indent = line.len() - line.trim_start_matches([' ', '\t']).len();

            match indent {
                0 => {
                    section = match trimmed {
                        "metadata:" => Section::Metadata,
                        "spec:" => Section::Spec,
                        _ => Section::None,
                    };
                    sub = SubSection::None;
                }
                2 => {
                    sub = SubSection::None;
                    match section {
                        Section::Metadata => {
                            if trimmed == "labels:" {
                                sub = SubSection::Labels;
                            } else if let Some(v) = value_after(trimmed, "type:") {
                                scan.doc_type = v.to_string();
                            } else if let Some(v) = value_after(trimmed, "id:") {
                                scan.id = v.to_string();
                            }
                        }
                        Section::Spec => {
                            if trimmed.starts_with("machineallocation:") {
                                sub = SubSection::MachineAllocation;
                            } else if trimmed.starts_with("extensions:") {
                                sub = SubSection::Extensions;
                            } else if let Some(v) = value_after(trimmed, "talosversion:") {
                                if info.talos_version.is_empty() {
                                    info.talos_version = v.to_string();
                                }
                            } else if let Some(v) = value_after(trimmed, "kubernetesversion:")
                                && info.kubernetes_version.is_empty()
                            {
                                info.kubernetes_version = v.to_string();
                            }
                        }
                        Section::None => {}
                    }
                }
                4 => match sub {
                    SubSection::Labels => {
                        if let Some(v) = value_after(trimmed, LABEL_CLUSTER) {
                            scan.cluster = v.to_string();
                        } else if trimmed.starts_with(LABEL_CONTROL_PLANE) {
                            scan.control_plane = true;
                        } else if trimmed.starts_with(LABEL_WORKER) {
                            scan.worker = true;
                        } else if let Some(v) = value_after(trimmed, LABEL_MACHINE_SET) {
                            scan.machine_set = v.to_string();
                        }
                    }
                    SubSection::MachineAllocation => {
                        if let Some(v) = value_after(trimmed, "name:") {
                            scan.machine_class = v.to_string();
                        } else if trimmed.starts_with("machinecount:") {
                            scan.machine_count = count_field(trimmed);
                        }
                    }
                    SubSection::Extensions => {
                        if let Some(item) = list_item(trimmed) {
                            scan.extensions.push(item.to_string());
                        }
                    }
                    SubSection::None => {}
                },
                _ => {}
            }
        }

        scan
    }

    /// Machine set id without the `<cluster>-` prefix.
    fn display_name(&self) -> String {
        if !self.cluster.is_empty()
            && let Some(rest) = self
                .id
                .strip_prefix(self.cluster.as_str())
                .and_then(|r| r.strip_prefix('-'))
        {
            return rest.to_string();
        }
        self.id.clone()
    }
}
