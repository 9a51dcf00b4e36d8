//! `kind: Cluster / ControlPlane / Workers / Machine` template documents.

use super::{ClusterTemplateInfo, TemplateDialect, count_field, documents, list_item, value_after};
use crate::resource::NodeGroup;

const DEFAULT_CONTROL_PLANE_NAME: &str = "control-planes";

pub struct LegacyDialect;

impl TemplateDialect for LegacyDialect {
    fn detect(&self, _text: &str) -> bool {
        true
    }

    fn parse(&self, text: &str) -> ClusterTemplateInfo {
        let mut info = ClusterTemplateInfo::default();
        scan_versions(text, &mut info);

        for doc in documents(text) {
            let parsed = DocScan::scan(doc);
            parsed.merge_into(&mut info);
        }

        info
    }
}

/// Top-level `talosVersion:`/`kubernetesVersion:` or nested `talos: version:` blocks.
/// The first value found wins.
fn scan_versions(text: &str, info: &mut ClusterTemplateInfo) {
    let mut in_talos = false;
    let mut in_kubernetes = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if info.talos_version.is_empty()
            && let Some(v) = value_after(trimmed, "talosVersion:")
        {
            info.talos_version = v.to_string();
        }
        if info.kubernetes_version.is_empty()
            && let Some(v) = value_after(trimmed, "kubernetesVersion:")
        {
            info.kubernetes_version = v.to_string();
        }

        match trimmed {
            "talos:" => {
                in_talos = true;
                in_kubernetes = false;
                continue;
            }
            "kubernetes:" => {
                in_kubernetes = true;
                in_talos = false;
                continue;
            }
            _ => {}
        }

        if let Some(v) = value_after(trimmed, "version:") {
            if in_talos && info.talos_version.is_empty() {
                info.talos_version = v.to_string();
            }
            if in_kubernetes && info.kubernetes_version.is_empty() {
                info.kubernetes_version = v.to_string();
            }
            in_talos = false;
            in_kubernetes = false;
            continue;
        }

        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            in_talos = false;
            in_kubernetes = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Machines,
    MachineClass,
    SystemExtensions,
}

/// What one document contributed.
#[derive(Debug, Default)]
struct DocScan {
    kind: String,
    name: String,
    machine_class: String,
    size: u32,
    machines: Vec<String>,
    extensions: Vec<String>,
}

impl DocScan {
    fn scan(doc: &str) -> Self {
        let mut scan = DocScan::default();
        let mut section = Section::None;

        for line in doc.lines() {
            let trimmed = line.trim();
            let top_level = line.starts_with(|c: char| c != ' ' && c != '\t');

            if let Some(kind) = value_after(trimmed, "kind:") {
                scan.kind = kind.to_string();
                section = Section::None;
                continue;
            }
            if section != Section::MachineClass
                && top_level
                && let Some(name) = value_after(trimmed, "name:")
            {
                scan.name = name.to_string();
                continue;
            }

            match scan.kind.as_str() {
                "ControlPlane" | "Workers" => {
                    if trimmed.starts_with("machines:") {
                        section = Section::Machines;
                    } else if trimmed.starts_with("machineClass:") {
                        section = Section::MachineClass;
                    } else if trimmed.starts_with("systemExtensions:") {
                        section = Section::SystemExtensions;
                    } else if let Some(item) = list_item(trimmed) {
                        match section {
                            Section::Machines => scan.machines.push(item.to_string()),
                            Section::SystemExtensions => scan.extensions.push(item.to_string()),
                            _ => {}
                        }
                    } else if section == Section::MachineClass
                        && let Some(name) = value_after(trimmed, "name:")
                    {
                        scan.machine_class = name.to_string();
                    } else if trimmed.starts_with("size:") {
                        scan.size = count_field(trimmed);
                    }
                }
                "Cluster" | "Machine" => {
                    if top_level && !trimmed.starts_with("- ") {
                        section = if trimmed.starts_with("systemExtensions:") {
                            Section::SystemExtensions
                        } else {
                            Section::None
                        };
                    } else if section == Section::SystemExtensions
                        && let Some(item) = list_item(trimmed)
                    {
                        scan.extensions.push(item.to_string());
                    }
                }
                _ => {}
            }
        }

        scan
    }

    /// Pool built from either an explicit machine list or a machine class allocation.
    fn node_group(self, name: String) -> NodeGroup {
        if self.machine_class.is_empty() {
            NodeGroup {
                name,
                count: self.machines.len() as u32,
                machine_class: None,
                machines: self.machines,
                extensions: self.extensions,
            }
        } else {
            NodeGroup {
                name,
                count: self.size,
                machine_class: Some(self.machine_class),
                machines: Vec::new(),
                extensions: self.extensions,
            }
        }
    }

    fn merge_into(self, info: &mut ClusterTemplateInfo) {
        match self.kind.as_str() {
            "ControlPlane" => {
                let name = if info.control_plane.name.is_empty() {
                    DEFAULT_CONTROL_PLANE_NAME.to_string()
                } else {
                    info.control_plane.name.clone()
                };
                info.control_plane = self.node_group(name);
            }
            "Workers" => {
                let name = self.name.clone();
                let group = self.node_group(name);
                info.workers.push(group);
            }
            "Cluster" => info.cluster_extensions.extend(self.extensions),
            "Machine" => {
                if !self.name.is_empty() && !self.extensions.is_empty() {
                    info.machine_extensions
                        .entry(self.name)
                        .or_default()
                        .extend(self.extensions);
                }
            }
            _ => {}
        }
    }
}
