//! Declared resources read from the source checkout.
//!
//! Machine classes are `*.yaml`/`*.yml` files directly inside their directory,
//! each declaring one or more ids via `id:` lines. Clusters are subdirectories
//! holding a `cluster.yaml` whose first `name:` line is the cluster id.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use crate::resource::{ProvisionType, ResourceKind};

/// File name that marks a cluster bundle directory.
pub const CLUSTER_TEMPLATE_FILE: &str = "cluster.yaml";

/// One declaration file and the ids it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub path: PathBuf,
    pub content: String,
    pub ids: Vec<String>,
}

impl Declaration {
    pub fn provision_type(&self) -> ProvisionType {
        ProvisionType::detect(&self.content)
    }
}

/// Result of scanning one resource directory.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub kind: ResourceKind,
    pub dir: PathBuf,
    /// Declarations in lexical file order.
    pub declarations: Vec<Declaration>,
    /// Cluster bundles without a `name:` line.
    pub unnamed: Vec<PathBuf>,
    /// The directory did not exist or could not be listed.
    pub missing: bool,
}

impl Catalog {
    /// Scan `dir` for declarations of the given kind. Never fails; an
    /// unreadable directory produces an empty catalog flagged `missing`.
    pub async fn read(kind: ResourceKind, dir: &Path) -> Self {
        let mut catalog = Catalog {
            kind,
            dir: dir.to_path_buf(),
            declarations: Vec::new(),
            unnamed: Vec::new(),
            missing: false,
        };

        let entries = match list_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Declaration directory not readable");
                catalog.missing = true;
                return catalog;
            }
        };

        for (path, is_dir) in entries {
            match kind {
                ResourceKind::MachineClass => {
                    if is_dir || !is_yaml(&path) {
                        continue;
                    }
                    let Some(content) = read_file(&path).await else {
                        continue;
                    };
                    let ids = extract_ids(&content);
                    catalog.declarations.push(Declaration { path, content, ids });
                }
                ResourceKind::Cluster => {
                    if !is_dir {
                        continue;
                    }
                    let template = path.join(CLUSTER_TEMPLATE_FILE);
                    if !fs::try_exists(&template).await.unwrap_or(false) {
                        continue;
                    }
                    let Some(content) = read_file(&template).await else {
                        continue;
                    };
                    match extract_name(&content) {
                        Some(name) => catalog.declarations.push(Declaration {
                            path: template,
                            content,
                            ids: vec![name],
                        }),
                        None => catalog.unnamed.push(template),
                    }
                }
            }
        }

        catalog
    }

    pub async fn machine_classes(dir: &Path) -> Self {
        Self::read(ResourceKind::MachineClass, dir).await
    }

    pub async fn clusters(dir: &Path) -> Self {
        Self::read(ResourceKind::Cluster, dir).await
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// All declared ids, including conflicting ones.
    pub fn declared_ids(&self) -> BTreeSet<String> {
        self.declarations
            .iter()
            .flat_map(|d| d.ids.iter().cloned())
            .collect()
    }

    pub fn is_declared(&self, id: &str) -> bool {
        self.declarations
            .iter()
            .any(|d| d.ids.iter().any(|i| i == id))
    }

    /// Number of declared ids counted per file.
    pub fn id_count(&self) -> usize {
        self.declarations.iter().map(|d| d.ids.len()).sum()
    }

    /// Ids declared by more than one file, mapped to a message naming the files.
    pub fn conflicts(&self) -> BTreeMap<String, String> {
        let mut by_id: BTreeMap<&str, Vec<&Path>> = BTreeMap::new();
        for decl in &self.declarations {
            let mut seen = BTreeSet::new();
            for id in &decl.ids {
                if seen.insert(id.as_str()) {
                    by_id.entry(id.as_str()).or_default().push(&decl.path);
                }
            }
        }

        let root = self.repo_root();
        by_id
            .into_iter()
            .filter(|(_, files)| files.len() > 1)
            .map(|(id, files)| {
                let shown: Vec<String> = files.iter().map(|f| relative_to(f, root)).collect();
                let message = format!(
                    "Conflicting {} templates: {}",
                    self.kind.display_name(),
                    shown.join(", ")
                );
                (id.to_string(), message)
            })
            .collect()
    }

    /// Conflict messages are shown relative to the parent of the scanned directory.
    fn repo_root(&self) -> &Path {
        self.dir.parent().unwrap_or(&self.dir)
    }
}

/// Every `id:` value in the text, in order of appearance.
pub fn extract_ids(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| field_value(line, "id:"))
        .map(str::to_string)
        .collect()
}

/// The first `name:` value in the text.
pub fn extract_name(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|t| t.starts_with("name:"))
        .and_then(|t| t.split_whitespace().nth(1))
        .map(str::to_string)
}

/// Second whitespace field of a line whose trimmed form starts with `key`.
fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let trimmed = line.trim();
    if !trimmed.starts_with(key) {
        return None;
    }
    trimmed.split_whitespace().nth(1)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn relative_to(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

/// Directory entries sorted by name, with a flag for directories.
async fn list_dir(dir: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
    let mut reader = fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((entry.path(), is_dir));
    }
    entries.sort();
    Ok(entries)
}

async fn read_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path).await {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read declaration");
            None
        }
    }
}
