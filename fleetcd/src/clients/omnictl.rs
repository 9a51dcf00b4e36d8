//! Control-plane client backed by the `omnictl` CLI.
//!
//! Uses shell commands for every operation; the service-account key and
//! endpoint are read by `omnictl` from its own environment.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::debug;

use super::{ControlPlane, MANAGED_BY_TEMPLATES};
use crate::catalog::CLUSTER_TEMPLATE_FILE;
use crate::error::{ClientError, ClientResult};
use crate::resource::{ClusterReadiness, ResourceKind};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const TRANSIENT_MARKERS: [&str; 4] = [
    "missing HTTP content-type",
    "connection refused",
    "connection reset",
    "timeout",
];

/// Captured result of one CLI invocation.
struct CommandOutput {
    success: bool,
    /// stdout followed by stderr, trimmed.
    text: String,
}

#[derive(Debug, Clone)]
pub struct OmnictlClient {
    binary: String,
}

impl Default for OmnictlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OmnictlClient {
    pub fn new() -> Self {
        Self::with_binary("omnictl")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    async fn exec(&self, args: &[&str], dir: Option<&Path>) -> ClientResult<CommandOutput> {
        debug!(command = %self.describe(args), "Running omnictl");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await.map_err(|source| ClientError::Spawn {
            command: self.describe(args),
            source,
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            success: output.status.success(),
            text: text.trim().to_string(),
        })
    }

    /// Run and fail on a non-zero exit status.
    async fn run(&self, args: &[&str], dir: Option<&Path>) -> ClientResult<String> {
        let output = self.exec(args, dir).await?;
        if !output.success {
            return Err(ClientError::CommandFailed {
                command: self.describe(args),
                output: output.text,
            });
        }
        Ok(output.text)
    }

    /// Like [`Self::run`], retrying transient transport errors with exponential backoff.
    async fn run_with_retry(&self, args: &[&str]) -> ClientResult<String> {
        let mut attempt = 0;
        loop {
            match self.run(args, None).await {
                Err(ClientError::CommandFailed { command, output })
                    if attempt + 1 < MAX_ATTEMPTS && is_transient(&output) =>
                {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    debug!(%command, ?delay, "Transient omnictl error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run a cluster template subcommand from the template's directory.
    async fn template_command(&self, action: &str, path: &Path) -> ClientResult<CommandOutput> {
        let (dir, file) = split_template_path(path);
        self.exec(&["cluster", "template", action, "-f", &file], dir)
            .await
    }

    async fn export_cluster(&self, id: &str) -> ClientResult<String> {
        self.run(&["cluster", "template", "export", "-c", id], None)
            .await
    }
}

#[async_trait]
impl ControlPlane for OmnictlClient {
    async fn check_connectivity(&self) -> ClientResult<()> {
        self.run(&["get", "sysversion"], None).await.map(|_| ())
    }

    async fn server_version(&self) -> ClientResult<String> {
        let out = self.run(&["get", "sysversion", "-o", "yaml"], None).await?;
        parse_server_version(&out)
            .ok_or_else(|| ClientError::Parse("no backendversion in sysversion".to_string()))
    }

    async fn client_version(&self) -> ClientResult<String> {
        let out = self.run(&["--version"], None).await?;
        Ok(parse_client_version(&out))
    }

    async fn list_ids(&self, kind: ResourceKind) -> ClientResult<Vec<String>> {
        let out = self
            .run_with_retry(&["get", plural(kind), "-o", "yaml"])
            .await?;
        Ok(parse_ids(&out))
    }

    async fn get_live(&self, kind: ResourceKind, id: &str) -> ClientResult<String> {
        match kind {
            ResourceKind::MachineClass => {
                self.run(&["get", "machineclass", id, "-o", "yaml"], None)
                    .await
            }
            ResourceKind::Cluster => self.export_cluster(id).await,
        }
    }

    async fn get_all_live(&self, kind: ResourceKind) -> ClientResult<HashMap<String, String>> {
        match kind {
            ResourceKind::MachineClass => {
                let out = self
                    .run(&["get", "machineclasses", "-o", "yaml"], None)
                    .await?;
                Ok(documents_by_id(&out))
            }
            ResourceKind::Cluster => {
                let ids = self.list_ids(kind).await?;
                let mut tasks = JoinSet::new();
                for id in ids {
                    let client = self.clone();
                    tasks.spawn(async move {
                        let content = client.export_cluster(&id).await;
                        (id, content)
                    });
                }

                let mut live = HashMap::new();
                while let Some(joined) = tasks.join_next().await {
                    if let Ok((id, Ok(content))) = joined
                        && !content.is_empty()
                    {
                        live.insert(id, content);
                    }
                }
                Ok(live)
            }
        }
    }

    async fn validate(&self, kind: ResourceKind, path: &Path) -> ClientResult<String> {
        match kind {
            ResourceKind::MachineClass => {
                let file = path.to_string_lossy();
                self.run(&["apply", "-f", &file, "--dry-run"], None).await
            }
            ResourceKind::Cluster => {
                let output = self.template_command("validate", path).await?;
                if !output.success {
                    return Err(ClientError::CommandFailed {
                        command: format!("{} cluster template validate", self.binary),
                        output: output.text,
                    });
                }
                Ok(output.text)
            }
        }
    }

    async fn diff(&self, path: &Path) -> ClientResult<String> {
        // A non-zero exit means differences were found
        let output = self.template_command("diff", path).await?;
        Ok(output.text)
    }

    async fn apply(&self, path: &Path) -> ClientResult<()> {
        let file = path.to_string_lossy();
        self.run(&["apply", "-f", &file], None).await.map(|_| ())
    }

    async fn sync(&self, path: &Path) -> ClientResult<()> {
        let output = self.template_command("sync", path).await?;
        if !output.success {
            return Err(ClientError::CommandFailed {
                command: format!("{} cluster template sync", self.binary),
                output: output.text,
            });
        }
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ClientResult<String> {
        match kind {
            ResourceKind::MachineClass => {
                self.run(&["delete", "machineclasses", id], None).await
            }
            ResourceKind::Cluster => self.run(&["cluster", "delete", id], None).await,
        }
    }

    async fn is_controller_owned(&self, kind: ResourceKind, id: &str) -> ClientResult<bool> {
        match kind {
            ResourceKind::Cluster => {
                let out = self.run(&["get", "cluster", id, "-o", "yaml"], None).await?;
                Ok(out.contains(MANAGED_BY_TEMPLATES))
            }
            ResourceKind::MachineClass => Err(ClientError::Unsupported(
                "ownership lookup for machine classes".to_string(),
            )),
        }
    }

    async fn export(&self, kind: ResourceKind, id: &str) -> ClientResult<String> {
        self.get_live(kind, id).await
    }

    async fn cluster_readiness(&self) -> ClientResult<HashMap<String, ClusterReadiness>> {
        let out = self
            .run(&["get", "clusterstatus", "-o", "yaml"], None)
            .await?;
        Ok(parse_cluster_statuses(&out))
    }
}

fn plural(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::MachineClass => "machineclasses",
        ResourceKind::Cluster => "clusters",
    }
}

fn is_transient(output: &str) -> bool {
    TRANSIENT_MARKERS.iter().any(|m| output.contains(m))
}

/// Template commands run inside the bundle directory so relative patches resolve.
fn split_template_path(path: &Path) -> (Option<&Path>, String) {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| CLUSTER_TEMPLATE_FILE.to_string());
    (dir, file)
}

/// `omnictl version v1.5.1 (API Version: 2)` → `v1.5.1`.
fn parse_client_version(output: &str) -> String {
    let fields: Vec<&str> = output.split_whitespace().collect();
    fields
        .iter()
        .position(|f| *f == "version")
        .and_then(|i| fields.get(i + 1))
        .map(|v| v.to_string())
        .unwrap_or_else(|| output.trim().to_string())
}

fn parse_server_version(yaml: &str) -> Option<String> {
    yaml.lines()
        .map(str::trim)
        .find(|t| t.starts_with("backendversion:"))
        .and_then(|t| t.split_whitespace().nth(1))
        .map(str::to_string)
}

fn parse_ids(yaml: &str) -> Vec<String> {
    crate::catalog::extract_ids(yaml)
}

/// Split a multi-document dump into documents keyed by their `id:` (or `name:`).
fn documents_by_id(yaml: &str) -> HashMap<String, String> {
    yaml.split("\n---\n")
        .map(str::trim)
        .filter(|doc| !doc.is_empty() && *doc != "---")
        .filter_map(|doc| document_id(doc).map(|id| (id.to_string(), doc.to_string())))
        .collect()
}

fn document_id(doc: &str) -> Option<&str> {
    doc.lines().map(str::trim).find_map(|t| {
        if t.starts_with("id:") || t.starts_with("name:") {
            t.split_whitespace().nth(1)
        } else {
            None
        }
    })
}

fn parse_cluster_statuses(yaml: &str) -> HashMap<String, ClusterReadiness> {
    let mut result = HashMap::new();
    for doc in yaml.split("\n---\n").map(str::trim) {
        if doc.is_empty() || doc == "---" {
            continue;
        }
        let mut id = None;
        let mut readiness = ClusterReadiness::default();
        let mut in_spec = false;

        for line in doc.lines() {
            let trimmed = line.trim();
            let value = trimmed.split_whitespace().nth(1);
            match trimmed {
                "metadata:" => in_spec = false,
                "spec:" => in_spec = true,
                t if !in_spec && t.starts_with("id:") => id = value.or(id),
                t if in_spec && t.starts_with("ready:") => {
                    readiness.ready = value == Some("true");
                }
                t if in_spec && t.starts_with("kubernetesapiready:") => {
                    readiness.kubernetes_api_ready = value == Some("true");
                }
                _ => {}
            }
        }

        if let Some(id) = id {
            result.insert(id.to_string(), readiness);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_version() {
        assert_eq!(
            parse_client_version("omnictl version v1.5.1 (API Version: 2)"),
            "v1.5.1"
        );
        assert_eq!(parse_client_version("v1.5.1\n"), "v1.5.1");
    }

    #[test]
    fn parses_server_version() {
        let yaml = "metadata:\n  id: current\nspec:\n  backendversion: v1.5.3\n  instancename: prod\n";
        assert_eq!(parse_server_version(yaml).as_deref(), Some("v1.5.3"));
        assert_eq!(parse_server_version("spec: {}\n"), None);
    }

    #[test]
    fn splits_documents_by_id() {
        let yaml = "metadata:\n  id: mc-a\nspec:\n  x: 1\n---\nmetadata:\n  id: mc-b\nspec:\n  x: 2\n";
        let docs = documents_by_id(yaml);
        assert_eq!(docs.len(), 2);
        assert!(docs["mc-b"].contains("x: 2"));
    }

    #[test]
    fn parses_cluster_statuses() {
        let yaml = "\
metadata:
  namespace: default
  id: prod
spec:
  available: true
  ready: true
  kubernetesapiready: false
---
metadata:
  id: staging
spec:
  ready: false
  kubernetesapiready: true
";
        let statuses = parse_cluster_statuses(yaml);
        assert_eq!(
            statuses["prod"],
            ClusterReadiness {
                ready: true,
                kubernetes_api_ready: false
            }
        );
        assert!(statuses["staging"].kubernetes_api_ready);
        assert!(!statuses["staging"].ready);
    }

    #[test]
    fn template_commands_run_in_bundle_dir() {
        let (dir, file) = split_template_path(Path::new("/repo/clusters/prod/cluster.yaml"));
        assert_eq!(dir, Some(Path::new("/repo/clusters/prod")));
        assert_eq!(file, "cluster.yaml");
    }

    #[test]
    fn transient_errors_are_recognized() {
        assert!(is_transient("rpc error: connection refused"));
        assert!(!is_transient("resource not found"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let client = OmnictlClient::with_binary("/nonexistent/omnictl");
        let err = client.check_connectivity().await.unwrap_err();
        assert!(matches!(err, ClientError::Spawn { .. }));
    }
}
