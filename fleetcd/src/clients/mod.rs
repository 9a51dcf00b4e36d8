//! External collaborators of the reconciler.
//!
//! - [`ControlPlane`]: the fleet-management server, reached through `omnictl`
//! - [`SourceRepository`]: the declarative git repository

pub mod git;
pub mod omnictl;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{ClientResult, SourceError};
use crate::resource::{ClusterReadiness, GitState, ResourceKind};

pub use git::{GitSource, GitSourceConfig};
pub use omnictl::OmnictlClient;

/// Live resource annotation marking clusters created from cluster templates.
pub const MANAGED_BY_TEMPLATES: &str = "omni.sidero.dev/managed-by-cluster-templates";

/// Operations the reconciler needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Cheap round trip proving the server is reachable and the credentials work.
    async fn check_connectivity(&self) -> ClientResult<()>;

    async fn server_version(&self) -> ClientResult<String>;

    async fn client_version(&self) -> ClientResult<String>;

    /// Ids of every live resource of `kind`.
    async fn list_ids(&self, kind: ResourceKind) -> ClientResult<Vec<String>>;

    /// Live content of one resource.
    async fn get_live(&self, kind: ResourceKind, id: &str) -> ClientResult<String>;

    /// Live content of every resource of `kind`, keyed by id.
    async fn get_all_live(&self, kind: ResourceKind) -> ClientResult<HashMap<String, String>>;

    /// Validate a declaration without mutating anything. For machine classes
    /// this is a dry-run apply and the output is the rendered result.
    async fn validate(&self, kind: ResourceKind, path: &Path) -> ClientResult<String>;

    /// Native diff of a cluster template against live state.
    async fn diff(&self, path: &Path) -> ClientResult<String>;

    /// Apply a machine class declaration file.
    async fn apply(&self, path: &Path) -> ClientResult<()>;

    /// Create or update a cluster from its template.
    async fn sync(&self, path: &Path) -> ClientResult<()>;

    /// Delete a live resource. On rejection the error carries the command output.
    async fn delete(&self, kind: ResourceKind, id: &str) -> ClientResult<String>;

    /// Whether the live resource was created by this controller.
    async fn is_controller_owned(&self, kind: ResourceKind, id: &str) -> ClientResult<bool>;

    /// Export a live resource as a declaration.
    async fn export(&self, kind: ResourceKind, id: &str) -> ClientResult<String>;

    async fn cluster_readiness(&self) -> ClientResult<HashMap<String, ClusterReadiness>>;
}

/// The declarative source of desired state.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Refresh the local checkout. Returns true if the commit changed since
    /// the previous sync; the first sync always counts as changed.
    async fn sync(&self) -> Result<bool, SourceError>;

    fn current_commit(&self) -> Option<String>;

    fn checkout_path(&self) -> PathBuf;

    fn git_state(&self) -> GitState;
}
