//! Source repository backed by the `git` CLI.
//!
//! Every sync is a fresh shallow single-branch clone into the work directory.
//! Change detection compares the HEAD SHA with the one seen last time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use super::SourceRepository;
use crate::error::SourceError;
use crate::resource::GitState;

const SHORT_SHA_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct GitSourceConfig {
    pub repo: String,
    pub branch: String,
    /// Access token for private HTTPS repositories.
    pub token: Option<String>,
    pub work_dir: PathBuf,
}

pub struct GitSource {
    config: GitSourceConfig,
    state: Mutex<GitState>,
}

impl GitSource {
    pub fn new(config: GitSourceConfig) -> Self {
        let state = GitState {
            repo: config.repo.clone(),
            branch: config.branch.clone(),
            ..Default::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone URL with the token injected as HTTPS basic auth.
    fn clone_url(&self) -> String {
        match &self.config.token {
            Some(token) if !token.is_empty() => self
                .config
                .repo
                .replacen("https://", &format!("https://token:{}@", token), 1),
            _ => self.config.repo.clone(),
        }
    }

    /// Strip the token from command output before it reaches logs or errors.
    fn redact(&self, text: &str) -> String {
        match &self.config.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }

    async fn clone_fresh(&self) -> Result<(), SourceError> {
        let work_dir = &self.config.work_dir;
        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = work_dir.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(repo = %self.config.repo, branch = %self.config.branch, "Cloning repository");
        let output = Command::new("git")
            .arg("clone")
            .args(["--branch", &self.config.branch])
            .args(["--single-branch", "--depth", "1", "--quiet"])
            .arg(self.clone_url())
            .arg(work_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Clone(self.redact(stderr.trim())));
        }
        Ok(())
    }

    async fn git_in_checkout(&self, args: &[&str]) -> Result<String, SourceError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.config.work_dir)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Head(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceRepository for GitSource {
    async fn sync(&self) -> Result<bool, SourceError> {
        self.clone_fresh().await?;

        let sha = self.git_in_checkout(&["rev-parse", "HEAD"]).await?;
        let message = self
            .git_in_checkout(&["log", "-1", "--format=%s"])
            .await
            .unwrap_or_else(|_| "(unknown)".to_string());

        let previous = {
            let mut state = self.lock_state();
            let previous = std::mem::take(&mut state.sha);
            *state = GitState {
                repo: self.config.repo.clone(),
                branch: self.config.branch.clone(),
                short_sha: short_sha(&sha).to_string(),
                sha: sha.clone(),
                commit_message: message.clone(),
                last_sync: Some(Utc::now()),
            };
            previous
        };

        if previous.is_empty() {
            info!(repo = %self.config.repo, branch = %self.config.branch, sha = short_sha(&sha), "Cloned repository");
            return Ok(true);
        }
        if previous != sha {
            info!(sha = short_sha(&sha), %message, "New commit detected");
            return Ok(true);
        }
        Ok(false)
    }

    fn current_commit(&self) -> Option<String> {
        let state = self.lock_state();
        (!state.sha.is_empty()).then(|| state.sha.clone())
    }

    fn checkout_path(&self) -> PathBuf {
        self.config.work_dir.clone()
    }

    fn git_state(&self) -> GitState {
        self.lock_state().clone()
    }
}

/// First eight characters of a commit SHA.
pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(SHORT_SHA_LEN) {
        Some((idx, _)) => &sha[..idx],
        None => sha,
    }
}

/// Resolve a repository-relative directory inside the checkout.
pub fn resolve(checkout: &Path, relative: &str) -> PathBuf {
    checkout.join(relative.trim_start_matches('/'))
}
