//! Reconciliation audit logging
//!
//! Writes every event both to `tracing` and to the store's log buffer, which
//! is what observers see. Debug events reach the buffer only while debug
//! logging is enabled.

use std::sync::Arc;

use tracing::{Level, debug, error, info, warn};

use crate::resource::{ResourceKind, RunType};
use crate::store::{LogLevel, StateStore};

pub const LABEL_MAIN: &str = "Main";
pub const LABEL_GIT: &str = "Git";

/// Audit logger bound to a state store.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<StateStore>,
}

impl AuditLog {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn log(&self, level: LogLevel, label: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => {
                debug!(component = label, "{}", message);
                if !tracing::enabled!(Level::DEBUG) {
                    return;
                }
            }
            LogLevel::Info => info!(component = label, "{}", message),
            LogLevel::Warn => warn!(component = label, "{}", message),
            LogLevel::Error => error!(component = label, "{}", message),
        }
        self.store.add_log(level, label, message);
    }

    pub fn debug(&self, label: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, label, message);
    }

    pub fn info(&self, label: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, label, message);
    }

    pub fn warn(&self, label: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, label, message);
    }

    pub fn error(&self, label: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, label, message);
    }

    // === Cycle Events ===

    pub fn cycle_started(&self, run_type: RunType) {
        self.info(LABEL_MAIN, format!("Starting reconcile ({})", run_type));
    }

    pub fn cycle_finished(&self, run_type: RunType, success: bool) {
        if success {
            self.info(LABEL_MAIN, format!("Reconcile complete ({})", run_type));
        } else {
            self.error(LABEL_MAIN, format!("Reconcile failed ({})", run_type));
        }
    }

    pub fn connectivity_failed(&self, err: &str) {
        self.error(LABEL_MAIN, format!("Control plane unreachable: {}", err));
    }

    pub fn version_mismatch(&self, server: &str, client: &str) {
        self.error(
            LABEL_MAIN,
            format!(
                "Server version {} is newer than omnictl {}, mutations suspended",
                server, client
            ),
        );
    }

    // === Source Events ===

    pub fn source_synced(&self, short_sha: &str, message: &str, changed: bool) {
        if changed {
            self.info(LABEL_GIT, format!("At commit {}: {}", short_sha, message));
        } else {
            self.debug(LABEL_GIT, format!("No new commits (at {})", short_sha));
        }
    }

    pub fn source_failed(&self, err: &str) {
        self.error(LABEL_GIT, format!("Git sync failed: {}", err));
    }

    // === Resource Events ===

    pub fn directory_missing(&self, kind: ResourceKind, path: &str) {
        self.warn(kind.component(), format!("Directory not found, skipping: {}", path));
    }

    /// A missing directory declares nothing, so every undeclared live resource
    /// becomes a delete candidate.
    pub fn nothing_declared(&self, kind: ResourceKind, path: &str) {
        self.warn(
            kind.component(),
            format!("Directory not found, treating as nothing declared: {}", path),
        );
    }

    pub fn conflict(&self, kind: ResourceKind, id: &str, message: &str) {
        self.error(
            kind.component(),
            format!("Duplicate {} id {}, skipping sync. {}", kind.display_name(), id, message),
        );
    }

    pub fn invalid(&self, kind: ResourceKind, ids: &str, reason: &str) {
        self.error(
            kind.component(),
            format!("Validation failed for {}: {}", ids, reason),
        );
    }

    pub fn up_to_date(&self, kind: ResourceKind, ids: &str) {
        self.debug(kind.component(), format!("Up to date: {}", ids));
    }

    pub fn applied(&self, kind: ResourceKind, ids: &str) {
        self.info(kind.component(), format!("Applied: {}", ids));
    }

    pub fn apply_failed(&self, kind: ResourceKind, ids: &str, err: &str) {
        self.error(kind.component(), format!("Apply failed for {}: {}", ids, err));
    }

    pub fn deleted(&self, kind: ResourceKind, id: &str) {
        self.info(kind.component(), format!("Deleted: {}", id));
    }

    pub fn delete_failed(&self, kind: ResourceKind, id: &str, err: &str) {
        self.error(kind.component(), format!("Delete failed for {}: {}", id, err));
    }

    pub fn phase_result(&self, kind: ResourceKind, phase: &str, ok: usize, failed: usize) {
        self.info(
            kind.component(),
            format!("{} result: {} ok, {} failed", phase, ok, failed),
        );
    }
}
