//! Cycle driver: gates, triggers and the scheduling loop around the reconciler.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, LABEL_MAIN};
use crate::clients::git::resolve;
use crate::clients::{ControlPlane, SourceRepository};
use crate::error::{ClientResult, CycleError};
use crate::reconciler::Reconciler;
use crate::resource::{HealthStatus, ResourceKind, RunType, VersionInfo};
use crate::store::{Snapshot, StateStore};

/// What a cycle does when the control plane is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ConnectivityPolicy {
    /// End the run as failed without touching resources.
    #[default]
    SkipCycle,
    /// Record the failure and carry on.
    Advisory,
}

/// Answer to a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Triggered,
    AlreadyRunning,
    Blocked,
}

impl fmt::Display for TriggerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerOutcome::Triggered => write!(f, "triggered"),
            TriggerOutcome::AlreadyRunning => write!(f, "already running"),
            TriggerOutcome::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Machine class directory, relative to the checkout root.
    pub mc_path: String,
    /// Cluster bundle directory, relative to the checkout root.
    pub clusters_path: String,
    pub connectivity_policy: ConnectivityPolicy,
    pub refresh_interval: Duration,
    pub sync_interval: Duration,
    pub readiness_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mc_path: "machine-classes".to_string(),
            clusters_path: "clusters".to_string(),
            connectivity_policy: ConnectivityPolicy::default(),
            refresh_interval: Duration::from_secs(300),
            sync_interval: Duration::from_secs(3600),
            readiness_interval: Duration::from_secs(5),
        }
    }
}

type Triggers = (mpsc::Receiver<()>, mpsc::Receiver<()>);

pub struct Controller {
    store: Arc<StateStore>,
    client: Arc<dyn ControlPlane>,
    source: Arc<dyn SourceRepository>,
    reconciler: Reconciler,
    audit: AuditLog,
    config: ControllerConfig,
    cycle: tokio::sync::Mutex<()>,
    hard_tx: mpsc::Sender<()>,
    soft_tx: mpsc::Sender<()>,
    triggers: Mutex<Option<Triggers>>,
}

impl Controller {
    pub fn new(
        store: Arc<StateStore>,
        client: Arc<dyn ControlPlane>,
        source: Arc<dyn SourceRepository>,
        config: ControllerConfig,
    ) -> Self {
        let audit = AuditLog::new(Arc::clone(&store));
        let reconciler = Reconciler::new(Arc::clone(&client), Arc::clone(&store), audit.clone());
        let (hard_tx, hard_rx) = mpsc::channel(1);
        let (soft_tx, soft_rx) = mpsc::channel(1);

        Self {
            store,
            client,
            source,
            reconciler,
            audit,
            config,
            cycle: tokio::sync::Mutex::new(()),
            hard_tx,
            soft_tx,
            triggers: Mutex::new(Some((hard_rx, soft_rx))),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Change notifications; re-read [`Controller::snapshot`] on wake-up.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    // === Manual triggers ===

    /// Request a hard (sync) cycle. Blocked while the server is newer than the client.
    pub fn trigger_hard_reconcile(&self) -> TriggerOutcome {
        if self.store.version_mismatch() {
            return TriggerOutcome::Blocked;
        }
        self.trigger(&self.hard_tx)
    }

    /// Request a soft (refresh) cycle.
    pub fn trigger_soft_reconcile(&self) -> TriggerOutcome {
        self.trigger(&self.soft_tx)
    }

    fn trigger(&self, tx: &mpsc::Sender<()>) -> TriggerOutcome {
        if self.store.is_running() {
            return TriggerOutcome::AlreadyRunning;
        }
        match tx.try_send(()) {
            Ok(()) => TriggerOutcome::Triggered,
            Err(_) => TriggerOutcome::AlreadyRunning,
        }
    }

    /// Narrow the next cluster apply to `id` and force its sync.
    pub fn set_force_target(&self, id: impl Into<String>) {
        let id = id.into();
        self.audit
            .info(ResourceKind::Cluster.component(), format!("Force sync requested for {}", id));
        self.store.set_force_target(id);
    }

    /// Set the force target and request a hard cycle to consume it.
    pub fn force_sync(&self, id: impl Into<String>) -> TriggerOutcome {
        if self.store.version_mismatch() {
            return TriggerOutcome::Blocked;
        }
        self.set_force_target(id);
        self.trigger(&self.hard_tx)
    }

    /// Flip cluster sync, persist the new value and return it.
    pub async fn toggle_cluster_sync_enabled(&self) -> bool {
        let enabled = self.store.toggle_clusters_enabled();
        let state = if enabled { "enabled" } else { "disabled" };
        self.audit.info(LABEL_MAIN, format!("Cluster sync {}", state));
        self.persist().await;
        enabled
    }

    /// Export a live cluster as a template document.
    pub async fn export_cluster(&self, id: &str) -> ClientResult<String> {
        self.client.export(ResourceKind::Cluster, id).await
    }

    // === Cycle ===

    /// Run one reconciliation cycle.
    ///
    /// Returns `Ok(success)` once the cycle has run to completion, or
    /// [`CycleError::AlreadyRunning`] if another cycle holds the guard.
    pub async fn run_cycle(&self, run_type: RunType) -> Result<bool, CycleError> {
        let Ok(_guard) = self.cycle.try_lock() else {
            return Err(CycleError::AlreadyRunning);
        };

        self.store.run_started(run_type);
        self.audit.cycle_started(run_type);

        let success = self.cycle_body(run_type).await;

        self.store.run_finished(success);
        self.audit.cycle_finished(run_type, success);
        self.persist().await;
        self.poll_readiness().await;

        Ok(success)
    }

    async fn cycle_body(&self, run_type: RunType) -> bool {
        if !self.check_connectivity().await {
            return false;
        }

        let versions = self.refresh_versions().await;

        let changed = match self.source.sync().await {
            Ok(changed) => changed,
            Err(e) => {
                self.audit.source_failed(&e.to_string());
                return false;
            }
        };
        let git = self.source.git_state();
        self.audit
            .source_synced(&git.short_sha, &git.commit_message, changed);
        self.store.set_git(git);

        let checkout = self.source.checkout_path();
        let mc_dir = resolve(&checkout, &self.config.mc_path);
        let clusters_dir = resolve(&checkout, &self.config.clusters_path);

        if versions.version_mismatch {
            self.audit
                .version_mismatch(&versions.omni_version, &versions.omnictl_version);
            self.reconciler.diff_clusters(&clusters_dir).await;
            return false;
        }

        let clusters_enabled = self.store.clusters_enabled();

        if changed || run_type == RunType::Hard {
            self.reconciler.apply_machine_classes(&mc_dir).await;

            if clusters_enabled || self.store.has_force_target() {
                self.reconciler.apply_clusters(&clusters_dir).await;
            } else {
                self.reconciler.diff_clusters(&clusters_dir).await;
            }

            if clusters_enabled {
                self.reconciler.delete_clusters(&clusters_dir).await;
            } else {
                self.audit.info(
                    ResourceKind::Cluster.component(),
                    "Cluster sync disabled, skipping cluster delete",
                );
            }

            self.reconciler.delete_machine_classes(&mc_dir).await;
        } else {
            self.audit.info(LABEL_MAIN, "No changes detected, skipping apply");
            if !clusters_enabled {
                self.reconciler.diff_clusters(&clusters_dir).await;
            }
        }

        true
    }

    /// Record connectivity. Returns false if the cycle must stop here.
    async fn check_connectivity(&self) -> bool {
        match self.client.check_connectivity().await {
            Ok(()) => {
                self.store.set_connectivity(HealthStatus::Healthy, None);
                true
            }
            Err(e) => {
                let err = e.to_string();
                self.audit.connectivity_failed(&err);
                self.store.set_connectivity(HealthStatus::Failed, Some(err));
                self.config.connectivity_policy == ConnectivityPolicy::Advisory
            }
        }
    }

    /// Re-read server and client versions. A version that cannot be read keeps
    /// its previous value.
    pub async fn refresh_versions(&self) -> VersionInfo {
        let previous = self.store.versions();
        let server = match self.client.server_version().await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Failed to read server version");
                previous.omni_version
            }
        };
        let client = match self.client.client_version().await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Failed to read client version");
                previous.omnictl_version
            }
        };

        let versions = VersionInfo::new(server, client);
        self.store.set_versions(versions.clone());
        versions
    }

    /// Refresh cluster readiness. Failures leave the previous values in place.
    pub async fn poll_readiness(&self) {
        match self.client.cluster_readiness().await {
            Ok(readiness) => self.store.update_cluster_readiness(&readiness),
            Err(e) => debug!(error = %e, "Readiness poll failed"),
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.persist().await {
            self.audit
                .error(LABEL_MAIN, format!("Failed to persist state: {}", e));
        }
    }

    // === Loops ===

    fn take_triggers(&self) -> Option<Triggers> {
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn run_scheduled(&self, run_type: RunType) {
        if let Err(e) = self.run_cycle(run_type).await {
            debug!(%run_type, "Cycle not started: {}", e);
        }
    }

    /// Drive cycles until `shutdown` fires: a hard cycle at start, soft cycles
    /// when the refresh timer expires, hard cycles on the sync interval, plus
    /// manual triggers. The refresh timer restarts after every cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some((mut hard_rx, mut soft_rx)) = self.take_triggers() else {
            warn!("Controller loop already running");
            return;
        };

        info!(
            refresh = ?self.config.refresh_interval,
            sync = ?self.config.sync_interval,
            "Controller loop started"
        );
        self.run_scheduled(RunType::Hard).await;

        let refresh = tokio::time::sleep(self.config.refresh_interval);
        tokio::pin!(refresh);
        let mut sync = tokio::time::interval_at(
            Instant::now() + self.config.sync_interval,
            self.config.sync_interval,
        );
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let run_type = tokio::select! {
                _ = &mut refresh => RunType::Soft,
                _ = sync.tick() => RunType::Hard,
                Some(()) = hard_rx.recv() => RunType::Hard,
                Some(()) = soft_rx.recv() => RunType::Soft,
                _ = shutdown.changed() => break,
            };
            self.run_scheduled(run_type).await;
            refresh
                .as_mut()
                .reset(Instant::now() + self.config.refresh_interval);
        }

        info!("Controller loop stopped");
    }

    /// Poll cluster readiness on its own interval until `shutdown` fires.
    pub async fn run_readiness(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.readiness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_readiness().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Readiness poll stopped");
    }
}
