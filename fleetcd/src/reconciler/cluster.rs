//! Cluster apply, diff-only, delete and orphan reclassification.
//!
//! Apply and delete fan out one task per cluster and join them before the
//! phase commits. Progress is reported through targeted status updates so
//! observers see `syncing`/`deleting` while the phase is still running.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::error;

use super::{PhaseSummary, Reconciler, merge_records};
use crate::catalog::{Catalog, Declaration};
use crate::oracle::DiffOutcome;
use crate::resource::{ResourceKind, ResourceRecord, ResourceStatus};
use crate::template::cluster_detail;

const KIND: ResourceKind = ResourceKind::Cluster;

/// Diff text shown on controller-owned clusters whose template is gone.
pub const REMOVED_FROM_SOURCE_HINT: &str =
    "Cluster template removed from git. Force sync to delete this cluster.";

/// Result of reconciling one cluster bundle.
struct ClusterOutcome {
    record: ResourceRecord,
    synced: bool,
}

impl Reconciler {
    /// Validate and sync declared clusters that differ from live state.
    ///
    /// A pending force target narrows the phase to that one cluster and syncs
    /// it even without a diff. A force target that is no longer declared but
    /// is owned by this controller is deleted instead.
    pub async fn apply_clusters(&self, dir: &Path) -> PhaseSummary {
        let force = self.store.take_force_target();
        let catalog = Catalog::clusters(dir).await;

        if let Some(target) = force.as_deref()
            && !catalog.is_declared(target)
        {
            return self.force_undeclared(target, &catalog).await;
        }

        if catalog.missing {
            self.audit.directory_missing(KIND, &dir.display().to_string());
            return PhaseSummary::skipped();
        }
        if catalog.is_empty() {
            self.audit
                .warn(KIND.component(), "No cluster templates found");
            self.reclassify_orphans(&catalog.declared_ids()).await;
            return PhaseSummary::skipped();
        }

        match force.as_deref() {
            Some(target) => self
                .audit
                .info(KIND.component(), format!("Force syncing cluster {}", target)),
            None => self.audit.info(
                KIND.component(),
                format!("Syncing {} cluster templates", catalog.declarations.len()),
            ),
        }
        self.warn_unnamed(&catalog);

        let mut summary = PhaseSummary::default();
        let mut processed = Vec::new();

        let conflicts = catalog.conflicts();
        for (id, message) in &conflicts {
            self.audit.conflict(KIND, id, message);
            let record = self.conflict_record(KIND, id, message);
            self.store.upsert_cluster(record.clone());
            processed.push(record);
            summary.failed += 1;
        }

        let live = Arc::new(self.live_cache(KIND).await);
        let mut tasks = JoinSet::new();
        let mut pending = BTreeSet::new();

        for decl in &catalog.declarations {
            let Some(id) = decl.ids.first() else {
                continue;
            };
            if conflicts.contains_key(id) {
                continue;
            }
            if force.as_deref().is_some_and(|target| target != id.as_str()) {
                continue;
            }

            let forced = force.is_some();
            pending.insert(id.clone());
            let this = self.clone();
            let decl = decl.clone();
            let live = Arc::clone(&live);
            tasks.spawn(async move { this.reconcile_cluster(&decl, forced, &live).await });
        }

        let mut aborted = String::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending.remove(&outcome.record.id);
                    if outcome.record.status == ResourceStatus::Failed {
                        summary.failed += 1;
                    } else if outcome.synced {
                        summary.ok += 1;
                    }
                    processed.push(outcome.record);
                }
                Err(e) => {
                    error!(component = KIND.component(), error = %e, "Cluster task panicked");
                    aborted = e.to_string();
                }
            }
        }
        // Ids that never reported back would otherwise stay `syncing`.
        for id in &pending {
            processed.push(self.aborted_record(id, &aborted));
            summary.failed += 1;
        }

        let merged = merge_records(self.store.clusters(), processed);
        self.store.replace_clusters(merged);

        let phase = if force.is_some() {
            "Force sync"
        } else {
            "Cluster apply"
        };
        self.audit
            .phase_result(KIND, phase, summary.ok, summary.failed);

        self.reclassify_orphans(&catalog.declared_ids()).await;
        summary
    }

    /// Validate, diff and, if needed, sync one bundle.
    async fn reconcile_cluster(
        &self,
        decl: &Declaration,
        forced: bool,
        live: &HashMap<String, String>,
    ) -> ClusterOutcome {
        let id = decl.ids.first().map(String::as_str).unwrap_or_default();

        let diff = match self.oracle.needs_apply(KIND, decl, live).await {
            DiffOutcome::Invalid { reason } => {
                self.audit.invalid(KIND, id, &reason);
                self.store.set_cluster_status(id, ResourceStatus::Failed);
                let record = self
                    .cluster_record(id, ResourceStatus::Failed, decl, String::new())
                    .with_error(reason);
                return ClusterOutcome {
                    record,
                    synced: false,
                };
            }
            DiffOutcome::Noop if !forced => {
                self.audit.up_to_date(KIND, id);
                let live_content = self.live_content(KIND, id, live).await;
                return ClusterOutcome {
                    record: self.cluster_record(id, ResourceStatus::Success, decl, live_content),
                    synced: false,
                };
            }
            outcome => outcome.diff().unwrap_or_default().to_string(),
        };

        if forced {
            self.audit
                .warn(KIND.component(), format!("Force syncing cluster {}", id));
        } else {
            self.audit
                .warn(KIND.component(), format!("Cluster {} out of sync", id));
            self.store.set_cluster_status(id, ResourceStatus::OutOfSync);
        }
        self.audit
            .info(KIND.component(), format!("Syncing cluster {}", id));
        self.store.set_cluster_status(id, ResourceStatus::Syncing);

        match self.client.sync(&decl.path).await {
            Ok(()) => {
                self.audit.applied(KIND, id);
                self.store.set_cluster_status(id, ResourceStatus::Success);
                // The pre-fetched cache is stale after a sync
                let live_content = self.client.get_live(KIND, id).await.unwrap_or_default();
                ClusterOutcome {
                    record: self.cluster_record(id, ResourceStatus::Success, decl, live_content),
                    synced: true,
                }
            }
            Err(e) => {
                let err = e.to_string();
                self.audit.apply_failed(KIND, id, &err);
                self.store.set_cluster_status(id, ResourceStatus::Failed);
                let live_content = self.live_content(KIND, id, live).await;
                let record = self
                    .cluster_record(id, ResourceStatus::Failed, decl, live_content)
                    .with_diff(diff)
                    .with_error(err);
                ClusterOutcome {
                    record,
                    synced: false,
                }
            }
        }
    }

    /// Force target without a template: delete it if this controller owns it.
    async fn force_undeclared(&self, target: &str, catalog: &Catalog) -> PhaseSummary {
        let mut summary = PhaseSummary::default();
        if self.is_owned(KIND, target).await {
            self.audit.warn(
                KIND.component(),
                format!("Cluster {} not in source, deleting", target),
            );
            if self.delete_cluster(target).await {
                summary.ok += 1;
            } else {
                summary.failed += 1;
            }
        } else {
            self.audit.warn(
                KIND.component(),
                format!("Force target {} is neither declared nor owned, nothing to do", target),
            );
            summary.skipped = true;
        }
        self.reclassify_orphans(&catalog.declared_ids()).await;
        summary
    }

    /// Classify declared clusters without mutating anything.
    pub async fn diff_clusters(&self, dir: &Path) -> PhaseSummary {
        let catalog = Catalog::clusters(dir).await;
        if catalog.missing || catalog.is_empty() {
            if catalog.missing {
                self.audit.directory_missing(KIND, &dir.display().to_string());
            } else {
                self.audit
                    .warn(KIND.component(), "No cluster templates found");
            }
            self.reclassify_orphans(&catalog.declared_ids()).await;
            return PhaseSummary::skipped();
        }

        self.audit.info(
            KIND.component(),
            format!(
                "Checking {} cluster templates for drift (sync disabled)",
                catalog.declarations.len()
            ),
        );
        self.warn_unnamed(&catalog);

        let live = self.live_cache(KIND).await;
        let conflicts = catalog.conflicts();
        let mut processed = Vec::new();
        let (mut in_sync, mut out_of_sync, mut failed) = (0, 0, 0);

        for (id, message) in &conflicts {
            self.audit.conflict(KIND, id, message);
            processed.push(self.conflict_record(KIND, id, message));
            out_of_sync += 1;
        }

        for decl in &catalog.declarations {
            let Some(id) = decl.ids.first() else {
                continue;
            };
            if conflicts.contains_key(id) {
                continue;
            }

            let outcome = self.oracle.needs_apply(KIND, decl, &live).await;
            let live_content = self.live_content(KIND, id, &live).await;
            let record = match outcome {
                DiffOutcome::Invalid { reason } => {
                    self.audit.invalid(KIND, id, &reason);
                    failed += 1;
                    self.cluster_record(id, ResourceStatus::Failed, decl, live_content)
                        .with_error(reason)
                }
                DiffOutcome::Noop => {
                    self.audit.up_to_date(KIND, id);
                    in_sync += 1;
                    self.cluster_record(id, ResourceStatus::Success, decl, live_content)
                }
                outcome => {
                    self.audit.warn(
                        KIND.component(),
                        format!("Cluster {} out of sync (sync disabled, skipping)", id),
                    );
                    out_of_sync += 1;
                    self.cluster_record(id, ResourceStatus::OutOfSync, decl, live_content)
                        .with_diff(outcome.diff().unwrap_or_default())
                }
            };
            processed.push(record);
        }

        let merged = merge_records(self.store.clusters(), processed);
        self.store.replace_clusters(merged);
        self.audit.info(
            KIND.component(),
            format!(
                "Cluster diff result: {} in sync, {} out of sync, {} failed",
                in_sync, out_of_sync, failed
            ),
        );

        self.reclassify_orphans(&catalog.declared_ids()).await;
        PhaseSummary {
            ok: in_sync,
            failed,
            skipped: false,
        }
    }

    /// Delete live clusters that are no longer declared and are owned by this
    /// controller. Clusters created by other means are left alone and show up
    /// as unmanaged after reclassification.
    pub async fn delete_clusters(&self, dir: &Path) -> PhaseSummary {
        let catalog = Catalog::clusters(dir).await;
        if catalog.missing {
            self.audit.nothing_declared(KIND, &dir.display().to_string());
        }
        let desired = catalog.declared_ids();

        let live_ids = match self.client.list_ids(KIND).await {
            Ok(ids) => ids,
            Err(e) => {
                self.audit
                    .error(KIND.component(), format!("Failed to list clusters: {}", e));
                return PhaseSummary::skipped();
            }
        };

        self.audit
            .info(KIND.component(), "Checking for template-managed clusters to delete");

        let mut tasks = JoinSet::new();
        let mut pending = BTreeSet::new();
        for id in live_ids.into_iter().filter(|id| !desired.contains(id)) {
            if !self.is_owned(KIND, &id).await {
                self.audit.debug(
                    KIND.component(),
                    format!("Cluster {} not managed by templates, ignoring", id),
                );
                continue;
            }

            pending.insert(id.clone());
            let this = self.clone();
            tasks.spawn(async move {
                this.audit.warn(
                    KIND.component(),
                    format!("Cluster {} not in source, deleting", id),
                );
                let deleted = this.delete_cluster(&id).await;
                (id, deleted)
            });
        }

        let mut summary = PhaseSummary::default();
        let mut aborted = String::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, deleted)) => {
                    pending.remove(&id);
                    if deleted {
                        summary.ok += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Err(e) => {
                    error!(component = KIND.component(), error = %e, "Cluster delete task panicked");
                    aborted = e.to_string();
                }
            }
        }
        for id in &pending {
            self.store.upsert_cluster(self.aborted_record(id, &aborted));
            summary.failed += 1;
        }

        if summary.ok == 0 && summary.failed == 0 {
            self.audit.info(KIND.component(), "No clusters to delete");
        } else {
            self.audit
                .phase_result(KIND, "Cluster delete", summary.ok, summary.failed);
        }

        self.reclassify_orphans(&desired).await;
        summary
    }

    /// Delete one cluster, reporting `deleting` while in flight. Returns success.
    async fn delete_cluster(&self, id: &str) -> bool {
        self.store.set_cluster_status(id, ResourceStatus::Deleting);
        match self.client.delete(KIND, id).await {
            Ok(_) => {
                self.audit.deleted(KIND, id);
                self.store.remove(KIND, id);
                true
            }
            Err(e) => {
                let err = e.to_string();
                self.audit.delete_failed(KIND, id, &err);
                let mut record = self
                    .store
                    .record(KIND, id)
                    .unwrap_or_else(|| ResourceRecord::cluster(id, ResourceStatus::Failed));
                record.status = ResourceStatus::Failed;
                record.error = Some(err);
                self.store.upsert_cluster(record);
                false
            }
        }
    }

    /// Bring tracked clusters in line with what is declared and what is live.
    ///
    /// Declared entries are kept as they are. Entries neither declared nor live
    /// are dropped. Live but undeclared entries become `outofsync` with a hint
    /// if this controller owns them and `unmanaged` otherwise; an owned entry
    /// whose last deletion failed stays `failed`. Live ids not tracked yet are
    /// added under the same rule.
    pub async fn reclassify_orphans(&self, declared: &BTreeSet<String>) {
        let live_ids = match self.client.list_ids(KIND).await {
            Ok(ids) => ids,
            Err(e) => {
                self.audit
                    .warn(KIND.component(), format!("Failed to list clusters: {}", e));
                return;
            }
        };
        let live: HashSet<&str> = live_ids.iter().map(String::as_str).collect();

        let existing = self.store.clusters();
        let tracked: HashSet<String> = existing.iter().map(|r| r.id.clone()).collect();
        let mut records = Vec::with_capacity(existing.len());

        for mut record in existing {
            if declared.contains(&record.id) {
                records.push(record);
                continue;
            }
            if !live.contains(record.id.as_str()) {
                continue;
            }
            if self.is_owned(KIND, &record.id).await {
                if !(record.status == ResourceStatus::Failed && record.error.is_some()) {
                    record.status = ResourceStatus::OutOfSync;
                }
                record.diff = Some(REMOVED_FROM_SOURCE_HINT.to_string());
            } else {
                record.status = ResourceStatus::Unmanaged;
                record.diff = None;
            }
            records.push(record);
        }

        for id in &live_ids {
            if tracked.contains(id) || declared.contains(id) {
                continue;
            }
            let record = if self.is_owned(KIND, id).await {
                ResourceRecord::cluster(id.as_str(), ResourceStatus::OutOfSync)
                    .with_diff(REMOVED_FROM_SOURCE_HINT)
            } else {
                ResourceRecord::cluster(id.as_str(), ResourceStatus::Unmanaged)
            };
            records.push(record);
        }

        self.store.replace_clusters(records);
    }

    fn cluster_record(
        &self,
        id: &str,
        status: ResourceStatus,
        decl: &Declaration,
        live_content: String,
    ) -> ResourceRecord {
        let mut record = ResourceRecord::cluster(id, status).with_file_content(decl.content.clone());
        if !live_content.is_empty() {
            record.detail = Some(cluster_detail(&live_content));
        }
        record.readiness = self.store.record(KIND, id).and_then(|r| r.readiness);
        record.with_live_content(live_content)
    }

    /// Tracked record for a cluster whose task died, marked failed.
    fn aborted_record(&self, id: &str, reason: &str) -> ResourceRecord {
        let mut record = self
            .store
            .record(KIND, id)
            .unwrap_or_else(|| ResourceRecord::cluster(id, ResourceStatus::Failed));
        record.status = ResourceStatus::Failed;
        record.error = Some(format!("Reconcile task aborted: {}", reason));
        record
    }

    fn warn_unnamed(&self, catalog: &Catalog) {
        for path in &catalog.unnamed {
            self.audit.warn(
                KIND.component(),
                format!("No cluster name found in {}, skipping", path.display()),
            );
        }
    }
}
