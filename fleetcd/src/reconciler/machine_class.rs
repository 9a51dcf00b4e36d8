//! Machine class apply and delete phases.

use std::collections::BTreeSet;
use std::path::Path;

use super::{PhaseSummary, Reconciler};
use crate::catalog::Catalog;
use crate::oracle::DiffOutcome;
use crate::resource::{ResourceKind, ResourceRecord, ResourceStatus};

const KIND: ResourceKind = ResourceKind::MachineClass;

impl Reconciler {
    /// Apply every declared machine class that differs from live state.
    ///
    /// Produces one record per declared id; the result replaces the tracked
    /// machine class set.
    pub async fn apply_machine_classes(&self, dir: &Path) -> PhaseSummary {
        let catalog = Catalog::machine_classes(dir).await;
        if catalog.missing {
            self.audit.directory_missing(KIND, &dir.display().to_string());
            return PhaseSummary::skipped();
        }
        if catalog.is_empty() {
            self.audit
                .warn(KIND.component(), format!("No YAML files found in {}", dir.display()));
            return PhaseSummary::skipped();
        }

        self.audit.info(
            KIND.component(),
            format!("Syncing {} machine classes", catalog.id_count()),
        );

        let mut summary = PhaseSummary::default();
        let mut records = Vec::new();

        let conflicts = catalog.conflicts();
        for (id, message) in &conflicts {
            self.audit.conflict(KIND, id, message);
            records.push(self.conflict_record(KIND, id, message));
            summary.failed += 1;
        }

        let live = self.live_cache(KIND).await;

        for decl in &catalog.declarations {
            let mut seen = BTreeSet::new();
            let ids: Vec<&str> = decl
                .ids
                .iter()
                .map(String::as_str)
                .filter(|id| !conflicts.contains_key(*id) && seen.insert(*id))
                .collect();
            if ids.is_empty() {
                continue;
            }
            let joined = ids.join(", ");

            let (status, diff, error) = match self.oracle.needs_apply(KIND, decl, &live).await {
                DiffOutcome::Invalid { reason } => {
                    self.audit.invalid(KIND, &joined, &reason);
                    (ResourceStatus::Failed, None, Some(reason))
                }
                DiffOutcome::Noop => {
                    self.audit.up_to_date(KIND, &joined);
                    (ResourceStatus::Success, None, None)
                }
                DiffOutcome::WouldCreate { diff } | DiffOutcome::WouldUpdate { diff } => {
                    match self.client.apply(&decl.path).await {
                        Ok(()) => {
                            self.audit.applied(KIND, &joined);
                            (ResourceStatus::Success, Some(diff), None)
                        }
                        Err(e) => {
                            let err = e.to_string();
                            self.audit.apply_failed(KIND, &joined, &err);
                            (ResourceStatus::Failed, Some(diff), Some(err))
                        }
                    }
                }
            };

            let provision_type = decl.provision_type();
            for id in ids {
                let live_content = self.live_content(KIND, id, &live).await;
                let mut record = ResourceRecord::machine_class(id, status)
                    .with_file_content(decl.content.clone())
                    .with_live_content(live_content);
                record.provision_type = Some(provision_type);
                if let Some(diff) = &diff {
                    record = record.with_diff(diff.clone());
                }
                record.error = error.clone();
                records.push(record);

                match status {
                    ResourceStatus::Success => summary.ok += 1,
                    _ => summary.failed += 1,
                }
            }
        }

        self.store.replace_machine_classes(records);
        self.audit
            .phase_result(KIND, "Machine class apply", summary.ok, summary.failed);
        summary
    }

    /// Delete live machine classes that are no longer declared.
    ///
    /// A class still referenced by a cluster is rejected by the control plane;
    /// that is expected while the referencing cluster winds down and is recorded
    /// out of sync instead of failed.
    pub async fn delete_machine_classes(&self, dir: &Path) -> PhaseSummary {
        let catalog = Catalog::machine_classes(dir).await;
        if catalog.missing {
            self.audit.nothing_declared(KIND, &dir.display().to_string());
        }
        let desired = catalog.declared_ids();

        let live_ids = match self.client.list_ids(KIND).await {
            Ok(ids) => ids,
            Err(e) => {
                self.audit
                    .error(KIND.component(), format!("Failed to list machine classes: {}", e));
                return PhaseSummary::skipped();
            }
        };

        self.audit
            .info(KIND.component(), "Checking for machine classes to delete");

        let mut summary = PhaseSummary::default();
        for id in live_ids.iter().filter(|id| !desired.contains(*id)) {
            self.audit.warn(
                KIND.component(),
                format!("Machine class {} not in source, deleting", id),
            );
            match self.client.delete(KIND, id).await {
                Ok(_) => {
                    self.audit.deleted(KIND, id);
                    self.store.remove(KIND, id);
                    summary.ok += 1;
                }
                Err(e) if e.is_in_use() => {
                    self.audit.warn(
                        KIND.component(),
                        format!("Machine class {} still in use, skipping delete", id),
                    );
                    let output = e.output().unwrap_or_default();
                    let record = ResourceRecord::machine_class(id.as_str(), ResourceStatus::OutOfSync)
                        .with_error(format!(
                            "Removed from source but still in use, delete skipped: {}",
                            output
                        ));
                    self.store.upsert_machine_class(record);
                }
                Err(e) => {
                    let err = e.to_string();
                    self.audit.delete_failed(KIND, id, &err);
                    self.store.upsert_machine_class(
                        ResourceRecord::machine_class(id.as_str(), ResourceStatus::Failed)
                            .with_error(err),
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.ok == 0 && summary.failed == 0 {
            self.audit
                .info(KIND.component(), "No machine classes to delete");
        } else {
            self.audit
                .phase_result(KIND, "Machine class delete", summary.ok, summary.failed);
        }
        summary
    }
}
