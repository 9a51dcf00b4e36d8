//! Reconciliation engine.
//!
//! Compares declarations in the source checkout with live control-plane state
//! and converges them. Phases run in dependency order: machine classes are
//! applied before the clusters that reference them and deleted after them.
//! Per-resource failures are recorded in the store and never abort a phase.

mod cluster;
mod machine_class;

use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::clients::ControlPlane;
use crate::oracle::DiffOracle;
use crate::resource::{ResourceKind, ResourceRecord, ResourceStatus};
use crate::store::StateStore;

pub use cluster::REMOVED_FROM_SOURCE_HINT;

/// Outcome counts of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSummary {
    pub ok: usize,
    pub failed: usize,
    /// The phase did not run, e.g. because its directory is missing.
    pub skipped: bool,
}

impl PhaseSummary {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn ControlPlane>,
    store: Arc<StateStore>,
    audit: AuditLog,
    oracle: DiffOracle,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ControlPlane>, store: Arc<StateStore>, audit: AuditLog) -> Self {
        Self {
            oracle: DiffOracle::new(Arc::clone(&client)),
            client,
            store,
            audit,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Batch-fetch live content once per phase. A failed batch is an empty cache.
    async fn live_cache(&self, kind: ResourceKind) -> HashMap<String, String> {
        match self.client.get_all_live(kind).await {
            Ok(live) => live,
            Err(e) => {
                self.audit.warn(
                    kind.component(),
                    format!("Failed to fetch live state, falling back to per-resource lookups: {}", e),
                );
                HashMap::new()
            }
        }
    }

    /// Live content from the cache, else an individual fetch. Empty if unavailable.
    async fn live_content(
        &self,
        kind: ResourceKind,
        id: &str,
        cache: &HashMap<String, String>,
    ) -> String {
        if let Some(content) = cache.get(id).filter(|c| !c.is_empty()) {
            return content.clone();
        }
        self.client.get_live(kind, id).await.unwrap_or_default()
    }

    /// Controller ownership. A failed lookup counts as not owned, so the
    /// resource is left alone.
    async fn is_owned(&self, kind: ResourceKind, id: &str) -> bool {
        self.client
            .is_controller_owned(kind, id)
            .await
            .unwrap_or(false)
    }

    /// Previous record for `id` marked out of sync with the conflict error.
    fn conflict_record(&self, kind: ResourceKind, id: &str, message: &str) -> ResourceRecord {
        let mut record = self
            .store
            .record(kind, id)
            .unwrap_or_else(|| ResourceRecord::new(kind, id, ResourceStatus::OutOfSync));
        record.status = ResourceStatus::OutOfSync;
        record.error = Some(message.to_string());
        record
    }
}

/// Replace processed entries, keep the rest, sort by id.
fn merge_records(existing: Vec<ResourceRecord>, processed: Vec<ResourceRecord>) -> Vec<ResourceRecord> {
    let mut merged: HashMap<String, ResourceRecord> =
        existing.into_iter().map(|r| (r.id.clone(), r)).collect();
    for record in processed {
        merged.insert(record.id.clone(), record);
    }
    let mut records: Vec<_> = merged.into_values().collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}
