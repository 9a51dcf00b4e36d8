mod common;

use common::{Harness, cluster_template, machine_class, provider_machine_class};
use fleetcd::controller::ControllerConfig;
use fleetcd::reconciler::REMOVED_FROM_SOURCE_HINT;
use fleetcd::resource::{ProvisionType, ResourceKind, ResourceStatus, RunType};
use fleetcd::store::StoreConfig;

fn status(h: &Harness, kind: ResourceKind, id: &str) -> Option<ResourceStatus> {
    h.store.record(kind, id).map(|r| r.status)
}

fn sync_disabled() -> Harness {
    Harness::with_config(
        StoreConfig {
            clusters_enabled: false,
            ..Default::default()
        },
        ControllerConfig::default(),
    )
}

#[tokio::test]
async fn applies_machine_classes_before_clusters_and_deletes_in_reverse() {
    let h = Harness::new();
    h.source
        .write("machine-classes/cp.yaml", &machine_class("mc-cp", "role=cp"));
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));
    assert_eq!(h.plane.mutations(), vec!["apply cp.yaml", "sync alpha"]);
    assert_eq!(status(&h, ResourceKind::MachineClass, "mc-cp"), Some(ResourceStatus::Success));
    assert_eq!(status(&h, ResourceKind::Cluster, "alpha"), Some(ResourceStatus::Success));

    h.plane.clear_calls();
    h.source.remove("clusters/alpha");
    h.source.remove("machine-classes/cp.yaml");

    assert_eq!(h.controller.run_cycle(RunType::Soft).await, Ok(true));
    assert_eq!(
        h.plane.mutations(),
        vec!["delete cluster alpha", "delete machineclass mc-cp"]
    );
    assert!(h.plane.cluster_ids().is_empty());
    assert!(h.plane.machine_class_ids().is_empty());
    assert!(h.store.clusters().is_empty());
    assert!(h.store.machine_classes().is_empty());
}

#[tokio::test]
async fn second_pass_over_unchanged_source_issues_no_mutations() {
    let h = Harness::new();
    h.source
        .write("machine-classes/workers.yaml", &machine_class("mc-worker", "role=worker"));
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));

    h.controller.run_cycle(RunType::Hard).await.unwrap();
    h.plane.clear_calls();

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));
    assert!(h.plane.mutations().is_empty(), "{:?}", h.plane.mutations());
    assert_eq!(status(&h, ResourceKind::MachineClass, "mc-worker"), Some(ResourceStatus::Success));
    assert_eq!(status(&h, ResourceKind::Cluster, "alpha"), Some(ResourceStatus::Success));
}

#[tokio::test]
async fn conflicting_declarations_are_never_applied() {
    let h = Harness::new();
    h.source.write("machine-classes/a.yaml", &machine_class("dup", "zone=a"));
    h.source.write("machine-classes/b.yaml", &machine_class("dup", "zone=b"));
    h.source.write("machine-classes/c.yaml", &machine_class("solo", "zone=c"));

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert_eq!(h.plane.mutations(), vec!["apply c.yaml"]);
    let dup = h.store.record(ResourceKind::MachineClass, "dup").unwrap();
    assert_eq!(dup.status, ResourceStatus::OutOfSync);
    assert_eq!(
        dup.error.as_deref(),
        Some("Conflicting machine class templates: /machine-classes/a.yaml, /machine-classes/b.yaml")
    );
    assert_eq!(status(&h, ResourceKind::MachineClass, "solo"), Some(ResourceStatus::Success));
}

#[tokio::test]
async fn conflicting_cluster_bundles_keep_their_last_record() {
    let h = Harness::new();
    h.source
        .write("clusters/one/cluster.yaml", &cluster_template("shared", "v1.30.0"));
    h.controller.run_cycle(RunType::Hard).await.unwrap();
    assert_eq!(status(&h, ResourceKind::Cluster, "shared"), Some(ResourceStatus::Success));

    h.plane.clear_calls();
    h.source
        .write("clusters/two/cluster.yaml", &cluster_template("shared", "v1.31.0"));
    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert!(h.plane.mutations().is_empty());
    let shared = h.store.record(ResourceKind::Cluster, "shared").unwrap();
    assert_eq!(shared.status, ResourceStatus::OutOfSync);
    assert!(shared.error.unwrap().contains("/clusters/one/cluster.yaml, /clusters/two/cluster.yaml"));
    assert!(shared.detail.is_some(), "previous live detail is preserved");
}

#[tokio::test]
async fn unmanaged_clusters_are_tracked_but_never_deleted() {
    let h = Harness::new();
    h.plane
        .add_cluster("handmade", &cluster_template("handmade", "v1.29.0"), false);
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));

    for _ in 0..2 {
        h.controller.run_cycle(RunType::Hard).await.unwrap();
        assert_eq!(status(&h, ResourceKind::Cluster, "handmade"), Some(ResourceStatus::Unmanaged));
    }
    assert!(!h.plane.mutations().iter().any(|c| c.contains("handmade")));
    assert!(h.plane.cluster_ids().contains(&"handmade".to_string()));
}

#[tokio::test]
async fn declared_set_against_live_set_with_cluster_sync_disabled() {
    let h = sync_disabled();
    let b = machine_class("b", "role=b");
    h.plane.add_machine_class("b", b.trim());
    h.plane.add_machine_class("c", &machine_class("c", "role=c"));
    h.plane
        .add_cluster("old", &cluster_template("old", "v1.29.0"), true);
    h.source.write("machine-classes/a.yaml", &machine_class("a", "role=a"));
    h.source.write("machine-classes/b.yaml", &b);
    h.source.write("clusters/.keep", "");

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));

    assert_eq!(h.plane.mutations(), vec!["apply a.yaml", "delete machineclass c"]);
    assert_eq!(status(&h, ResourceKind::MachineClass, "a"), Some(ResourceStatus::Success));
    assert_eq!(status(&h, ResourceKind::MachineClass, "b"), Some(ResourceStatus::Success));
    assert_eq!(status(&h, ResourceKind::MachineClass, "c"), None);

    let old = h.store.record(ResourceKind::Cluster, "old").unwrap();
    assert_eq!(old.status, ResourceStatus::OutOfSync);
    assert_eq!(old.diff.as_deref(), Some(REMOVED_FROM_SOURCE_HINT));
}

#[tokio::test]
async fn bookkeeping_only_dry_run_output_is_a_noop() {
    let h = Harness::new();
    let declared = machine_class("mc-1", "role=worker");
    // Live copy carries server-side bookkeeping and different spec indentation.
    let live = "metadata:\n  namespace: default\n  type: MachineClasses.omni.sidero.dev\n  id: mc-1\n  version: 7\n  updated: 2024-05-01T10:00:00Z\nspec:\n    matchlabels:\n\n        - role=worker\n";
    h.plane.add_machine_class("mc-1", live);
    h.source.write("machine-classes/mc.yaml", &declared);

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert!(h.plane.mutations().is_empty(), "{:?}", h.plane.mutations());
    let record = h.store.record(ResourceKind::MachineClass, "mc-1").unwrap();
    assert_eq!(record.status, ResourceStatus::Success);
    assert_eq!(record.diff, None);
    assert_eq!(record.live_content.as_deref(), Some(live));
}

#[tokio::test]
async fn spec_drift_triggers_apply() {
    let h = Harness::new();
    h.plane
        .add_machine_class("mc-1", &machine_class("mc-1", "role=old"));
    h.source
        .write("machine-classes/mc.yaml", &machine_class("mc-1", "role=new"));

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert_eq!(h.plane.mutations(), vec!["apply mc.yaml"]);
    let record = h.store.record(ResourceKind::MachineClass, "mc-1").unwrap();
    assert!(record.diff.unwrap().contains("Updating resource"));
}

#[tokio::test]
async fn per_resource_failures_do_not_stop_siblings() {
    let h = Harness::new();
    h.plane.fail_apply("broken.yaml");
    h.plane.mark_invalid("invalid.yaml");
    h.plane.fail_apply("beta");
    h.source.write("machine-classes/broken.yaml", &machine_class("broken", "x=1"));
    h.source.write("machine-classes/invalid.yaml", &machine_class("invalid", "x=2"));
    h.source.write("machine-classes/good.yaml", &machine_class("good", "x=3"));
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));
    h.source
        .write("clusters/beta/cluster.yaml", &cluster_template("beta", "v1.30.0"));

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));

    let broken = h.store.record(ResourceKind::MachineClass, "broken").unwrap();
    assert_eq!(broken.status, ResourceStatus::Failed);
    assert!(broken.error.unwrap().contains("admission webhook denied"));
    assert!(broken.diff.unwrap().contains("id: broken"));

    let invalid = h.store.record(ResourceKind::MachineClass, "invalid").unwrap();
    assert_eq!(invalid.status, ResourceStatus::Failed);
    assert!(!h.plane.mutations().contains(&"apply invalid.yaml".to_string()));

    assert_eq!(status(&h, ResourceKind::MachineClass, "good"), Some(ResourceStatus::Success));
    assert_eq!(status(&h, ResourceKind::Cluster, "alpha"), Some(ResourceStatus::Success));

    let beta = h.store.record(ResourceKind::Cluster, "beta").unwrap();
    assert_eq!(beta.status, ResourceStatus::Failed);
    assert!(beta.diff.unwrap().contains("+++ beta"));
    assert!(beta.error.unwrap().contains("machine class not found"));
}

#[tokio::test]
async fn invalid_cluster_template_is_not_synced() {
    let h = Harness::new();
    h.plane.mark_invalid("alpha");
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert!(h.plane.mutations().is_empty());
    let alpha = h.store.record(ResourceKind::Cluster, "alpha").unwrap();
    assert_eq!(alpha.status, ResourceStatus::Failed);
    assert!(alpha.error.unwrap().contains("unknown machine class"));
}

#[tokio::test]
async fn machine_class_in_use_is_skipped_not_failed() {
    let h = Harness::new();
    h.plane.add_machine_class("legacy", &machine_class("legacy", "x=1"));
    h.plane.mark_in_use("legacy");
    h.source.write("machine-classes/keep.yaml", &machine_class("keep", "x=2"));

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));

    let legacy = h.store.record(ResourceKind::MachineClass, "legacy").unwrap();
    assert_eq!(legacy.status, ResourceStatus::OutOfSync);
    let error = legacy.error.unwrap();
    assert!(error.starts_with("Removed from source but still in use, delete skipped:"));
    assert!(error.contains("still in use by cluster"));
    assert!(h.plane.machine_class_ids().contains(&"legacy".to_string()));
}

#[tokio::test]
async fn failed_cluster_delete_is_recorded_and_siblings_proceed() {
    let h = Harness::new();
    h.plane.add_cluster("stuck", &cluster_template("stuck", "v1.29.0"), true);
    h.plane.add_cluster("gone", &cluster_template("gone", "v1.29.0"), true);
    h.plane.fail_delete("stuck");
    h.source.write("clusters/.keep", "");

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert!(!h.plane.cluster_ids().contains(&"gone".to_string()));
    let stuck = h.store.record(ResourceKind::Cluster, "stuck").unwrap();
    assert_eq!(stuck.status, ResourceStatus::Failed);
    assert!(stuck.error.unwrap().contains("timeout waiting for teardown"));
    assert_eq!(stuck.diff.as_deref(), Some(REMOVED_FROM_SOURCE_HINT));
    assert_eq!(status(&h, ResourceKind::Cluster, "gone"), None);
}

#[tokio::test]
async fn missing_directories_declare_nothing() {
    let h = Harness::new();
    h.plane.add_machine_class("mc-1", &machine_class("mc-1", "x=1"));
    h.plane.add_cluster("alpha", &cluster_template("alpha", "v1.30.0"), true);
    h.plane.add_cluster("manual", &cluster_template("manual", "v1.30.0"), false);
    h.source.write("README.md", "nothing declared here\n");

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));

    assert_eq!(
        h.plane.mutations(),
        vec!["delete cluster alpha", "delete machineclass mc-1"]
    );
    assert!(h.plane.machine_class_ids().is_empty());
    assert_eq!(h.plane.cluster_ids(), vec!["manual"]);
    assert_eq!(
        status(&h, ResourceKind::Cluster, "manual"),
        Some(ResourceStatus::Unmanaged)
    );
}

#[tokio::test]
async fn crashed_cluster_task_is_marked_failed() {
    let h = Harness::new();
    h.plane.crash_on_sync("alpha");
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));
    h.source
        .write("clusters/beta/cluster.yaml", &cluster_template("beta", "v1.30.0"));

    assert_eq!(h.controller.run_cycle(RunType::Hard).await, Ok(true));

    let alpha = h.store.record(ResourceKind::Cluster, "alpha").unwrap();
    assert_eq!(alpha.status, ResourceStatus::Failed);
    assert!(alpha.error.unwrap().starts_with("Reconcile task aborted"));
    assert_eq!(
        status(&h, ResourceKind::Cluster, "beta"),
        Some(ResourceStatus::Success)
    );
}

#[tokio::test]
async fn records_carry_provision_type_and_live_detail() {
    let h = Harness::new();
    h.source
        .write("machine-classes/auto.yaml", &provider_machine_class("auto"));
    h.source
        .write("machine-classes/manual.yaml", &machine_class("manual", "x=1"));
    h.source
        .write("clusters/alpha/cluster.yaml", &cluster_template("alpha", "v1.30.0"));

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    let auto = h.store.record(ResourceKind::MachineClass, "auto").unwrap();
    assert_eq!(auto.provision_type, Some(ProvisionType::Auto));
    let manual = h.store.record(ResourceKind::MachineClass, "manual").unwrap();
    assert_eq!(manual.provision_type, Some(ProvisionType::Manual));

    let alpha = h.store.record(ResourceKind::Cluster, "alpha").unwrap();
    let detail = alpha.detail.unwrap();
    assert_eq!(detail.kubernetes_version, "v1.30.0");
    assert_eq!(detail.talos_version, "v1.7.0");
    assert_eq!(detail.control_plane.unwrap().count, 3);
    assert_eq!(detail.workers.len(), 1);
    assert_eq!(detail.workers[0].machine_class.as_deref(), Some("mc-worker"));
}

#[tokio::test]
async fn multi_document_file_declares_several_ids() {
    let h = Harness::new();
    let content = format!("{}---\n{}", machine_class("m1", "x=1"), machine_class("m2", "x=2"));
    h.source.write("machine-classes/pair.yml", &content);

    h.controller.run_cycle(RunType::Hard).await.unwrap();

    assert_eq!(h.plane.mutations(), vec!["apply pair.yml"]);
    assert_eq!(h.plane.machine_class_ids(), vec!["m1", "m2"]);
    assert_eq!(status(&h, ResourceKind::MachineClass, "m1"), Some(ResourceStatus::Success));
    assert_eq!(status(&h, ResourceKind::MachineClass, "m2"), Some(ResourceStatus::Success));
}
