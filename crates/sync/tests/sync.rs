#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use kfed_core::{ApiKind, FedError, QualifiedName, TypeConfig, MANAGED_LABEL, SYNC_FINALIZER};
use kfed_kubehub::fake::{FakeClientFactory, FakeResourceClient, Op};
use kfed_kubehub::{ClientFactory, ClusterRegistry, ClusterSnapshot, ResourceClient};
use kfed_persist::{ApiVersionStore, VersionBackend, VersionManager};
use kfed_store::{Backoff, Reconciler, Requeue, RetryPolicy};
use kfed_sync::{start_sync_controller, ClusterState, PropagationStatus, SyncConfig, SyncContext, SyncController};

const NS: &str = "apps";

fn deployment_kind() -> ApiKind { ApiKind::new("apps", "v1", "Deployment") }

fn template_kind() -> ApiKind { ApiKind::new("types.kfed.io", "v1beta1", "FederatedDeployment") }

fn type_config(status_enabled: bool) -> TypeConfig {
    serde_json::from_value(json!({
        "name": "deployments.apps",
        "target": { "group": "apps", "version": "v1", "kind": "Deployment" },
        "template": { "group": "types.kfed.io", "version": "v1beta1", "kind": "FederatedDeployment" },
        "placement": { "kind": "FederatedDeployment" },
        "override": { "kind": "FederatedDeployment" },
        "statusEnabled": status_enabled,
    }))
    .unwrap()
}

fn federated(name: &str, placement: Value) -> Value {
    json!({
        "metadata": { "name": name, "namespace": NS },
        "spec": {
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "replicas": 3 }
            },
            "placement": placement,
            "overrides": [
                { "clusterName": "c2", "clusterOverrides": [{ "path": "/spec/replicas", "value": 5 }] }
            ]
        }
    })
}

fn config() -> SyncConfig { SyncConfig { cluster_op_timeout: Duration::from_secs(5), ..SyncConfig::default() } }

struct Harness {
    host: Arc<FakeClientFactory>,
    members: BTreeMap<String, Arc<FakeClientFactory>>,
    registry: Arc<ClusterRegistry>,
    controller: SyncController,
}

impl Harness {
    fn new(clusters: &[(&str, bool)], status_enabled: bool) -> Self {
        let host = Arc::new(FakeClientFactory::new());
        let registry = Arc::new(ClusterRegistry::new());
        let mut members = BTreeMap::new();
        for (name, ready) in clusters {
            let member = Arc::new(FakeClientFactory::new());
            registry.upsert(ClusterSnapshot::new(name, *ready, member.clone() as Arc<dyn ClientFactory>));
            members.insert(name.to_string(), member);
        }
        let store = Arc::new(ApiVersionStore::new(host.client(&ApiVersionStore::kind_for(true))));
        let versions = Arc::new(VersionManager::new(store, "Deployment", Some(NS), RetryPolicy::default(), Backoff::default()));
        let tc = type_config(status_enabled);
        let template: Arc<dyn ResourceClient> = host.client(&template_kind());
        let controller = SyncController::new(tc, template, None, None, Arc::clone(&registry), versions, config());
        Self { host, members, registry, controller }
    }

    fn template(&self) -> Arc<FakeResourceClient> { self.host.client(&template_kind()) }

    fn member(&self, cluster: &str) -> Arc<FakeResourceClient> { self.members[cluster].client(&deployment_kind()) }

    fn deployed(&self, cluster: &str, name: &str) -> Option<Value> { self.member(cluster).object(Some(NS), name) }

    fn recorded(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.controller.versions().recorded(&QualifiedName::new(Some(NS), name)).map(|r| r.cluster_versions)
    }

    async fn reconcile(&self, name: &str) -> Requeue { self.controller.reconcile(&format!("{}/{}", NS, name)).await }

    async fn edit(&self, name: &str, f: impl FnOnce(&mut Value)) {
        let client = self.template();
        let mut obj = client.object(Some(NS), name).unwrap();
        f(&mut obj);
        client.update(&obj).await.unwrap();
    }

    fn member_writes(&self) -> usize { self.members.values().map(|m| m.write_calls()).sum() }
}

fn versions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> { pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }

#[tokio::test]
async fn creates_in_placed_clusters_with_overrides() {
    let h = Harness::new(&[("c1", true), ("c2", true), ("c3", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));

    assert_eq!(h.reconcile("web").await, Requeue::Done);

    let c1 = h.deployed("c1", "web").unwrap();
    assert_eq!(c1["kind"], "Deployment");
    assert_eq!(c1["spec"]["replicas"], 3);
    assert_eq!(c1["metadata"]["labels"][MANAGED_LABEL], "true");
    assert_eq!(h.deployed("c2", "web").unwrap()["spec"]["replicas"], 5);
    assert!(h.deployed("c3", "web").is_none());
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:1"), ("c2", "gen:1")]));
    assert!(kfed_core::has_finalizer(&h.template().object(Some(NS), "web").unwrap(), SYNC_FINALIZER));
}

#[tokio::test]
async fn converged_objects_cost_no_writes() {
    let h = Harness::new(&[("c1", true), ("c2", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));
    assert_eq!(h.reconcile("web").await, Requeue::Done);

    for m in h.members.values() {
        m.client(&deployment_kind()).clear_calls();
    }
    h.template().clear_calls();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.member_writes(), 0);
    assert_eq!(h.member("c1").count(Op::Get), 0);
    assert_eq!(h.template().write_calls(), 0);
}

#[tokio::test]
async fn template_changes_reach_members() {
    let h = Harness::new(&[("c1", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));
    h.reconcile("web").await;

    h.edit("web", |o| o["spec"]["template"]["spec"]["replicas"] = json!(7)).await;
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.deployed("c1", "web").unwrap()["spec"]["replicas"], 7);
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:2")]));
}

#[tokio::test]
async fn clusters_leaving_placement_are_cleaned_up() {
    let h = Harness::new(&[("c1", true), ("c2", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));
    h.reconcile("web").await;

    h.edit("web", |o| o["spec"]["placement"] = json!({ "clusterNames": ["c1"] })).await;
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c1", "web").is_some());
    assert!(h.deployed("c2", "web").is_none());
    assert_eq!(h.recorded("web").unwrap().keys().collect::<Vec<_>>(), vec!["c1"]);
}

#[tokio::test]
async fn unready_cluster_keeps_its_pending_removal() {
    let h = Harness::new(&[("c1", true), ("c2", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));
    h.reconcile("web").await;

    h.registry.set_ready("c2", false);
    h.edit("web", |o| o["spec"]["placement"] = json!({ "clusterNames": ["c1"] })).await;
    h.member("c2").clear_calls();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.member("c2").calls().len(), 0);
    assert!(h.deployed("c2", "web").is_some());
    assert_eq!(h.recorded("web").unwrap().get("c2").map(String::as_str), Some(""));

    h.registry.set_ready("c2", true);
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c2", "web").is_none());
    assert!(!h.recorded("web").unwrap().contains_key("c2"));
}

#[tokio::test]
async fn selected_unready_cluster_is_skipped() {
    let h = Harness::new(&[("c1", true), ("c2", false)], true);
    h.template().insert(federated("web", json!({ "clusterSelector": {} })));

    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c1", "web").is_some());
    assert!(h.deployed("c2", "web").is_none());
    let status = PropagationStatus::from_object(&h.template().object(Some(NS), "web").unwrap()).unwrap();
    assert_eq!(status.cluster("c2").unwrap().state, ClusterState::Pending);
    assert_eq!(status.conditions[0].status, "True");

    h.registry.set_ready("c2", true);
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.deployed("c2", "web").unwrap()["spec"]["replicas"], 5);
}

#[tokio::test]
async fn unready_cluster_stays_tracked_across_template_changes() {
    let h = Harness::new(&[("c1", true), ("c2", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));
    h.reconcile("web").await;
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:1"), ("c2", "gen:1")]));

    h.registry.set_ready("c2", false);
    h.edit("web", |o| o["spec"]["template"]["spec"]["replicas"] = json!(4)).await;
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:2"), ("c2", "")]));

    // deleted before c2 was brought up to date: its copy must still go
    h.template().delete(Some(NS), "web").await.unwrap();
    h.registry.set_ready("c2", true);
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c1", "web").is_none());
    assert!(h.deployed("c2", "web").is_none());
    assert!(h.recorded("web").is_none());
    assert!(h.template().object(Some(NS), "web").is_none());
}

#[tokio::test]
async fn failed_cluster_is_retried_after_template_change() {
    let h = Harness::new(&[("c1", true), ("c2", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));
    h.reconcile("web").await;

    h.member("c2").fail(Op::Update, None, FedError::Transient("apiserver unavailable".into()));
    h.edit("web", |o| o["spec"]["template"]["spec"]["paused"] = json!(true)).await;
    assert_eq!(h.reconcile("web").await, Requeue::Backoff);
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:2"), ("c2", "")]));

    h.member("c2").clear_failures();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:2"), ("c2", "gen:2")]));
    let c2 = h.deployed("c2", "web").unwrap();
    assert_eq!(c2["spec"]["paused"], true);
    assert_eq!(c2["spec"]["replicas"], 5);
}

#[tokio::test]
async fn update_conflict_is_refetched_and_retried_once() {
    let h = Harness::new(&[("c1", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));
    h.reconcile("web").await;

    h.member("c1").clear_calls();
    h.member("c1").fail_times(Op::Update, None, FedError::Conflict("stale".into()), 1);
    h.edit("web", |o| o["spec"]["template"]["spec"]["replicas"] = json!(6)).await;
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.member("c1").count(Op::Get), 2);
    assert_eq!(h.member("c1").count(Op::Update), 2);
    assert_eq!(h.deployed("c1", "web").unwrap()["spec"]["replicas"], 6);
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:2")]));

    h.member("c1").fail(Op::Update, None, FedError::Conflict("stale".into()));
    h.edit("web", |o| o["spec"]["template"]["spec"]["replicas"] = json!(7)).await;
    h.member("c1").clear_calls();
    assert_eq!(h.reconcile("web").await, Requeue::Backoff);
    assert_eq!(h.member("c1").count(Op::Update), 2);
}

#[tokio::test]
async fn member_deleted_during_update_is_recreated() {
    let h = Harness::new(&[("c1", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));
    h.reconcile("web").await;
    let before = h.deployed("c1", "web").unwrap();

    h.member("c1").vanish_on(Op::Update, "web");
    h.edit("web", |o| o["spec"]["template"]["spec"]["replicas"] = json!(6)).await;
    h.member("c1").clear_calls();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert_eq!(h.member("c1").count(Op::Create), 1);
    let after = h.deployed("c1", "web").unwrap();
    assert_eq!(after["spec"]["replicas"], 6);
    assert_ne!(after["metadata"]["uid"], before["metadata"]["uid"]);
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c1", "gen:1")]));
}

#[tokio::test]
async fn deletion_waits_for_every_cluster() {
    let h = Harness::new(&[("c1", true), ("c2", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1", "c2"] })));
    h.reconcile("web").await;

    h.member("c2").fail(Op::Delete, None, FedError::Transient("apiserver unavailable".into()));
    h.template().delete(Some(NS), "web").await.unwrap();
    assert_eq!(h.reconcile("web").await, Requeue::Backoff);
    assert!(h.deployed("c1", "web").is_none());
    assert!(h.deployed("c2", "web").is_some());
    assert!(h.template().object(Some(NS), "web").is_some());
    assert_eq!(h.recorded("web").unwrap(), versions(&[("c2", "")]));

    h.member("c2").clear_failures();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c2", "web").is_none());
    assert!(h.recorded("web").is_none());
    assert!(h.template().object(Some(NS), "web").is_none());
}

#[tokio::test]
async fn orphaned_objects_stay_in_members() {
    let h = Harness::new(&[("c1", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));
    h.reconcile("web").await;

    h.edit("web", |o| o["metadata"]["annotations"] = json!({ "kfed.io/orphan": "true" })).await;
    h.template().delete(Some(NS), "web").await.unwrap();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c1", "web").is_some());
    assert!(h.recorded("web").is_none());
    assert!(h.template().object(Some(NS), "web").is_none());
}

#[tokio::test]
async fn vanished_template_removes_member_copies() {
    let h = Harness::new(&[("c1", true)], false);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));
    h.reconcile("web").await;

    h.edit("web", |o| o["metadata"]["finalizers"] = json!([])).await;
    h.template().delete(Some(NS), "web").await.unwrap();
    assert_eq!(h.reconcile("web").await, Requeue::Done);
    assert!(h.deployed("c1", "web").is_none());
    assert!(h.recorded("web").is_none());
}

#[tokio::test]
async fn unmanaged_objects_are_left_alone() {
    let h = Harness::new(&[("c1", true)], true);
    h.member("c1").insert(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": NS },
        "spec": { "replicas": 1 }
    }));
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));

    assert_eq!(h.reconcile("web").await, Requeue::Backoff);
    let live = h.deployed("c1", "web").unwrap();
    assert_eq!(live["spec"]["replicas"], 1);
    assert!(!kfed_core::is_managed(&live));
    assert_eq!(h.member("c1").count(Op::Update), 0);

    let status = PropagationStatus::from_object(&h.template().object(Some(NS), "web").unwrap()).unwrap();
    let c1 = status.cluster("c1").unwrap();
    assert_eq!(c1.state, ClusterState::Error);
    assert_eq!(c1.reason.as_deref(), Some("AlreadyExists"));
    assert_eq!(status.conditions[0].reason, "CheckClusters");
}

#[tokio::test]
async fn status_is_written_only_on_change() {
    let h = Harness::new(&[("c1", true)], true);
    h.template().insert(federated("web", json!({ "clusterNames": ["c1"] })));
    h.reconcile("web").await;
    assert_eq!(h.template().count(Op::UpdateStatus), 1);

    h.reconcile("web").await;
    assert_eq!(h.template().count(Op::UpdateStatus), 1);
}

#[tokio::test]
async fn invalid_overrides_are_reported_and_delayed() {
    let h = Harness::new(&[("c1", true)], true);
    let mut obj = federated("web", json!({ "clusterNames": ["c1"] }));
    obj["spec"]["overrides"] = json!([{ "clusterName": "c1", "clusterOverrides": [{ "path": "/metadata/name", "value": "x" }] }]);
    h.template().insert(obj);

    assert_eq!(h.reconcile("web").await, Requeue::After(config().config_error_delay));
    assert!(h.deployed("c1", "web").is_none());

    let mut bad = federated("broken", json!({ "clusterNames": ["c1"] }));
    bad["spec"]["overrides"] = json!("not a list");
    h.template().insert(bad);
    assert_eq!(h.reconcile("broken").await, Requeue::After(config().config_error_delay));
    let status = PropagationStatus::from_object(&h.template().object(Some(NS), "broken").unwrap()).unwrap();
    assert_eq!(status.conditions[0].reason, "ConfigError");
}

async fn eventually<F: Fn() -> bool>(f: F) {
    for _ in 0..400 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn running_controller_follows_templates_and_clusters() {
    let host = Arc::new(FakeClientFactory::new());
    let registry = Arc::new(ClusterRegistry::new());
    let c1 = Arc::new(FakeClientFactory::new());
    registry.upsert(ClusterSnapshot::new("c1", true, c1.clone() as Arc<dyn ClientFactory>));
    let ctx = SyncContext {
        host: host.clone() as Arc<dyn ClientFactory>,
        clusters: Arc::clone(&registry),
        versions: VersionBackend::Api(host.clone() as Arc<dyn ClientFactory>),
        config: SyncConfig { workers: 2, ..config() },
    };
    let stop = CancellationToken::new();
    let handle = start_sync_controller(&ctx, &type_config(false), stop.clone()).await.unwrap();

    host.client(&template_kind()).insert(federated("web", json!({ "clusterSelector": {} })));
    let d1 = c1.client(&deployment_kind());
    eventually(|| d1.object(Some(NS), "web").is_some()).await;

    let c2 = Arc::new(FakeClientFactory::new());
    registry.upsert(ClusterSnapshot::new("c2", true, c2.clone() as Arc<dyn ClientFactory>));
    let d2 = c2.client(&deployment_kind());
    eventually(|| d2.object(Some(NS), "web").map(|o| o["spec"]["replicas"] == 5).unwrap_or(false)).await;

    let records = host.client(&ApiVersionStore::kind_for(true));
    eventually(|| records.object(Some(NS), "deployment-web").is_some()).await;

    handle.stop().await;
    assert!(!stop.is_cancelled());
}
