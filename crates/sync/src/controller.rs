//! The per-key propagation state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info, warn};

use kfed_apply::{desired_object, diff_summary, object_needs_update, object_version, resolve_placement, retain_cluster_fields, strip_noisy};
use kfed_core::{
    ApiKind, FedError, FedResult, FederatedResource, PropagatedVersion, QualifiedName, TypeConfig, ORPHAN_ANNOTATION, SYNC_FINALIZER,
};
use kfed_kubehub::{ClusterRegistry, ClusterSnapshot, ResourceClient};
use kfed_persist::VersionManager;
use kfed_schema::parse_federated;
use kfed_store::{retry_on_conflict, Reconciler, Requeue, RetryPolicy};

use crate::status::{ClusterStatus, PropagationStatus};
use crate::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Pass {
    Done,
    ConfigError,
    Retry,
}

/// A member object that matches the desired state.
struct Synced {
    version: String,
    op: &'static str,
}

/// Cluster still holding a copy that has to go; `None` while it is unready.
type PendingRemovals = BTreeMap<String, Option<FedError>>;

pub struct SyncController {
    tc: TypeConfig,
    target: ApiKind,
    template: Arc<dyn ResourceClient>,
    placement: Option<Arc<dyn ResourceClient>>,
    overrides: Option<Arc<dyn ResourceClient>>,
    clusters: Arc<ClusterRegistry>,
    versions: Arc<VersionManager>,
    config: SyncConfig,
}

impl SyncController {
    pub fn new(
        tc: TypeConfig,
        template: Arc<dyn ResourceClient>,
        placement: Option<Arc<dyn ResourceClient>>,
        overrides: Option<Arc<dyn ResourceClient>>,
        clusters: Arc<ClusterRegistry>,
        versions: Arc<VersionManager>,
        config: SyncConfig,
    ) -> Self {
        Self { target: tc.target_kind(), tc, template, placement, overrides, clusters, versions, config }
    }

    pub fn clusters(&self) -> &Arc<ClusterRegistry> { &self.clusters }

    pub fn versions(&self) -> &Arc<VersionManager> { &self.versions }

    /// Every object with a template or a version record.
    pub async fn known_keys(&self) -> FedResult<Vec<QualifiedName>> {
        let listed = self.template.list(self.config.federation_namespace.as_deref(), None).await?;
        let mut keys: BTreeSet<QualifiedName> = listed.iter().filter_map(QualifiedName::from_object).collect();
        keys.extend(self.versions.recorded_names());
        Ok(keys.into_iter().collect())
    }

    async fn sync_object(&self, name: &QualifiedName) -> FedResult<Pass> {
        let Some(obj) = self.template.get(name.namespace(), &name.name).await? else {
            return self.remove_everywhere(name).await;
        };
        if kfed_core::is_deleting(&obj) {
            return self.finalize(name, obj).await;
        }
        let Some(obj) = self.set_finalizer(name, obj, true).await? else { return Ok(Pass::Done) };
        let placement_obj = sibling(&self.placement, name).await?;
        let override_obj = sibling(&self.overrides, name).await?;
        match parse_federated(&self.tc, &obj, placement_obj.as_ref(), override_obj.as_ref()) {
            Ok(fed) => self.propagate(&obj, &fed).await,
            Err(e) => {
                warn!(object = %name, error = %e, "invalid federated object");
                self.write_status(name, &obj, PropagationStatus::config_error(&e.to_string())).await;
                Ok(Pass::ConfigError)
            }
        }
    }

    async fn propagate(&self, obj: &Value, fed: &FederatedResource) -> FedResult<Pass> {
        let clusters = self.clusters.current();
        let placement = resolve_placement(&fed.placement, &clusters);
        let recorded = self.versions.get(&fed.name, &fed.template_version, &fed.override_version);
        let previous: BTreeSet<String> =
            self.versions.recorded(&fed.name).map(|r| r.cluster_versions.into_keys().collect()).unwrap_or_default();

        let applies = placement.ready.iter().filter_map(|c| clusters.get(c)).map(|cluster| {
            let rec = recorded.get(&cluster.name).filter(|v| !v.is_empty()).cloned();
            async move { (cluster.name.clone(), self.timed(&cluster.name, self.apply_to(cluster, fed, rec)).await) }
        });
        let stale: Vec<&ClusterSnapshot> = previous.difference(&placement.selected).filter_map(|c| clusters.get(c)).collect();
        let (applied, pending) = futures::join!(join_all(applies), self.remove_from_clusters(&fed.name, stale));

        let mut pass = Pass::Done;
        let mut version_map = BTreeMap::new();
        let mut statuses = Vec::new();
        for (cluster, outcome) in applied {
            match outcome {
                Ok(s) => {
                    counter!("sync_cluster_ops_total", 1u64, "op" => s.op, "result" => "ok");
                    version_map.insert(cluster.clone(), s.version);
                    statuses.push(ClusterStatus::ok(&cluster));
                }
                Err(e) => {
                    warn!(object = %fed.name, cluster = %cluster, error = %e, "propagation failed");
                    counter!("sync_cluster_ops_total", 1u64, "op" => "apply", "result" => e.reason());
                    let reason = if e.is_already_exists() { "AlreadyExists" } else { "ApplyFailed" };
                    pass = pass.max(if matches!(e, FedError::Config(_)) { Pass::ConfigError } else { Pass::Retry });
                    statuses.push(ClusterStatus::error(&cluster, reason, e.to_string()));
                }
            }
        }
        for cluster in placement.selected.difference(&placement.ready) {
            statuses.push(ClusterStatus::pending(cluster, "ClusterNotReady"));
        }
        for (cluster, err) in pending {
            version_map.insert(cluster.clone(), String::new());
            statuses.push(match err {
                Some(e) => {
                    pass = pass.max(Pass::Retry);
                    ClusterStatus::error(&cluster, "DeletionFailed", e.to_string())
                }
                None => ClusterStatus::pending(&cluster, "WaitingForRemoval"),
            });
        }
        // Placed clusters that were unready or failed may still hold a copy:
        // keep them tracked, converged only if their record still matches.
        for cluster in previous.intersection(&placement.selected) {
            if !version_map.contains_key(cluster) {
                version_map.insert(cluster.clone(), recorded.get(cluster).cloned().unwrap_or_default());
            }
        }

        self.versions.update(&fed.name, &fed.template_version, &fed.override_version, &placement.selected, &version_map);
        self.write_status(&fed.name, obj, PropagationStatus::from_clusters(statuses)).await;
        debug!(object = %fed.name, placed = placement.selected.len(), ready = placement.ready.len(), ?pass, "propagation pass done");
        Ok(pass)
    }

    async fn timed<T>(&self, cluster: &str, fut: impl Future<Output = FedResult<T>>) -> FedResult<T> {
        match tokio::time::timeout(self.config.cluster_op_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(FedError::Transient(format!("cluster {} did not answer within {:?}", cluster, self.config.cluster_op_timeout))),
        }
    }

    /// Converge one ready cluster. A matching recorded version means the
    /// cluster is skipped without an API call unless drift verification is on.
    async fn apply_to(&self, cluster: &ClusterSnapshot, fed: &FederatedResource, recorded: Option<String>) -> FedResult<Synced> {
        if let Some(version) = recorded.as_ref().filter(|_| !self.config.verify_cluster_versions) {
            return Ok(Synced { version: version.clone(), op: "skip" });
        }
        let desired = desired_object(fed, &self.tc, &cluster.name)?;
        let client = cluster.clients.client_for(&self.target).await?;
        retry_on_conflict(RetryPolicy::once(), |_| self.apply_once(client.as_ref(), &cluster.name, &desired, recorded.as_deref())).await
    }

    /// Get, then create or update. A create racing another writer surfaces as
    /// a conflict so the surrounding retry re-reads the object.
    async fn apply_once(&self, client: &dyn ResourceClient, cluster: &str, desired: &Value, recorded: Option<&str>) -> FedResult<Synced> {
        let ns = kfed_core::meta_str(desired, "namespace");
        let name = kfed_core::meta_str(desired, "name").unwrap_or_default();
        let created = |obj: Value| Synced { version: object_version(&obj), op: "create" };
        let live = match client.get(ns, name).await? {
            None => {
                return match client.create(desired).await {
                    Ok(obj) => Ok(created(obj)),
                    Err(e) if e.is_already_exists() => Err(FedError::Conflict(format!("{} appeared in {} during create", name, cluster))),
                    Err(e) => Err(e),
                };
            }
            Some(live) => live,
        };
        if !kfed_core::is_managed(&live) {
            return Err(FedError::AlreadyExists(format!("{} exists in {} and is not managed by kfed", name, cluster)));
        }
        if !object_needs_update(desired, &live, recorded) {
            return Ok(Synced { version: object_version(&live), op: "unchanged" });
        }
        let mut next = desired.clone();
        retain_cluster_fields(&self.target, &mut next, &live);
        let d = diff_summary(&strip_noisy(next.clone()), &strip_noisy(live.clone()));
        debug!(cluster, object = name, adds = d.adds, updates = d.updates, removes = d.removes, "updating member object");
        match client.update(&next).await {
            Ok(obj) => Ok(Synced { version: object_version(&obj), op: "update" }),
            Err(e) if e.is_not_found() => Ok(created(client.create(desired).await?)),
            Err(e) => Err(e),
        }
    }

    /// Delete managed copies from `clusters`; returns the clusters that still
    /// hold (or may hold) one.
    async fn remove_from_clusters(&self, name: &QualifiedName, clusters: Vec<&ClusterSnapshot>) -> PendingRemovals {
        let removals = clusters.into_iter().map(|cluster| async move {
            if !cluster.ready {
                return (cluster.name.clone(), Some(None));
            }
            match self.timed(&cluster.name, self.remove_from(cluster, name)).await {
                Ok(()) => {
                    counter!("sync_cluster_ops_total", 1u64, "op" => "delete", "result" => "ok");
                    (cluster.name.clone(), None)
                }
                Err(e) => {
                    warn!(object = %name, cluster = %cluster.name, error = %e, "member delete failed");
                    counter!("sync_cluster_ops_total", 1u64, "op" => "delete", "result" => e.reason());
                    (cluster.name.clone(), Some(Some(e)))
                }
            }
        });
        join_all(removals).await.into_iter().filter_map(|(c, pending)| pending.map(|p| (c, p))).collect()
    }

    async fn remove_from(&self, cluster: &ClusterSnapshot, name: &QualifiedName) -> FedResult<()> {
        let client = cluster.clients.client_for(&self.target).await?;
        let ns = if self.tc.namespaced() { name.namespace() } else { None };
        match client.get(ns, &name.name).await? {
            None => Ok(()),
            Some(live) if !kfed_core::is_managed(&live) => {
                debug!(cluster = %cluster.name, object = %name, "leaving unmanaged object in place");
                Ok(())
            }
            Some(_) => match client.delete(ns, &name.name).await {
                Err(e) if !e.is_not_found() => Err(e),
                _ => {
                    debug!(cluster = %cluster.name, object = %name, "member object deleted");
                    Ok(())
                }
            },
        }
    }

    /// Delete every recorded member copy, then the record itself once no
    /// cluster remains. Returns whether the record is gone.
    async fn drain_record(&self, name: &QualifiedName) -> FedResult<(bool, Pass)> {
        let Some(record) = self.versions.recorded(name) else { return Ok((true, Pass::Done)) };
        let clusters = self.clusters.current();
        let targets: Vec<&ClusterSnapshot> = record.cluster_versions.keys().filter_map(|c| clusters.get(c)).collect();
        let pending = self.remove_from_clusters(name, targets).await;
        self.settle_record(name, &record, pending).await
    }

    async fn settle_record(&self, name: &QualifiedName, record: &PropagatedVersion, pending: PendingRemovals) -> FedResult<(bool, Pass)> {
        if pending.is_empty() {
            self.versions.delete(name).await?;
            info!(object = %name, "member copies removed; version record deleted");
            return Ok((true, Pass::Done));
        }
        let keep: BTreeSet<String> = pending.keys().cloned().collect();
        let map: BTreeMap<String, String> = keep.iter().map(|c| (c.clone(), String::new())).collect();
        self.versions.update(name, &record.template_version, &record.override_version, &keep, &map);
        let pass = if pending.values().any(|e| e.is_some()) { Pass::Retry } else { Pass::Done };
        debug!(object = %name, remaining = keep.len(), "member deletion incomplete");
        Ok((false, pass))
    }

    /// The federated object is gone without our finalizer having run.
    async fn remove_everywhere(&self, name: &QualifiedName) -> FedResult<Pass> { Ok(self.drain_record(name).await?.1) }

    /// Deletion requested: clean up member copies (unless orphaned), then
    /// release the finalizer.
    async fn finalize(&self, name: &QualifiedName, obj: Value) -> FedResult<Pass> {
        if !kfed_core::has_finalizer(&obj, SYNC_FINALIZER) {
            return Ok(Pass::Done);
        }
        if kfed_core::annotation(&obj, ORPHAN_ANNOTATION) == Some("true") {
            info!(object = %name, "orphaning member copies");
            self.versions.delete(name).await?;
        } else {
            let (cleared, pass) = self.drain_record(name).await?;
            if !cleared {
                return Ok(pass);
            }
        }
        self.set_finalizer(name, obj, false).await?;
        info!(object = %name, "finalizer released");
        Ok(Pass::Done)
    }

    /// Add or drop our finalizer; `None` when the object vanished meanwhile.
    async fn set_finalizer(&self, name: &QualifiedName, obj: Value, present: bool) -> FedResult<Option<Value>> {
        if kfed_core::has_finalizer(&obj, SYNC_FINALIZER) == present {
            return Ok(Some(obj));
        }
        let obj = &obj;
        retry_on_conflict(RetryPolicy::once(), |attempt| async move {
            let current = if attempt == 0 { Some(obj.clone()) } else { self.template.get(name.namespace(), &name.name).await? };
            let Some(mut current) = current else { return Ok(None) };
            if kfed_core::has_finalizer(&current, SYNC_FINALIZER) == present {
                return Ok(Some(current));
            }
            edit_finalizers(&mut current, present);
            match self.template.update(&current).await {
                Ok(updated) => Ok(Some(updated)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Write status when enabled for the type and different from what is stored.
    async fn write_status(&self, name: &QualifiedName, obj: &Value, status: PropagationStatus) {
        if !self.tc.status_enabled {
            return;
        }
        let value = status.to_value();
        if obj.get("status") == Some(&value) {
            return;
        }
        let value = &value;
        let res = retry_on_conflict(RetryPolicy::once(), |attempt| async move {
            let current = if attempt == 0 { Some(obj.clone()) } else { self.template.get(name.namespace(), &name.name).await? };
            let Some(mut current) = current else { return Ok(()) };
            if current.get("status") == Some(value) {
                return Ok(());
            }
            current["status"] = value.clone();
            self.template.update_status(&current).await.map(|_| ())
        })
        .await;
        match res {
            Ok(()) => counter!("sync_status_writes_total", 1u64),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(object = %name, error = %e, "status update failed");
                counter!("sync_status_errors_total", 1u64, "reason" => e.reason());
            }
        }
    }
}

fn edit_finalizers(obj: &mut Value, present: bool) {
    let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    let mut list: Vec<Value> = meta.get("finalizers").and_then(|f| f.as_array()).cloned().unwrap_or_default();
    list.retain(|f| f.as_str() != Some(SYNC_FINALIZER));
    if present {
        list.push(Value::String(SYNC_FINALIZER.to_string()));
    }
    meta.insert("finalizers".into(), Value::Array(list));
}

async fn sibling(client: &Option<Arc<dyn ResourceClient>>, name: &QualifiedName) -> FedResult<Option<Value>> {
    match client {
        Some(c) => c.get(name.namespace(), &name.name).await,
        None => Ok(None),
    }
}

#[async_trait]
impl Reconciler for SyncController {
    async fn reconcile(&self, key: &str) -> Requeue {
        let name = QualifiedName::parse(key);
        let started = Instant::now();
        let res = self.sync_object(&name).await;
        histogram!("sync_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "type" => self.tc.name.clone());
        let (result, requeue) = match res {
            Ok(Pass::Done) => ("ok", Requeue::Done),
            Ok(Pass::Retry) => ("retry", Requeue::Backoff),
            Ok(Pass::ConfigError) => ("config_error", Requeue::After(self.config.config_error_delay)),
            Err(e @ FedError::Config(_)) => {
                warn!(object = %name, error = %e, "configuration error");
                ("config_error", Requeue::After(self.config.config_error_delay))
            }
            Err(e) => {
                warn!(object = %name, error = %e, "reconcile failed");
                ("error", Requeue::Backoff)
            }
        };
        counter!("sync_reconcile_total", 1u64, "type" => self.tc.name.clone(), "result" => result);
        requeue
    }
}
