//! Version records stored as PropagatedVersion objects in the host cluster.
//! The payload lives in the status subresource.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use kfed_core::{ApiKind, FedError, FedResult, PropagatedVersion, QualifiedName, CORE_GROUP, CORE_VERSION};
use kfed_kubehub::ResourceClient;

use crate::VersionStore;

pub struct ApiVersionStore {
    client: Arc<dyn ResourceClient>,
}

impl ApiVersionStore {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client } }

    pub fn kind_for(namespaced: bool) -> ApiKind {
        let kind = if namespaced { "PropagatedVersion" } else { "ClusterPropagatedVersion" };
        ApiKind::new(CORE_GROUP, CORE_VERSION, kind)
    }

    fn render(&self, r: &PropagatedVersion) -> Value {
        let kind = self.client.kind();
        let clusters: Vec<Value> =
            r.cluster_versions.iter().map(|(c, v)| json!({ "clusterName": c, "version": v })).collect();
        let mut meta = json!({ "name": r.name });
        if let Some(ns) = &r.namespace {
            meta["namespace"] = json!(ns);
        }
        if let Some(rv) = &r.resource_version {
            meta["resourceVersion"] = json!(rv);
        }
        json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": meta,
            "status": {
                "templateVersion": r.template_version,
                "overrideVersion": r.override_version,
                "clusterVersions": clusters,
            }
        })
    }
}

/// Object shape back to a record; missing status reads as empty versions.
pub fn parse_record(obj: &Value) -> FedResult<PropagatedVersion> {
    let name = QualifiedName::from_object(obj).ok_or_else(|| FedError::Invariant("propagated version without a name".into()))?;
    let status = obj.get("status");
    let text = |field: &str| status.and_then(|s| s.get(field)).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let mut cluster_versions = BTreeMap::new();
    for entry in status.and_then(|s| s.get("clusterVersions")).and_then(|v| v.as_array()).into_iter().flatten() {
        if let (Some(c), Some(v)) = (entry.get("clusterName").and_then(|c| c.as_str()), entry.get("version").and_then(|v| v.as_str())) {
            cluster_versions.insert(c.to_string(), v.to_string());
        }
    }
    Ok(PropagatedVersion {
        namespace: name.namespace.clone(),
        name: name.name,
        template_version: text("templateVersion"),
        override_version: text("overrideVersion"),
        cluster_versions,
        resource_version: kfed_core::resource_version(obj).map(|s| s.to_string()),
    })
}

#[async_trait]
impl VersionStore for ApiVersionStore {
    async fn list(&self, namespace: Option<&str>) -> FedResult<Vec<PropagatedVersion>> {
        self.client.list(namespace, None).await?.iter().map(parse_record).collect()
    }

    async fn get(&self, name: &QualifiedName) -> FedResult<Option<PropagatedVersion>> {
        self.client.get(name.namespace(), &name.name).await?.as_ref().map(parse_record).transpose()
    }

    /// Create the object, then write its status; the status subresource
    /// ignores the status in a create body.
    async fn create(&self, record: &PropagatedVersion) -> FedResult<PropagatedVersion> {
        let mut fresh = record.clone();
        fresh.resource_version = None;
        let created = self.client.create(&self.render(&fresh)).await?;
        fresh.resource_version = kfed_core::resource_version(&created).map(|s| s.to_string());
        let written = self.client.update_status(&self.render(&fresh)).await?;
        parse_record(&written)
    }

    async fn update(&self, record: &PropagatedVersion) -> FedResult<PropagatedVersion> {
        let written = self.client.update_status(&self.render(record)).await?;
        parse_record(&written)
    }

    async fn delete(&self, name: &QualifiedName) -> FedResult<()> { self.client.delete(name.namespace(), &name.name).await }
}
