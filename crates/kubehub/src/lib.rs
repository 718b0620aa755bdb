//! kfed kubehub: resource clients, watchers and the member cluster registry.
//!
//! Every controller talks to the API through [`ResourceClient`], a small
//! capability interface over opaque JSON objects. Clients are built per kind at
//! controller start from a [`ClientFactory`], so no kind is enumerated at
//! compile time. The same interface serves the host cluster and every member
//! cluster.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kfed_core::{ApiKind, Delta, FedError, FedResult};

mod clusters;
pub mod fake;

pub use clusters::{ClusterRegistry, ClusterSet, ClusterSnapshot};

/// Uniform CRUD + watch handle for one kind in one cluster.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    fn kind(&self) -> &ApiKind;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, namespace: Option<&str>, name: &str) -> FedResult<Option<Value>>;

    /// `label_selector` uses the `k=v,k2=v2` equality form.
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> FedResult<Vec<Value>>;

    async fn create(&self, obj: &Value) -> FedResult<Value>;

    /// Replace; `metadata.resourceVersion` acts as the optimistic concurrency token.
    async fn update(&self, obj: &Value) -> FedResult<Value>;

    async fn update_status(&self, obj: &Value) -> FedResult<Value>;

    /// `Err(NotFound)` when already gone.
    async fn delete(&self, namespace: Option<&str>, name: &str) -> FedResult<()>;

    /// Send deltas (an initial `Applied` per existing object, then changes)
    /// until the stream ends or the receiver is dropped.
    async fn watch(&self, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> FedResult<()>;
}

/// Builds resource clients for one cluster.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client_for(&self, kind: &ApiKind) -> FedResult<Arc<dyn ResourceClient>>;
}

/// Map kube-rs errors onto the shared taxonomy.
pub fn map_kube_err(e: kube::Error) -> FedError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => FedError::NotFound(resp.message),
            409 if resp.reason == "AlreadyExists" => FedError::AlreadyExists(resp.message),
            409 => FedError::Conflict(resp.message),
            429 | 500..=599 => FedError::Transient(format!("{} ({})", resp.message, resp.code)),
            code => FedError::Api { code, message: resp.message },
        },
        kube::Error::HyperError(err) => FedError::Transient(err.to_string()),
        kube::Error::Service(err) => FedError::Transient(err.to_string()),
        other => FedError::Api { code: 0, message: other.to_string() },
    }
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_value(obj: &DynamicObject) -> FedResult<Value> {
    let mut v = serde_json::to_value(obj).map_err(|e| FedError::Invariant(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut v);
    Ok(v)
}

fn from_value(v: &Value) -> FedResult<DynamicObject> {
    serde_json::from_value(v.clone()).map_err(|e| FedError::Config(format!("object is not a valid kube object: {}", e)))
}

fn object_name(v: &Value) -> FedResult<(Option<String>, String)> {
    let name = kfed_core::meta_str(v, "name").ok_or_else(|| FedError::Config("object missing metadata.name".into()))?;
    Ok((kfed_core::meta_str(v, "namespace").map(|s| s.to_string()), name.to_string()))
}

/// kube-rs backed client for a single kind.
pub struct KubeResourceClient {
    client: Client,
    kind: ApiKind,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeResourceClient {
    /// Resolve the served resource for `kind` through discovery.
    pub async fn for_kind(client: Client, kind: &ApiKind) -> FedResult<Self> {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let (ar, caps) = discovery::pinned_kind(&client, &gvk).await.map_err(|e| match map_kube_err(e) {
            FedError::NotFound(_) => FedError::Config(format!("kind {} is not served", kind)),
            other => other,
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %kind, plural = %ar.plural, namespaced, "resource client ready");
        Ok(Self { client, kind: kind.clone(), ar, namespaced })
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    fn kind(&self) -> &ApiKind { &self.kind }

    async fn get(&self, namespace: Option<&str>, name: &str) -> FedResult<Option<Value>> {
        match self.api(namespace).get_opt(name).await.map_err(map_kube_err)? {
            Some(obj) => Ok(Some(to_value(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> FedResult<Vec<Value>> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self.api(namespace).list(&lp).await.map_err(map_kube_err)?;
        list.items.iter().map(to_value).collect()
    }

    async fn create(&self, obj: &Value) -> FedResult<Value> {
        let (ns, _) = object_name(obj)?;
        let created = self.api(ns.as_deref()).create(&PostParams::default(), &from_value(obj)?).await.map_err(map_kube_err)?;
        counter!("kube_writes_total", 1u64, "op" => "create");
        to_value(&created)
    }

    async fn update(&self, obj: &Value) -> FedResult<Value> {
        let (ns, name) = object_name(obj)?;
        let updated = self
            .api(ns.as_deref())
            .replace(&name, &PostParams::default(), &from_value(obj)?)
            .await
            .map_err(map_kube_err)?;
        counter!("kube_writes_total", 1u64, "op" => "update");
        to_value(&updated)
    }

    async fn update_status(&self, obj: &Value) -> FedResult<Value> {
        let (ns, name) = object_name(obj)?;
        let body = serde_json::to_vec(obj).map_err(|e| FedError::Invariant(format!("serializing status: {}", e)))?;
        let updated = self
            .api(ns.as_deref())
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(map_kube_err)?;
        counter!("kube_writes_total", 1u64, "op" => "update_status");
        to_value(&updated)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> FedResult<()> {
        self.api(namespace).delete(name, &DeleteParams::background()).await.map_err(map_kube_err)?;
        counter!("kube_writes_total", 1u64, "op" => "delete");
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> FedResult<()> {
        let stream = watcher::watcher(self.api(namespace), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(gvk = %self.kind, ns = ?namespace, "watcher started");
        while let Some(ev) = stream.try_next().await.map_err(|e| FedError::Transient(e.to_string()))? {
            let deltas = match ev {
                Event::Applied(o) => vec![Delta::applied(to_value(&o)?)],
                Event::Deleted(o) => vec![Delta::deleted(to_value(&o)?)],
                Event::Restarted(list) => {
                    debug!(gvk = %self.kind, count = list.len(), "watch restart");
                    list.iter().map(|o| to_value(o).map(Delta::applied)).collect::<FedResult<Vec<_>>>()?
                }
            };
            for d in deltas {
                if tx.send(d).await.is_err() {
                    debug!(gvk = %self.kind, "watch receiver dropped");
                    return Ok(());
                }
            }
        }
        warn!(gvk = %self.kind, "watcher stream ended");
        Ok(())
    }
}

/// Client factory over one kube connection; resolved kinds are cached.
pub struct KubeClientFactory {
    client: Client,
    cache: Mutex<FxHashMap<ApiKind, Arc<dyn ResourceClient>>>,
}

impl KubeClientFactory {
    pub fn new(client: Client) -> Self { Self { client, cache: Mutex::new(FxHashMap::default()) } }

    /// Connection from the ambient environment (in-cluster or default kubeconfig).
    pub async fn try_default() -> anyhow::Result<Self> { Ok(Self::new(Client::try_default().await?)) }

    /// Connection for a named kubeconfig context, used for member clusters.
    pub async fn from_context(context: &str) -> anyhow::Result<Self> {
        let kubeconfig = Kubeconfig::read()?;
        let opts = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &opts).await?;
        Ok(Self::new(Client::try_from(config)?))
    }

    /// Cheap reachability probe: the apiserver's version endpoint.
    pub async fn probe(&self) -> FedResult<Info> { self.client.apiserver_version().await.map_err(map_kube_err) }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn client_for(&self, kind: &ApiKind) -> FedResult<Arc<dyn ResourceClient>> {
        let cached = self.cache.lock().map_err(|_| FedError::Invariant("client cache poisoned".into()))?.get(kind).cloned();
        if let Some(c) = cached {
            return Ok(c);
        }
        let client: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::for_kind(self.client.clone(), kind).await?);
        let mut cache = self.cache.lock().map_err(|_| FedError::Invariant("client cache poisoned".into()))?;
        Ok(Arc::clone(cache.entry(kind.clone()).or_insert(client)))
    }
}

const REWATCH_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Follow `client`'s watch until `cancel` fires, handing every delta to
/// `on_delta`. The watch is restarted (with a full replay) whenever it ends.
pub fn spawn_watch<F>(client: Arc<dyn ResourceClient>, namespace: Option<String>, cancel: CancellationToken, on_delta: F) -> JoinHandle<()>
where
    F: Fn(Delta) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let kind = client.kind().clone();
        while !cancel.is_cancelled() {
            let (tx, mut rx) = mpsc::channel(256);
            let watcher = {
                let client = Arc::clone(&client);
                let ns = namespace.clone();
                tokio::spawn(async move { client.watch(ns.as_deref(), tx).await })
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    d = rx.recv() => match d {
                        Some(d) => on_delta(d),
                        None => break,
                    },
                }
            }
            drop(rx);
            match watcher.await {
                Ok(Err(e)) => {
                    warn!(gvk = %kind, error = %e, "watch failed");
                    counter!("watch_restarts_total", 1u64, "reason" => e.reason());
                }
                Err(e) => warn!(gvk = %kind, error = %e, "watch task failed"),
                Ok(Ok(())) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(REWATCH_DELAY) => {}
            }
        }
        debug!(gvk = %kind, "watch stopped");
    })
}
