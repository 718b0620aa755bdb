//! kfed persist: the Version Manager.
//!
//! Tracks, per federated object, the version last written to each member
//! cluster. Reads are served from memory; writes are coalesced per key and
//! persisted by a background worker so bursts of updates collapse into the
//! latest value and never block the reconcile path.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kfed_core::{FedError, FedResult, PropagatedVersion, QualifiedName, TypeConfig};
use kfed_kubehub::ClientFactory;
use kfed_store::{retry, spawn_workers, Backoff, Reconciler, Requeue, RetryPolicy, WorkQueue};

mod api;
mod sqlite;

pub use api::ApiVersionStore;
pub use sqlite::SqliteVersionStore;

/// Durable home of PropagatedVersion records.
///
/// `update` must fail with `Conflict` when the record's `resource_version`
/// is stale and `NotFound` when the record is gone; `create` fails with
/// `AlreadyExists` when a record of that name exists.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn list(&self, namespace: Option<&str>) -> FedResult<Vec<PropagatedVersion>>;
    async fn get(&self, name: &QualifiedName) -> FedResult<Option<PropagatedVersion>>;
    async fn create(&self, record: &PropagatedVersion) -> FedResult<PropagatedVersion>;
    async fn update(&self, record: &PropagatedVersion) -> FedResult<PropagatedVersion>;
    async fn delete(&self, name: &QualifiedName) -> FedResult<()>;
}

/// Selects where version records live.
#[derive(Clone)]
pub enum VersionBackend {
    /// PropagatedVersion objects in the host cluster.
    Api(Arc<dyn ClientFactory>),
    Sqlite(Arc<SqliteVersionStore>),
}

impl VersionBackend {
    pub async fn store_for(&self, type_config: &TypeConfig) -> FedResult<Arc<dyn VersionStore>> {
        match self {
            VersionBackend::Api(host) => {
                let kind = ApiVersionStore::kind_for(type_config.namespaced());
                Ok(Arc::new(ApiVersionStore::new(host.client_for(&kind).await?)))
            }
            VersionBackend::Sqlite(store) => Ok(Arc::clone(store) as Arc<dyn VersionStore>),
        }
    }
}

/// In-memory version map for one federated type, persisted asynchronously.
pub struct VersionManager {
    store: Arc<dyn VersionStore>,
    prefix: String,
    namespace: Option<String>,
    versions: Mutex<FxHashMap<QualifiedName, PropagatedVersion>>,
    pending: WorkQueue,
    write_lock: tokio::sync::Mutex<()>,
    retry: RetryPolicy,
    synced: AtomicBool,
}

impl VersionManager {
    /// `namespace` limits the initial load; `None` loads every namespace.
    pub fn new(store: Arc<dyn VersionStore>, target_kind: &str, namespace: Option<&str>, retry: RetryPolicy, backoff: Backoff) -> Self {
        let prefix = kfed_core::version_prefix(target_kind);
        Self {
            store,
            pending: WorkQueue::new(&format!("versions-{}", prefix.trim_end_matches('-')), backoff),
            prefix,
            namespace: namespace.map(|s| s.to_string()),
            versions: Mutex::new(FxHashMap::default()),
            write_lock: tokio::sync::Mutex::new(()),
            retry,
            synced: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<QualifiedName, PropagatedVersion>> {
        self.versions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn version_key(&self, name: &QualifiedName) -> QualifiedName {
        QualifiedName::new(name.namespace(), &format!("{}{}", self.prefix, name.name))
    }

    pub fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }

    /// Cluster versions recorded for `name`, or empty when the template or
    /// override version moved on since they were recorded.
    pub fn get(&self, name: &QualifiedName, template_version: &str, override_version: &str) -> BTreeMap<String, String> {
        match self.lock().get(&self.version_key(name)) {
            Some(r) if r.template_version == template_version && r.override_version == override_version => r.cluster_versions.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Raw record regardless of version match.
    pub fn recorded(&self, name: &QualifiedName) -> Option<PropagatedVersion> { self.lock().get(&self.version_key(name)).cloned() }

    /// Federated object names with a record, for resync after restarts.
    pub fn recorded_names(&self) -> Vec<QualifiedName> {
        self.lock()
            .keys()
            .filter_map(|k| k.name.strip_prefix(&self.prefix).map(|n| QualifiedName::new(k.namespace(), n)))
            .collect()
    }

    /// Record the outcome of a sync pass; persisted asynchronously.
    ///
    /// Old entries survive only for `selected` clusters and only while the
    /// template/override versions still match; `version_map` always wins.
    pub fn update(
        &self,
        name: &QualifiedName,
        template_version: &str,
        override_version: &str,
        selected: &BTreeSet<String>,
        version_map: &BTreeMap<String, String>,
    ) {
        if name.name.is_empty() {
            error!(ns = ?name.namespace, "version update without an owning object; ignoring");
            counter!("version_invariant_violations_total", 1u64);
            return;
        }
        let key = self.version_key(name);
        let mut map = self.lock();
        let old = map.get(&key);
        let mut clusters = BTreeMap::new();
        if let Some(old) = old.filter(|o| o.template_version == template_version && o.override_version == override_version) {
            for (c, v) in old.cluster_versions.iter().filter(|(c, _)| selected.contains(*c)) {
                clusters.insert(c.clone(), v.clone());
            }
        }
        for (c, v) in version_map {
            clusters.insert(c.clone(), v.clone());
        }
        let next = PropagatedVersion {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            template_version: template_version.to_string(),
            override_version: override_version.to_string(),
            cluster_versions: clusters,
            resource_version: old.and_then(|o| o.resource_version.clone()),
        };
        let unchanged = match old {
            Some(o) => o.same_content(&next),
            None => next.cluster_versions.is_empty(),
        };
        if unchanged {
            return;
        }
        map.insert(key.clone(), next);
        drop(map);
        counter!("version_updates_total", 1u64);
        self.pending.add(key.to_string());
    }

    /// Remove the record and wait until the backend acknowledges.
    pub async fn delete(&self, name: &QualifiedName) -> FedResult<()> {
        let key = self.version_key(name);
        let _w = self.write_lock.lock().await;
        self.lock().remove(&key);
        self.pending.forget(&key.to_string());
        match retry(self.retry, FedError::is_retryable, |_| self.store.delete(&key)).await {
            Ok(()) => {
                debug!(record = %key, "version record deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Load existing records, then start the write worker. The returned
    /// handle completes once `cancel` fired and the worker drained.
    pub async fn sync(self: &Arc<Self>, cancel: CancellationToken) -> FedResult<JoinHandle<()>> {
        let records = retry(self.retry, FedError::is_retryable, |_| self.store.list(self.namespace.as_deref())).await?;
        let loaded = {
            let mut map = self.lock();
            for r in records.into_iter().filter(|r| r.name.starts_with(&self.prefix)) {
                map.insert(r.qualified_name(), r);
            }
            map.len()
        };
        self.synced.store(true, Ordering::Release);
        info!(prefix = %self.prefix, loaded, "version manager synced");

        let workers = spawn_workers(&self.pending, Arc::new(VersionWriter(Arc::clone(self))), 1);
        let pending = self.pending.clone();
        Ok(tokio::spawn(async move {
            cancel.cancelled().await;
            pending.shutdown();
            for w in workers {
                let _ = w.await;
            }
            debug!("version writer stopped");
        }))
    }

    async fn write(&self, key: &QualifiedName) -> FedResult<()> {
        let _w = self.write_lock.lock().await;
        let pred = |e: &FedError| e.is_conflict() || e.is_not_found() || e.is_already_exists() || e.is_retryable();
        let written = match retry(self.retry, pred, |_| self.write_once(key)).await? {
            Some(w) => w,
            None => return Ok(()),
        };
        if let Some(entry) = self.lock().get_mut(key) {
            entry.resource_version = written.resource_version;
        }
        counter!("version_writes_total", 1u64);
        Ok(())
    }

    /// One persistence attempt; on conflict or races it refreshes the cached
    /// concurrency token so the next attempt can succeed.
    async fn write_once(&self, key: &QualifiedName) -> FedResult<Option<PropagatedVersion>> {
        let Some(record) = self.lock().get(key).cloned() else { return Ok(None) };
        let res = match record.resource_version {
            Some(_) => self.store.update(&record).await,
            None => self.store.create(&record).await,
        };
        match res {
            Ok(w) => Ok(Some(w)),
            Err(e) if e.is_not_found() => {
                debug!(record = %key, "version record vanished; recreating");
                self.set_token(key, None);
                Err(e)
            }
            Err(e) if e.is_conflict() || e.is_already_exists() => {
                let latest = self.store.get(key).await?;
                debug!(record = %key, error = %e, "refreshing version record token");
                self.set_token(key, latest.and_then(|l| l.resource_version));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn set_token(&self, key: &QualifiedName, token: Option<String>) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.resource_version = token;
        }
    }
}

struct VersionWriter(Arc<VersionManager>);

#[async_trait]
impl Reconciler for VersionWriter {
    async fn reconcile(&self, key: &str) -> Requeue {
        match self.0.write(&QualifiedName::parse(key)).await {
            Ok(()) => Requeue::Done,
            Err(e) => {
                warn!(record = %key, error = %e, "persisting propagated version failed; will retry");
                counter!("version_write_errors_total", 1u64, "reason" => e.reason());
                Requeue::Backoff
            }
        }
    }
}
