//! kfed sync: the per-type propagation loop.
//!
//! One controller instance serves one federated type. Watches on the template
//! (and separate placement/override kinds) plus cluster registry changes feed
//! a keyed work queue; workers converge every member cluster towards the
//! desired object and record what they wrote in the Version Manager.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kfed_core::{FedResult, QualifiedName, TypeConfig};
use kfed_kubehub::{spawn_watch, ClientFactory, ClusterRegistry, ResourceClient};
use kfed_persist::{VersionBackend, VersionManager};
use kfed_store::{spawn_workers, Backoff, RetryPolicy, WorkQueue};

mod controller;
mod status;

pub use controller::SyncController;
pub use status::{ClusterState, ClusterStatus, PropagationStatus};

fn env_u64(key: &str, default: u64) -> u64 { std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default) }

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Tunables shared by every sync controller instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workers: usize,
    /// Namespace holding federated objects; `None` watches all namespaces.
    pub federation_namespace: Option<String>,
    pub cluster_op_timeout: Duration,
    /// Re-read recorded clusters and rewrite drifted objects.
    pub verify_cluster_versions: bool,
    pub backoff: Backoff,
    pub retry: RetryPolicy,
    /// Requeue delay for objects with configuration errors.
    pub config_error_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            federation_namespace: None,
            cluster_op_timeout: Duration::from_secs(30),
            verify_cluster_versions: false,
            backoff: Backoff::default(),
            retry: RetryPolicy::default(),
            config_error_delay: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_u64("KFED_WORKERS", d.workers as u64).max(1) as usize,
            federation_namespace: std::env::var("KFED_FEDERATION_NAMESPACE").ok().filter(|s| !s.is_empty()),
            cluster_op_timeout: Duration::from_secs(env_u64("KFED_CLUSTER_OP_TIMEOUT_SECS", 30)),
            verify_cluster_versions: env_flag("KFED_VERIFY_CLUSTER_VERSIONS"),
            backoff: Backoff::new(
                Duration::from_millis(env_u64("KFED_BACKOFF_BASE_MS", 100)),
                Duration::from_secs(env_u64("KFED_BACKOFF_MAX_SECS", 300)),
            ),
            retry: d.retry,
            config_error_delay: Duration::from_secs(env_u64("KFED_CONFIG_ERROR_DELAY_SECS", 60)),
        }
    }
}

/// What a sync controller needs from its surroundings.
#[derive(Clone)]
pub struct SyncContext {
    /// Host cluster holding federated objects and version records.
    pub host: Arc<dyn ClientFactory>,
    pub clusters: Arc<ClusterRegistry>,
    pub versions: VersionBackend,
    pub config: SyncConfig,
}

/// A running sync controller.
pub struct SyncHandle {
    type_name: String,
    cancel: CancellationToken,
    queue: WorkQueue,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn type_name(&self) -> &str { &self.type_name }

    /// Force a reconcile of one federated object.
    pub fn enqueue(&self, name: &QualifiedName) { self.queue.add(name.to_string()); }

    pub fn is_stopped(&self) -> bool { self.cancel.is_cancelled() }

    /// Cancel, then wait until every worker and watch has exited. In-flight
    /// passes complete; no new key is dequeued once this is called.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.queue.shutdown();
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(type_config = %self.type_name, error = %e, "sync task panicked");
            }
        }
        info!(type_config = %self.type_name, "sync controller stopped");
    }
}

async fn optional_client(host: &Arc<dyn ClientFactory>, separate: bool, kind: kfed_core::ApiKind) -> FedResult<Option<Arc<dyn ResourceClient>>> {
    if !separate {
        return Ok(None);
    }
    Ok(Some(host.client_for(&kind).await?))
}

/// Start the sync controller for one federated type. Version records are
/// loaded before the first key is processed.
pub async fn start_sync_controller(ctx: &SyncContext, tc: &TypeConfig, stop: CancellationToken) -> FedResult<SyncHandle> {
    let cfg = &ctx.config;
    let cancel = stop.child_token();
    let ns = cfg.federation_namespace.clone();

    let template = ctx.host.client_for(&tc.template_kind()).await?;
    let placement = optional_client(&ctx.host, !tc.placement_in_template(), tc.placement_kind()).await?;
    let overrides = optional_client(&ctx.host, !tc.overrides_in_template(), tc.override_kind()).await?;

    let store = ctx.versions.store_for(tc).await?;
    let versions = Arc::new(VersionManager::new(store, &tc.target.kind, ns.as_deref(), cfg.retry, cfg.backoff));
    let mut tasks = vec![versions.sync(cancel.child_token()).await?];

    let queue = WorkQueue::new(&format!("sync-{}", tc.name), cfg.backoff);
    let controller = Arc::new(SyncController::new(
        tc.clone(),
        Arc::clone(&template),
        placement.clone(),
        overrides.clone(),
        Arc::clone(&ctx.clusters),
        Arc::clone(&versions),
        cfg.clone(),
    ));

    for client in std::iter::once(Arc::clone(&template)).chain(placement).chain(overrides) {
        let q = queue.clone();
        tasks.push(spawn_watch(client, ns.clone(), cancel.clone(), move |d| {
            if let Some(key) = d.key() {
                q.add(key.to_string());
            }
        }));
    }
    tasks.push(spawn_cluster_resync(Arc::clone(&controller), queue.clone(), cancel.clone()));
    tasks.extend(spawn_workers(&queue, Arc::clone(&controller), cfg.workers));
    {
        let (q, c) = (queue.clone(), cancel.clone());
        tasks.push(tokio::spawn(async move {
            c.cancelled().await;
            q.shutdown();
        }));
    }

    info!(type_config = %tc.name, target = %tc.target_kind(), workers = cfg.workers, "sync controller started");
    Ok(SyncHandle { type_name: tc.name.clone(), cancel, queue, tasks })
}

/// Re-enqueue every known object whenever cluster membership or readiness changes.
fn spawn_cluster_resync(controller: Arc<SyncController>, queue: WorkQueue, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut epochs = controller.clusters().subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = epochs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match controller.known_keys().await {
                        Ok(keys) => {
                            debug!(count = keys.len(), "cluster set changed; resyncing");
                            for k in keys {
                                queue.add(k.to_string());
                            }
                        }
                        Err(e) => warn!(error = %e, "listing objects for resync failed"),
                    }
                }
            }
        }
    })
}
