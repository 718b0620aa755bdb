//! Type registry: the live set of type configuration records, swapped
//! atomically and announced through an epoch channel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kfed_core::{DeltaKind, TypeConfig};
use kfed_kubehub::ResourceClient;

use crate::parse_type_config;

const REWATCH_DELAY: Duration = Duration::from_secs(2);

/// Explicit registry handed to the controllers; tests build one directly.
pub struct TypeRegistry {
    snap: ArcSwap<BTreeMap<String, TypeConfig>>,
    epoch_tx: watch::Sender<u64>,
    write: Mutex<()>,
}

impl Default for TypeRegistry {
    fn default() -> Self { Self::new() }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: ArcSwap::from_pointee(BTreeMap::new()), epoch_tx, write: Mutex::new(()) }
    }

    pub fn current(&self) -> Arc<BTreeMap<String, TypeConfig>> { self.snap.load_full() }

    pub fn get(&self, name: &str) -> Option<TypeConfig> { self.snap.load().get(name).cloned() }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// Returns false when an identical record was already registered.
    pub fn upsert(&self, tc: TypeConfig) -> bool {
        let name = tc.name.clone();
        let changed = self.mutate(|m| {
            if m.get(&tc.name) == Some(&tc) {
                return false;
            }
            m.insert(tc.name.clone(), tc);
            true
        });
        if changed {
            info!(type_config = %name, "type config registered");
        }
        changed
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.mutate(|m| m.remove(name).is_some());
        if removed {
            info!(type_config = %name, "type config removed");
        }
        removed
    }

    /// Replace the whole set, e.g. after a relist.
    pub fn replace_all(&self, configs: Vec<TypeConfig>) {
        let next: BTreeMap<String, TypeConfig> = configs.into_iter().map(|tc| (tc.name.clone(), tc)).collect();
        self.mutate(|m| {
            if *m == next {
                return false;
            }
            *m = next;
            true
        });
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, TypeConfig>) -> bool) -> bool {
        let _guard = self.write.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = (*self.snap.load_full()).clone();
        if !f(&mut next) {
            return false;
        }
        self.snap.store(Arc::new(next));
        let epoch = *self.epoch_tx.borrow() + 1;
        self.epoch_tx.send_replace(epoch);
        true
    }

    /// Keep the registry in step with `FederatedTypeConfig` objects until
    /// `cancel` fires: relist, then follow the watch; restart on stream end.
    pub async fn run_watch(self: Arc<Self>, client: Arc<dyn ResourceClient>, namespace: Option<String>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match client.list(namespace.as_deref(), None).await {
                Ok(objs) => {
                    let configs = objs.iter().filter_map(|o| parse_logged(o)).collect();
                    self.replace_all(configs);
                }
                Err(e) => {
                    warn!(error = %e, "listing type configs failed");
                    if sleep_or_cancel(&cancel, REWATCH_DELAY).await {
                        break;
                    }
                    continue;
                }
            }
            let (tx, mut rx) = mpsc::channel(64);
            let watcher = {
                let client = Arc::clone(&client);
                let ns = namespace.clone();
                tokio::spawn(async move { client.watch(ns.as_deref(), tx).await })
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    d = rx.recv() => match d {
                        Some(d) if d.kind == DeltaKind::Applied => {
                            if let Some(tc) = parse_logged(&d.raw) {
                                self.upsert(tc);
                            }
                        }
                        Some(d) => {
                            if let Some(name) = kfed_core::meta_str(&d.raw, "name") {
                                self.remove(name);
                            }
                        }
                        None => break,
                    },
                }
            }
            drop(rx);
            match watcher.await {
                Ok(Err(e)) => warn!(error = %e, "type config watch ended"),
                Err(e) => warn!(error = %e, "type config watch task failed"),
                Ok(Ok(())) => debug!("type config watch closed"),
            }
            if sleep_or_cancel(&cancel, REWATCH_DELAY).await {
                break;
            }
        }
        debug!("type registry watch stopped");
    }
}

fn parse_logged(obj: &serde_json::Value) -> Option<TypeConfig> {
    match parse_type_config(obj) {
        Ok(tc) => Some(tc),
        Err(e) => {
            warn!(name = ?kfed_core::meta_str(obj, "name"), error = %e, "ignoring invalid type config");
            counter!("type_config_errors_total", 1u64);
            None
        }
    }
}

/// True when cancelled before the delay elapsed.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfed_kubehub::fake::FakeResourceClient;
    use serde_json::json;

    fn ftc(name: &str, pref: Option<&str>) -> serde_json::Value {
        let mut spec = json!({
            "target": { "group": "apps", "version": "v1", "kind": "Deployment" },
            "template": { "group": "types.kfed.io", "version": "v1beta1", "kind": "FederatedDeployment" },
            "placement": { "kind": "FederatedDeployment" },
            "override": { "kind": "FederatedDeployment" }
        });
        if let Some(p) = pref {
            spec["schedulingPreferenceKind"] = json!(p);
        }
        json!({ "metadata": { "name": name, "namespace": "kfed-system" }, "spec": spec })
    }

    #[test]
    fn identical_upserts_do_not_bump_epoch() {
        let reg = TypeRegistry::new();
        let rx = reg.subscribe();
        let tc = parse_type_config(&ftc("deployments.apps", None)).unwrap();
        assert!(reg.upsert(tc.clone()));
        assert!(!reg.upsert(tc));
        assert_eq!(*rx.borrow(), 1);
        assert!(reg.remove("deployments.apps"));
        assert!(!reg.remove("deployments.apps"));
        assert_eq!(*rx.borrow(), 2);
    }

    #[tokio::test]
    async fn watch_tracks_objects() {
        let client = Arc::new(FakeResourceClient::new(crate::type_config_kind()));
        client.insert(ftc("deployments.apps", Some("ReplicaSchedulingPreference")));
        let reg = Arc::new(TypeRegistry::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&reg).run_watch(client.clone(), None, cancel.clone()));

        let wait = |want: bool| {
            let reg = Arc::clone(&reg);
            async move {
                for _ in 0..200 {
                    if reg.get("deployments.apps").is_some() == want {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                panic!("registry did not converge");
            }
        };
        wait(true).await;
        client.delete(Some("kfed-system"), "deployments.apps").await.unwrap();
        wait(false).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
