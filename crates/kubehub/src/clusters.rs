//! Member cluster registry: the current set of joined clusters and their
//! readiness, swapped atomically and announced through an epoch channel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

use crate::ClientFactory;

/// One member cluster as seen by the controllers.
#[derive(Clone)]
pub struct ClusterSnapshot {
    pub name: String,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub clients: Arc<dyn ClientFactory>,
}

impl ClusterSnapshot {
    pub fn new(name: &str, ready: bool, clients: Arc<dyn ClientFactory>) -> Self {
        Self { name: name.to_string(), ready, labels: BTreeMap::new(), clients }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }
}

impl std::fmt::Debug for ClusterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSnapshot").field("name", &self.name).field("ready", &self.ready).field("labels", &self.labels).finish()
    }
}

/// Immutable view of all joined clusters.
#[derive(Clone, Debug, Default)]
pub struct ClusterSet {
    clusters: BTreeMap<String, ClusterSnapshot>,
}

impl ClusterSet {
    pub fn get(&self, name: &str) -> Option<&ClusterSnapshot> { self.clusters.get(name) }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterSnapshot> { self.clusters.values() }

    pub fn names(&self) -> BTreeSet<String> { self.clusters.keys().cloned().collect() }

    pub fn ready_names(&self) -> BTreeSet<String> { self.clusters.values().filter(|c| c.ready).map(|c| c.name.clone()).collect() }

    pub fn is_ready(&self, name: &str) -> bool { self.clusters.get(name).map(|c| c.ready).unwrap_or(false) }

    /// Clusters whose labels contain every `selector` pair.
    pub fn matching(&self, selector: &BTreeMap<String, String>) -> BTreeSet<String> {
        self.clusters
            .values()
            .filter(|c| selector.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize { self.clusters.len() }

    pub fn is_empty(&self) -> bool { self.clusters.is_empty() }
}

/// Shared registry fed by the (external) join and health-check machinery.
pub struct ClusterRegistry {
    snap: ArcSwap<ClusterSet>,
    epoch_tx: watch::Sender<u64>,
    write: Mutex<()>,
}

impl Default for ClusterRegistry {
    fn default() -> Self { Self::new() }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: ArcSwap::from_pointee(ClusterSet::default()), epoch_tx, write: Mutex::new(()) }
    }

    pub fn current(&self) -> Arc<ClusterSet> { self.snap.load_full() }

    /// Receiver notified on every membership or readiness change.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn upsert(&self, cluster: ClusterSnapshot) {
        info!(cluster = %cluster.name, ready = cluster.ready, "cluster registered");
        self.mutate(|set| {
            set.clusters.insert(cluster.name.clone(), cluster);
            true
        });
    }

    /// Returns true when the flag actually changed.
    pub fn set_ready(&self, name: &str, ready: bool) -> bool {
        let changed = self.mutate(|set| match set.clusters.get_mut(name) {
            Some(c) if c.ready != ready => {
                c.ready = ready;
                true
            }
            _ => false,
        });
        if changed {
            info!(cluster = %name, ready, "cluster readiness changed");
        }
        changed
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.mutate(|set| set.clusters.remove(name).is_some());
        if removed {
            info!(cluster = %name, "cluster removed");
        }
        removed
    }

    fn mutate(&self, f: impl FnOnce(&mut ClusterSet) -> bool) -> bool {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeClientFactory;

    fn cluster(name: &str, ready: bool) -> ClusterSnapshot { ClusterSnapshot::new(name, ready, Arc::new(FakeClientFactory::new())) }

    #[test]
    fn readiness_changes_bump_epoch() {
        let reg = ClusterRegistry::new();
        let rx = reg.subscribe();
        reg.upsert(cluster("a", true));
        reg.upsert(cluster("b", false));
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(reg.current().ready_names().into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
        assert!(!reg.set_ready("a", true));
        assert!(reg.set_ready("b", true));
        assert_eq!(*rx.borrow(), 3);
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"));
        assert_eq!(reg.current().names().len(), 1);
    }

    #[test]
    fn selector_matches_labels() {
        let reg = ClusterRegistry::new();
        let mut l = BTreeMap::new();
        l.insert("region".to_string(), "eu".to_string());
        reg.upsert(cluster("a", true).with_labels(l.clone()));
        reg.upsert(cluster("b", true));
        assert_eq!(reg.current().matching(&l).into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
        assert_eq!(reg.current().matching(&BTreeMap::new()).len(), 2);
    }
}
