//! In-memory resource client with apiserver-like semantics (resource versions,
//! generations, finalizers, status subresource), call recording and failure
//! injection. Used by every crate's tests and by local dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use kfed_core::{ApiKind, Delta, FedError, FedResult, QualifiedName};

use crate::{ClientFactory, ResourceClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
    Watch,
}

impl Op {
    pub fn is_write(self) -> bool { matches!(self, Op::Create | Op::Update | Op::UpdateStatus | Op::Delete) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub name: QualifiedName,
}

struct Failure {
    op: Op,
    name: Option<String>,
    error: FedError,
    remaining: Option<usize>,
    /// Drop the object before failing, as a concurrent delete would.
    vanish: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<QualifiedName, Value>,
    next_rv: u64,
    calls: Vec<Call>,
    failures: Vec<Failure>,
}

impl State {
    fn record(&mut self, op: Op, name: &QualifiedName) -> FedResult<()> {
        self.calls.push(Call { op, name: name.clone() });
        let hit = self.failures.iter().position(|f| f.op == op && f.name.as_deref().map(|n| n == name.name).unwrap_or(true));
        let Some(idx) = hit else { return Ok(()) };
        let err = self.failures[idx].error.clone();
        if self.failures[idx].vanish {
            self.objects.remove(name);
        }
        if let Some(left) = self.failures[idx].remaining.as_mut() {
            *left -= 1;
            if *left == 0 {
                self.failures.remove(idx);
            }
        }
        Err(err)
    }

    fn bump(&mut self, obj: &mut Value) {
        self.next_rv += 1;
        set_meta(obj, "resourceVersion", Value::String(self.next_rv.to_string()));
    }
}

fn set_meta(obj: &mut Value, field: &str, v: Value) {
    if let Some(root) = obj.as_object_mut() {
        let meta = root.entry("metadata").or_insert_with(|| Value::Object(Default::default()));
        if let Some(m) = meta.as_object_mut() {
            m.insert(field.to_string(), v);
        }
    }
}

fn copy_meta(from: &Value, to: &mut Value, field: &str) {
    match from.get("metadata").and_then(|m| m.get(field)) {
        Some(v) => set_meta(to, field, v.clone()),
        None => {
            if let Some(m) = to.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                m.remove(field);
            }
        }
    }
}

fn body_without_meta(v: &Value) -> Value {
    let mut out = v.clone();
    if let Some(o) = out.as_object_mut() {
        o.remove("metadata");
        o.remove("status");
    }
    out
}

fn finalizers_empty(v: &Value) -> bool {
    v.get("metadata").and_then(|m| m.get("finalizers")).and_then(|f| f.as_array()).map(|a| a.is_empty()).unwrap_or(true)
}

fn key_of(obj: &Value) -> FedResult<QualifiedName> {
    QualifiedName::from_object(obj).ok_or_else(|| FedError::Config("object missing metadata.name".into()))
}

fn matches_selector(obj: &Value, selector: Option<&str>) -> bool {
    let Some(sel) = selector.filter(|s| !s.is_empty()) else { return true };
    let labels = kfed_core::labels(obj);
    sel.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k.trim()).map(|x| x == v.trim()).unwrap_or(false),
        None => labels.contains_key(term.trim()),
    })
}

/// In-memory stand-in for one kind in one cluster.
pub struct FakeResourceClient {
    kind: ApiKind,
    state: Mutex<State>,
    events: broadcast::Sender<Delta>,
}

impl FakeResourceClient {
    pub fn new(kind: ApiKind) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { kind, state: Mutex::new(State::default()), events }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    fn emit(&self, d: Delta) { let _ = self.events.send(d); }

    /// Seed or overwrite an object directly, bypassing concurrency checks and call recording.
    pub fn insert(&self, obj: Value) -> Value {
        let mut o = obj;
        if o.get("apiVersion").is_none() {
            o["apiVersion"] = Value::String(self.kind.api_version());
            o["kind"] = Value::String(self.kind.kind.clone());
        }
        let key = match QualifiedName::from_object(&o) {
            Some(k) => k,
            None => return o,
        };
        let mut st = self.lock();
        if o.get("metadata").and_then(|m| m.get("uid")).is_none() {
            set_meta(&mut o, "uid", Value::String(Uuid::new_v4().to_string()));
        }
        if kfed_core::generation(&o) == 0 {
            set_meta(&mut o, "generation", Value::from(1));
        }
        st.bump(&mut o);
        st.objects.insert(key, o.clone());
        drop(st);
        self.emit(Delta::applied(o.clone()));
        o
    }

    pub fn object(&self, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock().objects.get(&QualifiedName::new(namespace, name)).cloned()
    }

    pub fn objects(&self) -> Vec<Value> { self.lock().objects.values().cloned().collect() }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn count(&self, op: Op) -> usize { self.lock().calls.iter().filter(|c| c.op == op).count() }

    pub fn write_calls(&self) -> usize { self.lock().calls.iter().filter(|c| c.op.is_write()).count() }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    /// Fail every `op` (optionally only for objects named `name`) until cleared.
    pub fn fail(&self, op: Op, name: Option<&str>, error: FedError) {
        self.lock().failures.push(Failure { op, name: name.map(|s| s.to_string()), error, remaining: None, vanish: false });
    }

    /// Fail the next `times` matching calls.
    pub fn fail_times(&self, op: Op, name: Option<&str>, error: FedError, times: usize) {
        if times == 0 {
            return;
        }
        self.lock().failures.push(Failure { op, name: name.map(|s| s.to_string()), error, remaining: Some(times), vanish: false });
    }

    /// The next `op` on `name` finds the object deleted underneath it.
    pub fn vanish_on(&self, op: Op, name: &str) {
        self.lock().failures.push(Failure {
            op,
            name: Some(name.to_string()),
            error: FedError::NotFound(name.to_string()),
            remaining: Some(1),
            vanish: true,
        });
    }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    fn kind(&self) -> &ApiKind { &self.kind }

    async fn get(&self, namespace: Option<&str>, name: &str) -> FedResult<Option<Value>> {
        let key = QualifiedName::new(namespace, name);
        let mut st = self.lock();
        st.record(Op::Get, &key)?;
        Ok(st.objects.get(&key).cloned())
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> FedResult<Vec<Value>> {
        let mut st = self.lock();
        st.record(Op::List, &QualifiedName::new(namespace, ""))?;
        Ok(st
            .objects
            .iter()
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, v)| matches_selector(v, label_selector))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, obj: &Value) -> FedResult<Value> {
        let key = key_of(obj)?;
        let mut st = self.lock();
        st.record(Op::Create, &key)?;
        if st.objects.contains_key(&key) {
            return Err(FedError::AlreadyExists(key.to_string()));
        }
        let mut o = obj.clone();
        if o.get("apiVersion").is_none() {
            o["apiVersion"] = Value::String(self.kind.api_version());
            o["kind"] = Value::String(self.kind.kind.clone());
        }
        set_meta(&mut o, "uid", Value::String(Uuid::new_v4().to_string()));
        set_meta(&mut o, "generation", Value::from(1));
        set_meta(&mut o, "creationTimestamp", Value::String(chrono::Utc::now().to_rfc3339()));
        if let Some(m) = o.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            m.remove("deletionTimestamp");
        }
        st.bump(&mut o);
        st.objects.insert(key, o.clone());
        drop(st);
        self.emit(Delta::applied(o.clone()));
        Ok(o)
    }

    async fn update(&self, obj: &Value) -> FedResult<Value> {
        let key = key_of(obj)?;
        let mut st = self.lock();
        st.record(Op::Update, &key)?;
        let current = st.objects.get(&key).cloned().ok_or_else(|| FedError::NotFound(key.to_string()))?;
        if let Some(rv) = kfed_core::resource_version(obj) {
            if Some(rv) != kfed_core::resource_version(&current) {
                return Err(FedError::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        let mut next = obj.clone();
        match current.get("status") {
            Some(s) => next["status"] = s.clone(),
            None => {
                if let Some(o) = next.as_object_mut() {
                    o.remove("status");
                }
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            copy_meta(&current, &mut next, field);
        }
        let gen = kfed_core::generation(&current);
        let gen = if body_without_meta(&current) != body_without_meta(&next) { gen + 1 } else { gen };
        set_meta(&mut next, "generation", Value::from(gen));
        st.bump(&mut next);
        if kfed_core::is_deleting(&next) && finalizers_empty(&next) {
            st.objects.remove(&key);
            drop(st);
            self.emit(Delta::deleted(next.clone()));
            return Ok(next);
        }
        st.objects.insert(key, next.clone());
        drop(st);
        self.emit(Delta::applied(next.clone()));
        Ok(next)
    }

    async fn update_status(&self, obj: &Value) -> FedResult<Value> {
        let key = key_of(obj)?;
        let mut st = self.lock();
        st.record(Op::UpdateStatus, &key)?;
        let mut next = st.objects.get(&key).cloned().ok_or_else(|| FedError::NotFound(key.to_string()))?;
        if let Some(rv) = kfed_core::resource_version(obj) {
            if Some(rv) != kfed_core::resource_version(&next) {
                return Err(FedError::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        match obj.get("status") {
            Some(s) => next["status"] = s.clone(),
            None => {
                if let Some(o) = next.as_object_mut() {
                    o.remove("status");
                }
            }
        }
        st.bump(&mut next);
        st.objects.insert(key, next.clone());
        drop(st);
        self.emit(Delta::applied(next.clone()));
        Ok(next)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> FedResult<()> {
        let key = QualifiedName::new(namespace, name);
        let mut st = self.lock();
        st.record(Op::Delete, &key)?;
        let mut current = st.objects.get(&key).cloned().ok_or_else(|| FedError::NotFound(key.to_string()))?;
        if !finalizers_empty(&current) {
            if !kfed_core::is_deleting(&current) {
                set_meta(&mut current, "deletionTimestamp", Value::String(chrono::Utc::now().to_rfc3339()));
                st.bump(&mut current);
                st.objects.insert(key, current.clone());
                drop(st);
                self.emit(Delta::applied(current));
            }
            return Ok(());
        }
        st.objects.remove(&key);
        drop(st);
        self.emit(Delta::deleted(current));
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> FedResult<()> {
        let mut rx = self.events.subscribe();
        let existing: Vec<Value> = {
            let mut st = self.lock();
            st.record(Op::Watch, &QualifiedName::new(namespace, ""))?;
            st.objects
                .iter()
                .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
                .map(|(_, v)| v.clone())
                .collect()
        };
        for o in existing {
            if tx.send(Delta::applied(o)).await.is_err() {
                return Ok(());
            }
        }
        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Ok(d) => {
                        let in_scope = namespace.is_none() || kfed_core::meta_str(&d.raw, "namespace") == namespace;
                        if in_scope && tx.send(d).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = tx.closed() => return Ok(()),
            }
        }
    }
}

/// Factory handing out one shared [`FakeResourceClient`] per kind.
#[derive(Default)]
pub struct FakeClientFactory {
    clients: Mutex<FxHashMap<ApiKind, Arc<FakeResourceClient>>>,
    failing: Mutex<BTreeSet<ApiKind>>,
}

impl FakeClientFactory {
    pub fn new() -> Self { Self::default() }

    pub fn client(&self, kind: &ApiKind) -> Arc<FakeResourceClient> {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(clients.entry(kind.clone()).or_insert_with(|| Arc::new(FakeResourceClient::new(kind.clone()))))
    }

    /// Make `client_for(kind)` fail as if the kind were not served.
    pub fn fail_kind(&self, kind: &ApiKind, failing: bool) {
        let mut set = self.failing.lock().unwrap_or_else(|p| p.into_inner());
        if failing {
            set.insert(kind.clone());
        } else {
            set.remove(kind);
        }
    }

    /// Total write calls across every kind.
    pub fn write_calls(&self) -> usize {
        self.clients.lock().unwrap_or_else(|p| p.into_inner()).values().map(|c| c.write_calls()).sum()
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn client_for(&self, kind: &ApiKind) -> FedResult<Arc<dyn ResourceClient>> {
        if self.failing.lock().unwrap_or_else(|p| p.into_inner()).contains(kind) {
            return Err(FedError::Config(format!("kind {} is not served", kind)));
        }
        Ok(self.client(kind) as Arc<dyn ResourceClient>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind() -> ApiKind { ApiKind::new("apps", "v1", "Deployment") }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let c = FakeResourceClient::new(kind());
        let created = c.create(&json!({ "metadata": { "name": "web", "namespace": "ns" }, "spec": { "replicas": 1 } })).await.unwrap();
        let mut next = created.clone();
        next["spec"]["replicas"] = json!(2);
        let updated = c.update(&next).await.unwrap();
        assert_eq!(kfed_core::generation(&updated), 2);
        let err = c.update(&next).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(c.write_calls(), 3);
    }

    #[tokio::test]
    async fn finalizers_defer_deletion() {
        let c = FakeResourceClient::new(kind());
        c.create(&json!({ "metadata": { "name": "web", "namespace": "ns", "finalizers": ["x"] } })).await.unwrap();
        c.delete(Some("ns"), "web").await.unwrap();
        let mut obj = c.object(Some("ns"), "web").expect("still present");
        assert!(kfed_core::is_deleting(&obj));
        obj["metadata"]["finalizers"] = json!([]);
        c.update(&obj).await.unwrap();
        assert!(c.object(Some("ns"), "web").is_none());
        assert!(c.delete(Some("ns"), "web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_expire() {
        let c = FakeResourceClient::new(kind());
        c.fail_times(Op::Get, Some("web"), FedError::Transient("flaky".into()), 1);
        assert!(c.get(Some("ns"), "web").await.is_err());
        assert_eq!(c.get(Some("ns"), "web").await.unwrap(), None);
    }

    #[tokio::test]
    async fn watch_replays_existing_then_streams() {
        let c = Arc::new(FakeResourceClient::new(kind()));
        c.insert(json!({ "metadata": { "name": "a", "namespace": "ns" } }));
        let (tx, mut rx) = mpsc::channel(16);
        let w = Arc::clone(&c);
        let task = tokio::spawn(async move { w.watch(Some("ns"), tx).await });
        let first = rx.recv().await.unwrap();
        assert_eq!(first.key().unwrap().name, "a");
        c.create(&json!({ "metadata": { "name": "b", "namespace": "other" } })).await.unwrap();
        c.create(&json!({ "metadata": { "name": "c", "namespace": "ns" } })).await.unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(next.key().unwrap().name, "c");
        drop(rx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_label_selector() {
        let c = FakeResourceClient::new(kind());
        c.insert(json!({ "metadata": { "name": "a", "namespace": "ns", "labels": { "kfed.io/managed": "true" } } }));
        c.insert(json!({ "metadata": { "name": "b", "namespace": "ns" } }));
        assert_eq!(c.list(None, Some("kfed.io/managed=true")).await.unwrap().len(), 1);
        assert_eq!(c.list(Some("ns"), None).await.unwrap().len(), 2);
    }
}
