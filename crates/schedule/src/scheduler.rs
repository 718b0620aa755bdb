//! Scheduler controller shell: one instance per preference kind, one plugin
//! per federated type scheduled by that kind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kfed_core::{ApiKind, FedError, FedResult, Placement, QualifiedName, ScheduleResult, TypeConfig};
use kfed_kubehub::{spawn_watch, ClientFactory, ClusterRegistry, ResourceClient};
use kfed_schema::{parse_overrides, parse_placement, parse_preference, render_overrides, render_placement};
use kfed_store::{retry_on_conflict, spawn_workers, Backoff, Reconciler, Requeue, RetryPolicy, WorkQueue};

use crate::{merge_overrides, override_update_needed, placement_update_needed, schedule};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Namespace holding preferences and federated objects; `None` for all.
    pub namespace: Option<String>,
    pub workers: usize,
    pub backoff: Backoff,
    pub config_error_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self { Self { namespace: None, workers: 2, backoff: Backoff::default(), config_error_delay: Duration::from_secs(60) } }
}

/// Writes one federated type's placement and overrides.
struct Plugin {
    tc: TypeConfig,
    template: Arc<dyn ResourceClient>,
    placement: Option<Arc<dyn ResourceClient>>,
    overrides: Option<Arc<dyn ResourceClient>>,
    /// Read-held for the duration of every write; flipped under the write lock on removal.
    alive: RwLock<bool>,
    cancel: CancellationToken,
    watch: Mutex<Option<JoinHandle<()>>>,
}

impl Plugin {
    fn placement_target(&self) -> (&Arc<dyn ResourceClient>, bool) {
        match &self.placement {
            Some(c) if !self.tc.placement_in_template() => (c, true),
            _ => (&self.template, false),
        }
    }

    fn override_target(&self) -> (&Arc<dyn ResourceClient>, bool) {
        match &self.overrides {
            Some(c) if !self.tc.overrides_in_template() => (c, true),
            _ => (&self.template, false),
        }
    }

    /// The object holding placement or overrides: the template itself or its sibling.
    async fn source(&self, client: &Arc<dyn ResourceClient>, template: &Value, name: &QualifiedName) -> FedResult<Option<Value>> {
        if client.kind() == self.template.kind() {
            return Ok(Some(template.clone()));
        }
        client.get(name.namespace(), &name.name).await
    }

    /// Render `result` onto the federated object; returns whether anything was written.
    async fn apply(&self, name: &QualifiedName, result: &ScheduleResult) -> FedResult<bool> {
        let alive = self.alive.read().await;
        if !*alive {
            return Ok(false);
        }
        let Some(template) = self.template.get(name.namespace(), &name.name).await? else { return Ok(false) };
        if kfed_core::is_deleting(&template) {
            return Ok(false);
        }

        let (placement_client, _) = self.placement_target();
        let placement_obj = self.source(placement_client, &template, name).await?;
        let (override_client, _) = self.override_target();
        let override_obj = self.source(override_client, &template, name).await?;
        let current_placement = parse_placement(placement_obj.as_ref().and_then(|o| o.pointer("/spec/placement")))?;
        let current_overrides = parse_overrides(override_obj.as_ref().and_then(|o| o.pointer("/spec/overrides")))?;

        let mut writes: Vec<(&Arc<dyn ResourceClient>, bool, Vec<(&'static str, Value)>)> = Vec::new();
        if placement_update_needed(&current_placement, result) {
            let value = render_placement(&Placement::Clusters(result.placement()));
            push_field(&mut writes, self.placement_target(), "placement", value);
        }
        if override_update_needed(&current_overrides, result) {
            let value = render_overrides(&merge_overrides(&current_overrides, result));
            push_field(&mut writes, self.override_target(), "overrides", value);
        }
        if writes.is_empty() {
            return Ok(false);
        }
        for (client, create, fields) in &writes {
            write_spec_fields(client, name, *create, fields).await?;
        }
        counter!("schedule_updates_total", 1u64, "type" => self.tc.name.clone());
        debug!(type_config = %self.tc.name, object = %name, clusters = ?result.placement(), "schedule written");
        Ok(true)
    }
}

fn push_field<'a>(
    writes: &mut Vec<(&'a Arc<dyn ResourceClient>, bool, Vec<(&'static str, Value)>)>,
    (client, create): (&'a Arc<dyn ResourceClient>, bool),
    field: &'static str,
    value: Value,
) {
    match writes.iter_mut().find(|(c, _, _)| c.kind() == client.kind()) {
        Some((_, _, fields)) => fields.push((field, value)),
        None => writes.push((client, create, vec![(field, value)])),
    }
}

async fn write_spec_fields(client: &Arc<dyn ResourceClient>, name: &QualifiedName, create: bool, fields: &[(&'static str, Value)]) -> FedResult<()> {
    retry_on_conflict(RetryPolicy::once(), |_| async move {
        match client.get(name.namespace(), &name.name).await? {
            Some(mut obj) => {
                for (field, value) in fields {
                    obj["spec"][*field] = value.clone();
                }
                client.update(&obj).await.map(|_| ())
            }
            None if create => {
                let kind = client.kind();
                let mut obj = json!({ "apiVersion": kind.api_version(), "kind": kind.kind, "metadata": { "name": name.name } });
                if let Some(ns) = name.namespace() {
                    obj["metadata"]["namespace"] = json!(ns);
                }
                for (field, value) in fields {
                    obj["spec"][*field] = value.clone();
                }
                match client.create(&obj).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_already_exists() => Err(FedError::Conflict(format!("{} {} created concurrently", kind.kind, name))),
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        }
    })
    .await
}

struct Scheduler {
    kind: ApiKind,
    preferences: Arc<dyn ResourceClient>,
    clusters: Arc<ClusterRegistry>,
    plugins: Mutex<BTreeMap<String, Arc<Plugin>>>,
    config: SchedulerConfig,
}

impl Scheduler {
    fn plugins(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Plugin>>> { self.plugins.lock().unwrap_or_else(|p| p.into_inner()) }

    fn plugins_for(&self, template_kind: Option<&str>) -> Vec<Arc<Plugin>> {
        self.plugins().values().filter(|p| template_kind.map(|k| p.tc.template.kind == k).unwrap_or(true)).cloned().collect()
    }

    async fn schedule_object(&self, name: &QualifiedName) -> FedResult<()> {
        let Some(raw) = self.preferences.get(name.namespace(), &name.name).await? else {
            debug!(kind = %self.kind.kind, object = %name, "no preference; placement left as is");
            return Ok(());
        };
        let pref = parse_preference(&raw)?;
        let ready = self.clusters.current().ready_names();
        let result = schedule(&pref, &ready);
        let mut first_err = None;
        for plugin in self.plugins_for(pref.target_kind.as_deref()) {
            if let Err(e) = plugin.apply(&pref.name, &result).await {
                warn!(type_config = %plugin.tc.name, object = %name, error = %e, "writing schedule failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Reconciler for Scheduler {
    async fn reconcile(&self, key: &str) -> Requeue {
        let name = QualifiedName::parse(key);
        let (result, requeue) = match self.schedule_object(&name).await {
            Ok(()) => ("ok", Requeue::Done),
            Err(e @ FedError::Config(_)) => {
                warn!(kind = %self.kind.kind, object = %name, error = %e, "invalid preference");
                ("config_error", Requeue::After(self.config.config_error_delay))
            }
            Err(e) => {
                debug!(kind = %self.kind.kind, object = %name, error = %e, "schedule pass failed");
                ("error", Requeue::Backoff)
            }
        };
        counter!("schedule_reconcile_total", 1u64, "kind" => self.kind.kind.clone(), "result" => result);
        requeue
    }
}

/// A running scheduler for one preference kind.
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    host: Arc<dyn ClientFactory>,
    queue: WorkQueue,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Start the scheduler for preferences of `kind`. Plugins are added per type
/// with [`SchedulerHandle::add_plugin`].
pub async fn start_scheduler(
    host: Arc<dyn ClientFactory>,
    kind: ApiKind,
    clusters: Arc<ClusterRegistry>,
    config: SchedulerConfig,
    stop: CancellationToken,
) -> FedResult<SchedulerHandle> {
    let cancel = stop.child_token();
    let preferences = host.client_for(&kind).await?;
    let queue = WorkQueue::new(&format!("schedule-{}", kind.kind.to_lowercase()), config.backoff);
    let workers = config.workers;
    let ns = config.namespace.clone();
    let scheduler = Arc::new(Scheduler { kind: kind.clone(), preferences: Arc::clone(&preferences), clusters, plugins: Mutex::new(BTreeMap::new()), config });

    let mut tasks = Vec::new();
    {
        let q = queue.clone();
        tasks.push(spawn_watch(preferences, ns, cancel.clone(), move |d| {
            if let Some(k) = d.key() {
                q.add(k.to_string());
            }
        }));
    }
    tasks.push(spawn_cluster_resync(Arc::clone(&scheduler), queue.clone(), cancel.clone()));
    tasks.extend(spawn_workers(&queue, Arc::clone(&scheduler), workers));
    {
        let (q, c) = (queue.clone(), cancel.clone());
        tasks.push(tokio::spawn(async move {
            c.cancelled().await;
            q.shutdown();
        }));
    }
    info!(kind = %kind, workers, "scheduler started");
    Ok(SchedulerHandle { scheduler, host, queue, cancel, tasks })
}

/// Readiness changes move allocations; recompute every preference.
fn spawn_cluster_resync(scheduler: Arc<Scheduler>, queue: WorkQueue, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut epochs = scheduler.clusters.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = epochs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match scheduler.preferences.list(scheduler.config.namespace.as_deref(), None).await {
                        Ok(prefs) => {
                            for key in prefs.iter().filter_map(QualifiedName::from_object) {
                                queue.add(key.to_string());
                            }
                        }
                        Err(e) => warn!(kind = %scheduler.kind.kind, error = %e, "listing preferences for resync failed"),
                    }
                }
            }
        }
    })
}

async fn optional_client(host: &Arc<dyn ClientFactory>, separate: bool, kind: ApiKind) -> FedResult<Option<Arc<dyn ResourceClient>>> {
    if !separate {
        return Ok(None);
    }
    Ok(Some(host.client_for(&kind).await?))
}

impl SchedulerHandle {
    pub fn kind(&self) -> &ApiKind { &self.scheduler.kind }

    pub fn has_plugin(&self, type_name: &str) -> bool { self.scheduler.plugins().contains_key(type_name) }

    pub fn plugin_names(&self) -> Vec<String> { self.scheduler.plugins().keys().cloned().collect() }

    /// Start scheduling objects of `tc`. Re-adding an unchanged type is a
    /// no-op; a changed type replaces the old plugin.
    pub async fn add_plugin(&self, tc: &TypeConfig) -> FedResult<()> {
        let existing = self.scheduler.plugins().get(&tc.name).map(|p| p.tc == *tc);
        match existing {
            Some(true) => return Ok(()),
            Some(false) => {
                self.remove_plugin(&tc.name).await;
            }
            None => {}
        }
        let template = self.host.client_for(&tc.template_kind()).await?;
        let placement = optional_client(&self.host, !tc.placement_in_template(), tc.placement_kind()).await?;
        let overrides = optional_client(&self.host, !tc.overrides_in_template(), tc.override_kind()).await?;
        let cancel = self.cancel.child_token();
        let q = self.queue.clone();
        // Template events share keys with their preferences.
        let watch = spawn_watch(Arc::clone(&template), self.scheduler.config.namespace.clone(), cancel.clone(), move |d| {
            if let Some(k) = d.key() {
                q.add(k.to_string());
            }
        });
        let plugin = Arc::new(Plugin {
            tc: tc.clone(),
            template,
            placement,
            overrides,
            alive: RwLock::new(true),
            cancel,
            watch: Mutex::new(Some(watch)),
        });
        self.scheduler.plugins().insert(tc.name.clone(), plugin);
        info!(kind = %self.scheduler.kind.kind, type_config = %tc.name, "scheduler plugin added");
        Ok(())
    }

    /// Remove the plugin for `type_name`. Returns once no write of that
    /// plugin is in flight and none can start.
    pub async fn remove_plugin(&self, type_name: &str) -> bool {
        let Some(plugin) = self.scheduler.plugins().remove(type_name) else { return false };
        *plugin.alive.write().await = false;
        plugin.cancel.cancel();
        let watch = plugin.watch.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(w) = watch {
            if let Err(e) = w.await {
                warn!(type_config = %type_name, error = %e, "plugin watch panicked");
            }
        }
        info!(kind = %self.scheduler.kind.kind, type_config = %type_name, "scheduler plugin removed");
        true
    }

    /// Fence every plugin, then stop watches and workers.
    pub async fn stop(self) {
        for name in self.plugin_names() {
            self.remove_plugin(&name).await;
        }
        self.cancel.cancel();
        self.queue.shutdown();
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(kind = %self.scheduler.kind.kind, error = %e, "scheduler task panicked");
            }
        }
        info!(kind = %self.scheduler.kind.kind, "scheduler stopped");
    }
}
