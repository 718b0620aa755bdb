//! Scheduling manager: starts and stops one scheduler plugin plus sync
//! controller per federated type as type configurations come and go.
//!
//! A single worker drains a queue keyed by type name, so transitions for one
//! type never overlap. Each pass is level-triggered: it compares what runs
//! with what the registry asks for and converges.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kfed_core::{FedResult, TypeConfig};
use kfed_schedule::{start_scheduler, SchedulerHandle};
use kfed_store::{spawn_workers, Reconciler, Requeue, WorkQueue};
use kfed_sync::{start_sync_controller, SyncHandle};

use crate::{ControllerContext, SchedulerStatus, TypeState, TypeStatus};

struct RunningType {
    tc: TypeConfig,
    sync: SyncHandle,
}

#[derive(Default)]
struct Controllers {
    types: BTreeMap<String, RunningType>,
    /// Keyed by preference kind name.
    schedulers: BTreeMap<String, SchedulerHandle>,
}

#[derive(Default)]
struct View {
    types: BTreeMap<String, TypeStatus>,
    schedulers: BTreeMap<String, BTreeSet<String>>,
}

pub struct SchedulingManager {
    ctx: ControllerContext,
    controllers: tokio::sync::Mutex<Controllers>,
    view: Mutex<View>,
    queue: WorkQueue,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Start the manager. It follows `ctx.types` until `stop` fires or
/// [`SchedulingManager::shutdown`] is called.
pub fn start_scheduling_manager(ctx: ControllerContext, stop: CancellationToken) -> Arc<SchedulingManager> {
    let cancel = stop.child_token();
    let queue = WorkQueue::new("scheduling-manager", ctx.options.start_backoff);
    let manager = Arc::new(SchedulingManager {
        ctx,
        controllers: tokio::sync::Mutex::new(Controllers::default()),
        view: Mutex::new(View::default()),
        queue: queue.clone(),
        cancel: cancel.clone(),
        tasks: Mutex::new(Vec::new()),
    });
    let mut tasks = spawn_workers(&queue, Arc::clone(&manager), 1);
    tasks.push(spawn_registry_follower(Arc::clone(&manager)));
    *manager.tasks.lock().unwrap_or_else(|p| p.into_inner()) = tasks;
    info!(manage_unscheduled = manager.ctx.options.manage_unscheduled_types, "scheduling manager started");
    manager
}

/// Enqueue every known or running type on each registry change.
fn spawn_registry_follower(manager: Arc<SchedulingManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut epochs = manager.ctx.types.subscribe();
        loop {
            manager.enqueue_all();
            tokio::select! {
                _ = manager.cancel.cancelled() => break,
                changed = epochs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        manager.queue.shutdown();
    })
}

impl SchedulingManager {
    fn view(&self) -> MutexGuard<'_, View> { self.view.lock().unwrap_or_else(|p| p.into_inner()) }

    fn enqueue_all(&self) {
        let mut names: BTreeSet<String> = self.ctx.types.current().keys().cloned().collect();
        names.extend(self.view().types.keys().cloned());
        for n in names {
            self.queue.add(n);
        }
    }

    fn wants(&self, tc: &TypeConfig) -> bool { tc.scheduling_kind().is_some() || self.ctx.options.manage_unscheduled_types }

    fn set_state(&self, tc: &TypeConfig, state: TypeState, last_error: Option<String>) {
        let status = TypeStatus {
            name: tc.name.clone(),
            state,
            scheduling_kind: tc.scheduling_kind().map(|k| k.kind),
            last_error,
        };
        let mut view = self.view();
        if state == TypeState::Absent && status.last_error.is_none() {
            view.types.remove(&tc.name);
        } else {
            view.types.insert(tc.name.clone(), status);
        }
        let running = view.types.values().filter(|s| s.state == TypeState::Running).count();
        drop(view);
        gauge!("manager_running_types", running as f64);
        counter!("manager_transitions_total", 1u64, "to" => state_label(state));
        debug!(type_config = %tc.name, ?state, "type transition");
    }

    fn set_plugins(&self, kind: &str, plugins: Vec<String>) {
        let mut view = self.view();
        if plugins.is_empty() {
            view.schedulers.remove(kind);
        } else {
            view.schedulers.insert(kind.to_string(), plugins.into_iter().collect());
        }
    }

    /// Whether a scheduler for `scheduling_kind` runs with an active plugin
    /// for `type_name`, and the type's sync controller is up.
    pub fn is_running(&self, scheduling_kind: &str, type_name: &str) -> bool {
        let view = self.view();
        let plugged = view.schedulers.get(scheduling_kind).map(|p| p.contains(type_name)).unwrap_or(false);
        plugged && view.types.get(type_name).map(|s| s.state == TypeState::Running).unwrap_or(false)
    }

    pub fn scheduler_state(&self, scheduling_kind: &str) -> Option<SchedulerStatus> {
        self.view()
            .schedulers
            .get(scheduling_kind)
            .map(|p| SchedulerStatus { kind: scheduling_kind.to_string(), plugins: p.iter().cloned().collect() })
    }

    pub fn type_state(&self, type_name: &str) -> TypeState {
        self.view().types.get(type_name).map(|s| s.state).unwrap_or(TypeState::Absent)
    }

    pub fn type_status(&self, type_name: &str) -> Option<TypeStatus> { self.view().types.get(type_name).cloned() }

    pub fn types(&self) -> Vec<TypeStatus> { self.view().types.values().cloned().collect() }

    /// Stop following the registry and tear every controller pair down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "manager task panicked");
            }
        }
        let mut controllers = self.controllers.lock().await;
        let names: Vec<String> = controllers.types.keys().cloned().collect();
        for name in names {
            self.stop_type(&mut controllers, &name).await;
        }
        info!("scheduling manager stopped");
    }

    async fn converge(&self, name: &str) -> FedResult<()> {
        let desired = self.ctx.types.get(name).filter(|tc| self.wants(tc));
        let mut controllers = self.controllers.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let running = controllers.types.get(name).map(|r| r.tc.clone());
        match (running, desired) {
            (None, None) => {
                self.view().types.remove(name);
                Ok(())
            }
            (Some(cur), Some(want)) if cur == want => Ok(()),
            (Some(_), desired) => {
                self.stop_type(&mut controllers, name).await;
                match desired {
                    Some(want) => self.start_type(&mut controllers, &want).await,
                    None => Ok(()),
                }
            }
            (None, Some(want)) => self.start_type(&mut controllers, &want).await,
        }
    }

    async fn start_type(&self, controllers: &mut Controllers, tc: &TypeConfig) -> FedResult<()> {
        self.set_state(tc, TypeState::Starting, None);
        let sync = match start_sync_controller(&self.ctx.sync, tc, self.cancel.clone()).await {
            Ok(h) => h,
            Err(e) => {
                self.set_state(tc, TypeState::Absent, Some(e.to_string()));
                return Err(e);
            }
        };
        if let Err(e) = self.attach_plugin(controllers, tc).await {
            sync.stop().await;
            self.set_state(tc, TypeState::Absent, Some(e.to_string()));
            return Err(e);
        }
        controllers.types.insert(tc.name.clone(), RunningType { tc: tc.clone(), sync });
        self.set_state(tc, TypeState::Running, None);
        info!(type_config = %tc.name, scheduling_kind = ?tc.scheduling_preference_kind, "type running");
        Ok(())
    }

    async fn attach_plugin(&self, controllers: &mut Controllers, tc: &TypeConfig) -> FedResult<()> {
        let Some(kind) = tc.scheduling_kind() else { return Ok(()) };
        if !controllers.schedulers.contains_key(&kind.kind) {
            let handle = start_scheduler(
                Arc::clone(&self.ctx.sync.host),
                kind.clone(),
                Arc::clone(&self.ctx.sync.clusters),
                self.ctx.scheduler_config(),
                self.cancel.clone(),
            )
            .await?;
            controllers.schedulers.insert(kind.kind.clone(), handle);
        }
        let Some(scheduler) = controllers.schedulers.get(&kind.kind) else { return Ok(()) };
        let added = scheduler.add_plugin(tc).await;
        let plugins = scheduler.plugin_names();
        if plugins.is_empty() {
            if let Some(idle) = controllers.schedulers.remove(&kind.kind) {
                idle.stop().await;
            }
        }
        self.set_plugins(&kind.kind, plugins);
        added
    }

    /// Fence the plugin, stop the sync controller and wait for both to drain.
    async fn stop_type(&self, controllers: &mut Controllers, name: &str) {
        let Some(running) = controllers.types.remove(name) else { return };
        self.set_state(&running.tc, TypeState::Stopping, None);
        if let Some(kind) = running.tc.scheduling_kind() {
            if let Some(scheduler) = controllers.schedulers.get(&kind.kind) {
                scheduler.remove_plugin(name).await;
                let plugins = scheduler.plugin_names();
                if plugins.is_empty() {
                    if let Some(idle) = controllers.schedulers.remove(&kind.kind) {
                        idle.stop().await;
                    }
                }
                self.set_plugins(&kind.kind, plugins);
            }
        }
        running.sync.stop().await;
        self.set_state(&running.tc, TypeState::Absent, None);
        info!(type_config = %name, "type stopped");
    }
}

fn state_label(state: TypeState) -> &'static str {
    match state {
        TypeState::Absent => "absent",
        TypeState::Starting => "starting",
        TypeState::Running => "running",
        TypeState::Stopping => "stopping",
    }
}

#[async_trait]
impl Reconciler for SchedulingManager {
    async fn reconcile(&self, key: &str) -> Requeue {
        match self.converge(key).await {
            Ok(()) => Requeue::Done,
            Err(e) => {
                warn!(type_config = %key, error = %e, "starting controllers failed; will retry");
                counter!("manager_start_failures_total", 1u64);
                Requeue::Backoff
            }
        }
    }
}
