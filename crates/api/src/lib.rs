//! kfed in-process API.
//!
//! Library entry points the controller binary (and embedders) depend on:
//! [`start_sync_controller`] for a single federated type and
//! [`start_scheduling_manager`] for the registry-driven lifecycle of every
//! scheduler and sync controller pair, plus serializable status views.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kfed_schedule::SchedulerConfig;
use kfed_schema::TypeRegistry;
use kfed_store::Backoff;
use kfed_sync::SyncContext;

mod manager;

pub use kfed_sync::{start_sync_controller, SyncConfig, SyncHandle};
pub use manager::{start_scheduling_manager, SchedulingManager};

fn env_u64(key: &str, default: u64) -> u64 { std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default) }

/// Knobs for the scheduling manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Also run sync-only controllers for types without a preference kind.
    pub manage_unscheduled_types: bool,
    pub scheduler_workers: usize,
    /// Retry pacing for types whose controllers failed to start.
    pub start_backoff: Backoff,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            manage_unscheduled_types: false,
            scheduler_workers: 2,
            start_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
        }
    }
}

impl ManagerOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            manage_unscheduled_types: std::env::var("KFED_MANAGE_UNSCHEDULED_TYPES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(d.manage_unscheduled_types),
            scheduler_workers: env_u64("KFED_SCHEDULER_WORKERS", d.scheduler_workers as u64).max(1) as usize,
            start_backoff: Backoff::new(
                Duration::from_millis(env_u64("KFED_START_BACKOFF_BASE_MS", 500)),
                Duration::from_secs(env_u64("KFED_START_BACKOFF_MAX_SECS", 60)),
            ),
        }
    }
}

/// Everything the manager needs to build per-type controllers.
#[derive(Clone)]
pub struct ControllerContext {
    pub sync: SyncContext,
    pub types: Arc<TypeRegistry>,
    pub options: ManagerOptions,
}

impl ControllerContext {
    pub(crate) fn scheduler_config(&self) -> SchedulerConfig {
        let sync = &self.sync.config;
        SchedulerConfig {
            namespace: sync.federation_namespace.clone(),
            workers: self.options.scheduler_workers,
            backoff: sync.backoff,
            config_error_delay: sync.config_error_delay,
        }
    }
}

/// Lifecycle of one federated type's controller pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeState {
    Absent,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatus {
    pub name: String,
    pub state: TypeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_kind: Option<String>,
    /// Last start failure; cleared once the type runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A running scheduler and the types it holds plugins for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub kind: String,
    pub plugins: Vec<String>,
}
