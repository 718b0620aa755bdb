//! kfed-controller: runs the scheduling manager against a host cluster and a
//! set of member clusters.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use metrics::gauge;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kfed_api::{start_scheduling_manager, ControllerContext, ManagerOptions, SyncConfig};
use kfed_kubehub::{ClientFactory, ClusterRegistry, ClusterSnapshot, KubeClientFactory};
use kfed_persist::{SqliteVersionStore, VersionBackend};
use kfed_schema::{load_type_configs, type_config_kind, TypeRegistry};
use kfed_sync::SyncContext;

#[derive(Parser, Debug)]
#[command(name = "kfed-controller", version, about = "Federation control plane: scheduling and propagation")]
struct Cli {
    /// YAML list of member clusters (`name`, `context`, optional `labels`)
    #[arg(long = "clusters", env = "KFED_CLUSTERS_FILE")]
    clusters: String,

    /// YAML type configs; when unset, FederatedTypeConfig objects in the host cluster are followed
    #[arg(long = "types", env = "KFED_TYPES_FILE")]
    types: Option<String>,

    /// Kubeconfig context of the host cluster (default: ambient config)
    #[arg(long = "host-context", env = "KFED_HOST_CONTEXT")]
    host_context: Option<String>,

    /// Where propagated versions are recorded
    #[arg(long = "version-backend", env = "KFED_VERSION_BACKEND", value_enum, default_value_t = Backend::Api)]
    version_backend: Backend,

    /// Seconds between member cluster health probes
    #[arg(long = "probe-interval", env = "KFED_PROBE_INTERVAL_SECS", default_value_t = 10)]
    probe_interval_secs: u64,

    /// Also propagate types that have no scheduling preference kind
    #[arg(long = "manage-unscheduled-types", env = "KFED_MANAGE_UNSCHEDULED_TYPES", action = ArgAction::Set, default_value_t = true)]
    manage_unscheduled_types: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Api,
    Sqlite,
}

#[derive(Debug, Deserialize)]
struct MemberCluster {
    name: String,
    /// Kubeconfig context; defaults to the cluster name.
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

fn init_tracing() {
    let env = std::env::var("KFED_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KFED_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KFED_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_clusters(path: &str) -> Result<Vec<MemberCluster>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading clusters from {}", path))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing clusters in {}", path))
}

/// Connect to every member once, then keep ready flags current. Members that
/// fail to connect stay unregistered and are retried on the next tick.
async fn run_cluster_probes(members: Vec<MemberCluster>, registry: Arc<ClusterRegistry>, every: Duration, cancel: CancellationToken) {
    let mut clients: BTreeMap<String, Arc<KubeClientFactory>> = BTreeMap::new();
    loop {
        for m in &members {
            let client = match clients.get(&m.name) {
                Some(c) => Arc::clone(c),
                None => {
                    let context = m.context.as_deref().unwrap_or(&m.name);
                    match KubeClientFactory::from_context(context).await {
                        Ok(c) => {
                            let c = Arc::new(c);
                            clients.insert(m.name.clone(), Arc::clone(&c));
                            c
                        }
                        Err(e) => {
                            warn!(cluster = %m.name, context, error = %e, "connecting to member cluster failed");
                            continue;
                        }
                    }
                }
            };
            let ready = matches!(tokio::time::timeout(every, client.probe()).await, Ok(Ok(_)));
            let known = registry.current().get(&m.name).map(|c| c.ready);
            match known {
                None => {
                    let snapshot = ClusterSnapshot::new(&m.name, ready, Arc::clone(&client) as Arc<dyn ClientFactory>)
                        .with_labels(m.labels.clone());
                    registry.upsert(snapshot);
                    info!(cluster = %m.name, ready, "member cluster joined");
                }
                Some(was) if was != ready => {
                    registry.set_ready(&m.name, ready);
                    info!(cluster = %m.name, ready, "member cluster readiness changed");
                }
                Some(_) => {}
            }
        }
        gauge!("clusters_ready", registry.current().ready_names().len() as f64);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let host = match cli.host_context.as_deref() {
        Some(ctx) => KubeClientFactory::from_context(ctx).await,
        None => KubeClientFactory::try_default().await,
    }
    .context("connecting to host cluster")?;
    let host: Arc<dyn ClientFactory> = Arc::new(host);

    let config = SyncConfig::from_env();
    let versions = match cli.version_backend {
        Backend::Api => VersionBackend::Api(Arc::clone(&host)),
        Backend::Sqlite => VersionBackend::Sqlite(Arc::new(SqliteVersionStore::open_default()?)),
    };
    info!(backend = ?cli.version_backend, namespace = ?config.federation_namespace, workers = config.workers, "starting kfed-controller");

    let stop = CancellationToken::new();
    let clusters = Arc::new(ClusterRegistry::new());
    let members = load_clusters(&cli.clusters)?;
    info!(count = members.len(), "member clusters configured");
    let probes = tokio::spawn(run_cluster_probes(
        members,
        Arc::clone(&clusters),
        Duration::from_secs(cli.probe_interval_secs.max(1)),
        stop.clone(),
    ));

    let types = Arc::new(TypeRegistry::new());
    let type_watch = match cli.types.as_deref() {
        Some(path) => {
            let configs = load_type_configs(path)?;
            info!(count = configs.len(), path, "type configs loaded");
            types.replace_all(configs);
            None
        }
        None => {
            let client = host.client_for(&type_config_kind()).await.context("resolving FederatedTypeConfig kind")?;
            Some(tokio::spawn(Arc::clone(&types).run_watch(client, config.federation_namespace.clone(), stop.clone())))
        }
    };

    let options = ManagerOptions { manage_unscheduled_types: cli.manage_unscheduled_types, ..ManagerOptions::from_env() };
    let ctx = ControllerContext {
        sync: SyncContext { host, clusters, versions, config },
        types,
        options,
    };
    let manager = start_scheduling_manager(ctx, stop.clone());

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    stop.cancel();
    manager.shutdown().await;
    for task in std::iter::once(probes).chain(type_watch) {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }
    info!("kfed-controller stopped");
    Ok(())
}
