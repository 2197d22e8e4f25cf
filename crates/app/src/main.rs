use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::core::DynamicObject;
use tidepool_apply::config::env_or;
use tidepool_apply::{ApplyConfig, ApplyContext, Applier, ClusterClient, Reconciler};
use tidepool_core::{Diff, GroupKind, ResourceId};
use tidepool_kubehub::KubeClusterClient;
use tidepool_schema::BuiltinSchemas;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod manifests;

use manifests::Group;

fn init_tracing() {
    let env = std::env::var("TIDEPOOL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TIDEPOOL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TIDEPOOL_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    manifest_dir: PathBuf,
    resync: Duration,
    sync_token: Option<String>,
    apply: ApplyConfig,
}

impl AppConfig {
    fn from_env() -> Self {
        let resync_secs: u64 = env_or("TIDEPOOL_RESYNC_SECS", 30);
        Self {
            manifest_dir: PathBuf::from(env_or("TIDEPOOL_MANIFEST_DIR", "manifests".to_string())),
            resync: Duration::from_secs(resync_secs.max(1)),
            sync_token: std::env::var("TIDEPOOL_SYNC_TOKEN").ok().filter(|t| !t.is_empty()),
            apply: ApplyConfig::from_env(),
        }
    }
}

/// Pair a group's declared objects with their live counterparts. Live objects
/// that carry the owner label but are no longer declared become deletion
/// (or unmanage) candidates. Orphans are matched by namespace/name only, so a
/// declared object counts as present whatever version it names; each one is
/// read back at its own version.
async fn build_diffs(kube: &KubeClusterClient, group: &Group) -> Result<Vec<Diff>> {
    let live = kube.list_managed(&group.gvk, group.namespace.as_deref()).await?;
    let mut orphans: BTreeMap<(Option<String>, String), DynamicObject> = BTreeMap::new();
    for obj in live {
        let id = ResourceId::of(&obj)?;
        // cluster-wide listing of a namespaced kind: keep to the group's scope
        if group.namespace.is_some() && id.namespace != group.namespace {
            continue;
        }
        orphans.insert((id.namespace, id.name), obj);
    }

    let mut diffs = Vec::with_capacity(group.declared.len() + orphans.len());
    for declared in &group.declared {
        let id = ResourceId::of(declared)?;
        orphans.remove(&(id.namespace.clone(), id.name.clone()));
        let current = kube.get(&id).await.with_context(|| format!("reading {}", id))?;
        diffs.push(Diff::new(Some(declared.clone()), current)?);
    }
    for (_, obj) in orphans {
        diffs.push(Diff::new(None, Some(obj))?);
    }
    Ok(diffs)
}

async fn reconcile_group(kube: Arc<KubeClusterClient>, reconciler: Arc<Reconciler>, ctx: ApplyContext, group: Group) {
    let kind = GroupKind { group: group.gvk.group.clone(), kind: group.gvk.kind.clone() };
    let label = format!("{} {}", kind, group.namespace.as_deref().unwrap_or("<cluster>"));
    let diffs = match build_diffs(&kube, &group).await {
        Ok(d) => d,
        Err(e) => {
            error!(group = %label, error = ?e, "building diffs failed");
            return;
        }
    };
    let summary = reconciler.reconcile(&ctx, diffs).await;
    if !summary.is_clean() {
        warn!(group = %label, errors = summary.errors.len(), changed = summary.changed(), "group reconciled with errors");
    }
}

/// One pass: load manifests, then reconcile every kind/namespace group on its
/// own task. Groups are independent; a failing group does not stop the rest.
async fn run_pass(cfg: &AppConfig, kube: &Arc<KubeClusterClient>, reconciler: &Arc<Reconciler>, cancel: &CancellationToken) -> Result<()> {
    let declared = manifests::load_dir(&cfg.manifest_dir)
        .with_context(|| format!("loading manifests from {}", cfg.manifest_dir.display()))?;
    let groups = manifests::group(declared)?;
    info!(groups = groups.len(), "reconcile pass started");

    let ctx = ApplyContext::new().with_cancellation(cancel.child_token()).with_timeout(cfg.resync);
    let mut tasks = Vec::with_capacity(groups.len());
    for (_, group) in groups {
        tasks.push(tokio::spawn(reconcile_group(kube.clone(), reconciler.clone(), ctx.clone(), group)));
    }
    for t in tasks {
        if let Err(e) = t.await {
            error!(error = %e, "reconcile task panicked");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cfg = AppConfig::from_env();
    info!(dir = %cfg.manifest_dir.display(), resync_secs = cfg.resync.as_secs(), field_manager = %cfg.apply.field_manager, "tidepool starting");

    let client = tidepool_kubehub::get_kube_client().await?;
    let kube = Arc::new(KubeClusterClient::new(client, cfg.apply.field_manager.clone()));
    let fights = Arc::new(cfg.apply.fight_monitor());
    let applier = Arc::new(Applier::new(kube.clone(), Arc::new(BuiltinSchemas::new()), fights));
    let mut reconciler = Reconciler::new(applier);
    if let Some(token) = &cfg.sync_token {
        reconciler = reconciler.with_sync_token(token.clone());
    }
    let reconciler = Arc::new(reconciler);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    let mut tick = tokio::time::interval(cfg.resync);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = run_pass(&cfg, &kube, &reconciler, &cancel).await {
                    error!(error = ?e, "reconcile pass failed");
                }
            }
        }
    }
    info!("tidepool stopped");
    Ok(())
}
