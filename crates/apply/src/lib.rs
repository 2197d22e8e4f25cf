//! Tidepool apply: drive create/update/delete of declared objects against the
//! cluster, and report every write to the fight monitor.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tidepool_core::management::management_removal_patch;
use tidepool_core::ResourceId;
use tidepool_fight::FightMonitor;
use tidepool_patch::{calculate, stamp_last_applied, PatchPlan, PatchType};
use tidepool_schema::SchemaSource;
use tracing::{debug, info};

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod reconcile;

pub use client::{ClusterClient, ClusterError};
pub use config::ApplyConfig;
pub use context::ApplyContext;
pub use error::{ApplyError, Result};
pub use reconcile::{ReconcileSummary, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Update,
    Delete,
    Unmanage,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Unmanage => "unmanage",
        }
    }
}

/// Executes single-object changes. One instance is shared by every reconcile
/// worker; it holds no per-call state.
pub struct Applier {
    client: Arc<dyn ClusterClient>,
    schemas: Arc<dyn SchemaSource>,
    fights: Arc<FightMonitor>,
}

impl Applier {
    pub fn new(client: Arc<dyn ClusterClient>, schemas: Arc<dyn SchemaSource>, fights: Arc<FightMonitor>) -> Self {
        Self { client, schemas, fights }
    }

    pub fn fights(&self) -> &FightMonitor { &self.fights }

    /// Create `declared`, stamped with its last-applied annotation.
    pub async fn create(&self, ctx: &ApplyContext, declared: &DynamicObject) -> Result<bool> {
        let started = Instant::now();
        let id = identify(Operation::Create, declared, started)?;
        let res = self.create_inner(ctx, &id, declared).await;
        observe(Operation::Create, &id, started, &res);
        res
    }

    async fn create_inner(&self, ctx: &ApplyContext, id: &ResourceId, declared: &DynamicObject) -> Result<bool> {
        let mut obj = declared.clone();
        stamp_last_applied(&mut obj).map_err(|source| ApplyError::Patch { id: id.clone(), source })?;
        ctx.check().map_err(|reason| ApplyError::Cancelled { id: id.clone(), reason })?;
        self.client
            .create(&obj)
            .await
            .map_err(|source| ApplyError::Create { id: id.clone(), source })?;
        info!(resource = %id, "created");
        self.mark_mutated(id);
        Ok(true)
    }

    /// Patch `live` toward `declared`. Returns whether the live object changed.
    pub async fn update(&self, ctx: &ApplyContext, declared: &DynamicObject, live: &DynamicObject) -> Result<bool> {
        let started = Instant::now();
        let mut id = identify(Operation::Update, declared, started)?;
        if id.namespace.is_none() {
            id.namespace = live.metadata.namespace.clone();
        }
        let res = self.update_inner(ctx, &id, declared, live).await;
        observe(Operation::Update, &id, started, &res);
        res
    }

    async fn update_inner(&self, ctx: &ApplyContext, id: &ResourceId, declared: &DynamicObject, live: &DynamicObject) -> Result<bool> {
        if let Some(schema) = self.schemas.lookup_resource(&id.gvk) {
            let plan = calculate(declared, live, Some(schema.as_ref()))
                .map_err(|source| ApplyError::Patch { id: id.clone(), source })?;
            match self.send_patch(ctx, id, &plan).await {
                Err(ApplyError::Update { source: ClusterError::UnsupportedMediaType(msg), .. }) => {
                    debug!(resource = %id, reason = %msg, "structural patch rejected; falling back to merge patch");
                    counter!("tidepool_patch_fallback_total", 1u64, "kind" => id.gvk.kind.clone());
                }
                other => return other,
            }
        }
        let plan = calculate(declared, live, None).map_err(|source| ApplyError::Patch { id: id.clone(), source })?;
        self.send_patch(ctx, id, &plan).await
    }

    async fn send_patch(&self, ctx: &ApplyContext, id: &ResourceId, plan: &PatchPlan) -> Result<bool> {
        if plan.no_op {
            debug!(resource = %id, "unchanged");
            return Ok(false);
        }
        ctx.check().map_err(|reason| ApplyError::Cancelled { id: id.clone(), reason })?;
        self.client
            .patch(id, plan.patch_type, &plan.body)
            .await
            .map_err(|source| ApplyError::Update { id: id.clone(), source })?;
        info!(resource = %id, patch_type = plan.patch_type.as_str(), "updated");
        self.mark_mutated(id);
        Ok(true)
    }

    /// Delete `live` with background propagation. An object that is already
    /// gone counts as converged: `Ok(false)`.
    pub async fn delete(&self, ctx: &ApplyContext, live: &DynamicObject) -> Result<bool> {
        let started = Instant::now();
        let id = identify(Operation::Delete, live, started)?;
        let res = self.delete_inner(ctx, &id).await;
        observe(Operation::Delete, &id, started, &res);
        res
    }

    async fn delete_inner(&self, ctx: &ApplyContext, id: &ResourceId) -> Result<bool> {
        ctx.check().map_err(|reason| ApplyError::Cancelled { id: id.clone(), reason })?;
        match self.client.delete(id).await {
            Ok(()) => {
                info!(resource = %id, "deleted");
                self.mark_mutated(id);
                Ok(true)
            }
            Err(ClusterError::NotFound) => {
                debug!(resource = %id, "already deleted");
                Ok(false)
            }
            Err(source) => Err(ApplyError::Delete { id: id.clone(), source }),
        }
    }

    /// Strip Tidepool's ownership metadata from `live`, leaving everything else.
    pub async fn remove_management(&self, ctx: &ApplyContext, live: &DynamicObject) -> Result<bool> {
        let started = Instant::now();
        let id = identify(Operation::Unmanage, live, started)?;
        let res = self.unmanage_inner(ctx, &id, live).await;
        observe(Operation::Unmanage, &id, started, &res);
        res
    }

    async fn unmanage_inner(&self, ctx: &ApplyContext, id: &ResourceId, live: &DynamicObject) -> Result<bool> {
        let Some(patch) = management_removal_patch(live) else { return Ok(false) };
        ctx.check().map_err(|reason| ApplyError::Cancelled { id: id.clone(), reason })?;
        match self.client.patch(id, PatchType::Merge, &patch).await {
            Ok(_) => {
                info!(resource = %id, "management removed");
                self.mark_mutated(id);
                Ok(true)
            }
            Err(ClusterError::NotFound) => Ok(false),
            Err(source) => Err(ApplyError::Unmanage { id: id.clone(), source }),
        }
    }

    fn mark_mutated(&self, id: &ResourceId) {
        let report = self.fights.detect(Instant::now(), &id.fight_key());
        if report.fighting && !report.logged {
            debug!(resource = %id, heat = report.heat, "fight ongoing");
        }
    }
}

/// Kind label for calls whose object has no usable identity.
const UNKNOWN_KIND: &str = "unknown";

/// Identity of the object an operation acts on. A failure is still counted.
fn identify(op: Operation, obj: &DynamicObject, started: Instant) -> Result<ResourceId> {
    let id = ResourceId::of(obj).map_err(ApplyError::from);
    if id.is_err() {
        record(op, UNKNOWN_KIND.to_string(), started, "error");
    }
    id
}

fn outcome(res: &Result<bool>) -> &'static str {
    match res {
        Ok(true) => "changed",
        Ok(false) => "unchanged",
        Err(ApplyError::Cancelled { .. }) => "cancelled",
        Err(_) => "error",
    }
}

fn observe(op: Operation, id: &ResourceId, started: Instant, res: &Result<bool>) {
    record(op, id.gvk.kind.clone(), started, outcome(res));
}

fn record(op: Operation, kind: String, started: Instant, status: &'static str) {
    counter!(
        "tidepool_apply_operations_total", 1u64,
        "operation" => op.as_str(), "kind" => kind.clone(), "status" => status
    );
    histogram!(
        "tidepool_apply_duration_seconds", started.elapsed().as_secs_f64(),
        "operation" => op.as_str(), "kind" => kind
    );
}
