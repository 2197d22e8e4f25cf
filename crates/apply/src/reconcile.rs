//! One reconcile pass over the diffs of a single kind/namespace.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tidepool_core::management::{enable_management, set_sync_token, MANAGED_ANNOTATION};
use tidepool_core::{classify, Diff, DiffType, ResourceId};
use tracing::{info, warn};

use crate::{ApplyContext, ApplyError, Applier};

/// Counts of what one pass did. Errors do not stop a pass; they are collected.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unmanaged: usize,
    pub unchanged: usize,
    pub errors: Vec<ApplyError>,
}

impl ReconcileSummary {
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted + self.unmanaged
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Updated,
    Deleted,
    Unmanaged,
    Unchanged,
}

/// Applies diffs in order, one at a time, so that writes to a given object
/// are always issued in a deterministic sequence.
pub struct Reconciler {
    applier: Arc<Applier>,
    sync_token: Option<String>,
}

impl Reconciler {
    pub fn new(applier: Arc<Applier>) -> Self {
        Self { applier, sync_token: None }
    }

    /// Stamp every declared object written in this pass with `token`.
    pub fn with_sync_token(mut self, token: impl Into<String>) -> Self {
        self.sync_token = Some(token.into());
        self
    }

    pub async fn reconcile(&self, ctx: &ApplyContext, diffs: Vec<Diff>) -> ReconcileSummary {
        let started = Instant::now();
        let mut summary = ReconcileSummary::default();
        for diff in diffs {
            match self.apply_one(ctx, diff).await {
                Ok(Outcome::Created) => summary.created += 1,
                Ok(Outcome::Updated) => summary.updated += 1,
                Ok(Outcome::Deleted) => summary.deleted += 1,
                Ok(Outcome::Unmanaged) => summary.unmanaged += 1,
                Ok(Outcome::Unchanged) => summary.unchanged += 1,
                Err(e) => {
                    warn!(error = %e, "reconcile step failed");
                    summary.errors.push(e);
                }
            }
        }
        histogram!("tidepool_reconcile_duration_seconds", started.elapsed().as_secs_f64());
        counter!("tidepool_reconcile_errors_total", summary.errors.len() as u64);
        info!(
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            unmanaged = summary.unmanaged,
            unchanged = summary.unchanged,
            errors = summary.errors.len(),
            "reconcile pass finished"
        );
        summary
    }

    async fn apply_one(&self, ctx: &ApplyContext, diff: Diff) -> Result<Outcome, ApplyError> {
        let diff_type = classify(&diff);
        match (diff_type, diff.declared, diff.live) {
            (DiffType::NoOp, _, _) => Ok(Outcome::Unchanged),
            (DiffType::Create, Some(mut declared), None) => {
                self.prepare(&mut declared);
                self.applier.create(ctx, &declared).await?;
                Ok(Outcome::Created)
            }
            (DiffType::Update, Some(mut declared), Some(live)) => {
                self.prepare(&mut declared);
                match self.applier.update(ctx, &declared, &live).await? {
                    true => Ok(Outcome::Updated),
                    false => Ok(Outcome::Unchanged),
                }
            }
            (DiffType::Delete, None, Some(live)) => match self.applier.delete(ctx, &live).await? {
                true => Ok(Outcome::Deleted),
                false => Ok(Outcome::Unchanged),
            },
            (DiffType::Unmanage, None, Some(live)) => match self.applier.remove_management(ctx, &live).await? {
                true => Ok(Outcome::Unmanaged),
                false => Ok(Outcome::Unchanged),
            },
            (DiffType::Error, Some(_), Some(live)) => {
                let id = ResourceId::of(&live)?;
                let value = live
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(MANAGED_ANNOTATION))
                    .cloned()
                    .unwrap_or_default();
                Err(ApplyError::InvalidManagement { id, value })
            }
            (t, declared, live) => unreachable!(
                "classifier returned {:?} for declared={} live={}",
                t,
                declared.is_some(),
                live.is_some()
            ),
        }
    }

    fn prepare(&self, declared: &mut kube::core::DynamicObject) {
        enable_management(declared);
        if let Some(token) = &self.sync_token {
            set_sync_token(declared, token);
        }
    }
}
