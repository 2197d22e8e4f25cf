//! Cluster client seam. The kube-backed implementation lives in
//! `tidepool-kubehub`; tests use an in-memory one.

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tidepool_core::ResourceId;
use tidepool_patch::PatchType;

/// Typed failures of a single cluster call.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict: {0}")]
    Conflict(String),
    /// The server does not accept this patch type for the resource (HTTP 415).
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The cluster operations the applier needs. Retrying on conflict is the
/// implementation's business.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, ClusterError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Send one patch document as a single atomic call.
    async fn patch(&self, id: &ResourceId, patch_type: PatchType, patch: &Json) -> Result<DynamicObject, ClusterError>;

    /// Delete with background propagation.
    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError>;
}
