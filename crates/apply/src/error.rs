use tidepool_core::{CoreError, ResourceId};
use tidepool_patch::PatchError;

use crate::client::ClusterError;

pub type Result<T> = std::result::Result<T, ApplyError>;

/// Errors returned by the applier; all of them name the resource involved.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("invalid object: {0}")]
    Object(#[from] CoreError),
    #[error("computing patch for {id}: {source}")]
    Patch { id: ResourceId, #[source] source: PatchError },
    #[error("creating {id}: {source}")]
    Create { id: ResourceId, #[source] source: ClusterError },
    #[error("patching {id}: {source}")]
    Update { id: ResourceId, #[source] source: ClusterError },
    #[error("deleting {id}: {source}")]
    Delete { id: ResourceId, #[source] source: ClusterError },
    #[error("removing management from {id}: {source}")]
    Unmanage { id: ResourceId, #[source] source: ClusterError },
    #[error("{id}: {reason}; skipped")]
    Cancelled { id: ResourceId, reason: &'static str },
    #[error("{id} is declared but its live management annotation is {value:?}; fix the annotation or the declaration")]
    InvalidManagement { id: ResourceId, value: String },
}

impl ApplyError {
    pub fn resource(&self) -> Option<&ResourceId> {
        match self {
            ApplyError::Object(_) => None,
            ApplyError::Patch { id, .. }
            | ApplyError::Create { id, .. }
            | ApplyError::Update { id, .. }
            | ApplyError::Delete { id, .. }
            | ApplyError::Unmanage { id, .. }
            | ApplyError::Cancelled { id, .. }
            | ApplyError::InvalidManagement { id, .. } => Some(id),
        }
    }
}
