//! Tidepool core types: resource identity, fight keys, and the pure pieces of
//! reconciliation (management protocol + diff classifier).

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub mod diff;
pub mod management;

pub use diff::{classify, Diff, DiffType};
pub use management::Ownership;

/// Errors raised while reading identity out of an object.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("diff has neither a declared nor a live object")]
    EmptyDiff,
    #[error("declared {declared} does not match live {live}")]
    MismatchedPair { declared: ResourceId, live: ResourceId },
}

/// Split an `apiVersion` into `(group, version)`; core types have an empty group.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Read the GVK carried in an object's type metadata.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, CoreError> {
    let types = obj.types.as_ref().ok_or(CoreError::MissingField("apiVersion/kind"))?;
    if types.api_version.is_empty() {
        return Err(CoreError::MissingField("apiVersion"));
    }
    if types.kind.is_empty() {
        return Err(CoreError::MissingField("kind"));
    }
    let (group, version) = split_api_version(&types.api_version);
    Ok(GroupVersionKind { group, version, kind: types.kind.clone() })
}

/// Render a GVK as `group/version/Kind` (or `version/Kind` for the core group).
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Full identity of a cluster object. Every error leaving the apply engine is
/// wrapped with one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn of(obj: &DynamicObject) -> Result<Self, CoreError> {
        let gvk = gvk_of(obj)?;
        let name = obj.metadata.name.clone().ok_or(CoreError::MissingField("metadata.name"))?;
        Ok(Self { gvk, namespace: obj.metadata.namespace.clone(), name })
    }

    pub fn fight_key(&self) -> FightKey {
        FightKey {
            group_kind: GroupKind { group: self.gvk.group.clone(), kind: self.gvk.kind.clone() },
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", gvk_key(&self.gvk), ns, self.name),
            None => write!(f, "{} {}", gvk_key(&self.gvk), self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Thrashing identity of a resource. Ignores the API version so that two
/// controllers writing different versions of one object still collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FightKey {
    pub group_kind: GroupKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl FightKey {
    pub fn new(group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group_kind: GroupKind { group: group.to_string(), kind: kind.to_string() },
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for FightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.group_kind, ns, self.name),
            None => write!(f, "{} {}", self.group_kind, self.name),
        }
    }
}
