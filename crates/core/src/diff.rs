//! Diff classification: what to do with a declared/live pair.

use kube::core::{DynamicObject, GroupVersionKind};

use crate::management::{classify_ownership, Ownership};
use crate::{CoreError, ResourceId};

/// Action the applier should take for one [`Diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffType {
    NoOp,
    Create,
    Update,
    Delete,
    /// Strip ownership metadata from the live object and leave it in place.
    Unmanage,
    /// Live object carries an invalid management annotation while still declared.
    Error,
}

impl DiffType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffType::NoOp => "noop",
            DiffType::Create => "create",
            DiffType::Update => "update",
            DiffType::Delete => "delete",
            DiffType::Unmanage => "unmanage",
            DiffType::Error => "error",
        }
    }
}

/// A declared object paired with the live object of the same identity.
#[derive(Debug, Clone)]
pub struct Diff {
    pub gvk: GroupVersionKind,
    pub name: String,
    pub declared: Option<DynamicObject>,
    pub live: Option<DynamicObject>,
}

impl Diff {
    /// Pair up a declared and a live object. At least one must be present, and
    /// when both are they must name the same object.
    pub fn new(declared: Option<DynamicObject>, live: Option<DynamicObject>) -> Result<Self, CoreError> {
        let id = match (&declared, &live) {
            (Some(d), Some(l)) => {
                let did = ResourceId::of(d)?;
                let lid = ResourceId::of(l)?;
                if did.gvk.group != lid.gvk.group
                    || did.gvk.kind != lid.gvk.kind
                    || did.name != lid.name
                    || (did.namespace.is_some() && did.namespace != lid.namespace)
                {
                    return Err(CoreError::MismatchedPair { declared: did, live: lid });
                }
                did
            }
            (Some(d), None) => ResourceId::of(d)?,
            (None, Some(l)) => ResourceId::of(l)?,
            (None, None) => return Err(CoreError::EmptyDiff),
        };
        Ok(Self { gvk: id.gvk, name: id.name, declared, live })
    }

    pub fn diff_type(&self) -> DiffType {
        classify(self)
    }
}

/// Decide the action for a diff. Pure and deterministic.
///
/// An invalid management annotation is handled asymmetrically: a declared
/// object is never overwritten (surfaced as [`DiffType::Error`]), while an
/// undeclared one is never deleted (only unmanaged).
pub fn classify(diff: &Diff) -> DiffType {
    match (&diff.declared, &diff.live) {
        (Some(_), None) => DiffType::Create,
        (Some(_), Some(live)) => match classify_ownership(live) {
            Ownership::Managed | Ownership::Unmanaged => DiffType::Update,
            Ownership::Invalid => DiffType::Error,
        },
        (None, Some(live)) => match classify_ownership(live) {
            Ownership::Managed => DiffType::Delete,
            Ownership::Unmanaged => DiffType::NoOp,
            Ownership::Invalid => DiffType::Unmanage,
        },
        (None, None) => DiffType::NoOp,
    }
}
