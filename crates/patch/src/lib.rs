//! Tidepool patch calculator: three-way merge between the last-applied,
//! declared and live bodies of one object.
//!
//! Everything here is pure. [`three_way`] works on plain JSON documents;
//! [`calculate`] extracts the three documents from a declared/live pair.

#![forbid(unsafe_code)]

use kube::core::DynamicObject;
use serde_json::{json, Value as Json};
use tidepool_core::management::LAST_APPLIED_ANNOTATION;
use tidepool_schema::StructuralSchema;
use tracing::warn;

pub mod merge;
pub mod strategic;

pub use merge::apply_merge_patch;
pub use strategic::apply_structural_patch;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("serializing object: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("precondition failed: patch would change {0}")]
    PreconditionFailed(&'static str),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Wire format of a computed patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// Structural (strategic merge) patch; needs a schema for the kind.
    Strategic,
    /// RFC 7386 JSON merge patch.
    Merge,
}

impl PatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchType::Strategic => "strategic",
            PatchType::Merge => "merge",
        }
    }
}

/// Result of a patch calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPlan {
    pub patch_type: PatchType,
    pub body: Json,
    /// Nothing to send; the live object already matches.
    pub no_op: bool,
}

/// The three documents a patch is computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeWay {
    pub previous: Json,
    pub modified: Json,
    pub current: Json,
}

/// Stamp `obj` with a last-applied annotation holding its own serialization
/// (taken with that annotation removed). Returns the stamped string.
pub fn stamp_last_applied(obj: &mut DynamicObject) -> Result<String> {
    let mut bare = obj.clone();
    if let Some(annos) = bare.metadata.annotations.as_mut() {
        annos.remove(LAST_APPLIED_ANNOTATION);
        if annos.is_empty() {
            bare.metadata.annotations = None;
        }
    }
    let applied = serde_json::to_string(&bare)?;
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), applied.clone());
    Ok(applied)
}

/// Parse the last-applied annotation of a live object. Missing or unreadable
/// annotations yield an empty object, which degrades to a two-way merge.
pub fn last_applied(live: &DynamicObject) -> Json {
    let raw = live.metadata.annotations.as_ref().and_then(|a| a.get(LAST_APPLIED_ANNOTATION));
    match raw {
        None => json!({}),
        Some(s) => match serde_json::from_str::<Json>(s) {
            Ok(v) if v.is_object() => v,
            Ok(_) => {
                warn!(name = ?live.metadata.name, "last-applied annotation is not an object; ignoring");
                json!({})
            }
            Err(e) => {
                warn!(name = ?live.metadata.name, error = %e, "unparsable last-applied annotation; ignoring");
                json!({})
            }
        },
    }
}

/// Build `(previous, modified, current)` for a declared/live pair.
pub fn prepare(declared: &DynamicObject, live: &DynamicObject) -> Result<ThreeWay> {
    let current = serde_json::to_value(live)?;
    let previous = last_applied(live);
    let mut modified = declared.clone();
    stamp_last_applied(&mut modified)?;
    let modified = serde_json::to_value(&modified)?;
    Ok(ThreeWay { previous, modified, current })
}

/// Compute the patch for a declared/live pair. With a schema the patch is
/// structural; without one it is a JSON merge patch.
pub fn calculate(declared: &DynamicObject, live: &DynamicObject, schema: Option<&StructuralSchema>) -> Result<PatchPlan> {
    let docs = prepare(declared, live)?;
    three_way(&docs.previous, &docs.modified, &docs.current, schema)
}

/// Three-way patch over plain documents.
pub fn three_way(previous: &Json, modified: &Json, current: &Json, schema: Option<&StructuralSchema>) -> Result<PatchPlan> {
    let (patch_type, body) = match schema {
        Some(s) => (PatchType::Strategic, strategic::three_way(previous, modified, current, s)),
        None => (PatchType::Merge, merge::three_way(previous, modified, current)),
    };
    check_preconditions(&body)?;
    let no_op = is_no_op(&body);
    Ok(PatchPlan { patch_type, body, no_op })
}

/// The identity of an object is never patched.
fn check_preconditions(patch: &Json) -> Result<()> {
    if patch.get("apiVersion").is_some() {
        return Err(PatchError::PreconditionFailed("apiVersion"));
    }
    if patch.get("kind").is_some() {
        return Err(PatchError::PreconditionFailed("kind"));
    }
    if patch.get("metadata").and_then(|m| m.get("name")).is_some() {
        return Err(PatchError::PreconditionFailed("metadata.name"));
    }
    Ok(())
}

/// `{}`, or a patch whose only effect is clearing `metadata.creationTimestamp`.
pub fn is_no_op(patch: &Json) -> bool {
    match patch.as_object() {
        Some(p) if p.is_empty() => true,
        Some(_) => *patch == json!({ "metadata": { "creationTimestamp": null } }),
        None => false,
    }
}
