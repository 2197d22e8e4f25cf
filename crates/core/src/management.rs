//! Ownership metadata: which objects Tidepool manages and how it marks them.

use kube::core::DynamicObject;
use serde_json::{json, Value as Json};

/// Management annotation. `enabled` means Tidepool owns the object's lifecycle.
pub const MANAGED_ANNOTATION: &str = "tidepool.dev/managed";
pub const MANAGEMENT_ENABLED: &str = "enabled";
/// Version token of the declaration that was last applied to the object.
pub const TOKEN_ANNOTATION: &str = "tidepool.dev/token";
pub const OWNER_LABEL: &str = "app.kubernetes.io/managed-by";
pub const OWNER_LABEL_VALUE: &str = "tidepool";
/// Previously applied declaration; the `previous` term of the three-way merge.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Ownership state of a live object, read from the management annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Managed,
    Unmanaged,
    /// Annotation present with any value other than `enabled`.
    Invalid,
}

pub fn classify_ownership(live: &DynamicObject) -> Ownership {
    match annotation(live, MANAGED_ANNOTATION) {
        None => Ownership::Unmanaged,
        Some(MANAGEMENT_ENABLED) => Ownership::Managed,
        Some(_) => Ownership::Invalid,
    }
}

/// Mark a declared object as managed before it is applied.
pub fn enable_management(obj: &mut DynamicObject) {
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(MANAGED_ANNOTATION.to_string(), MANAGEMENT_ENABLED.to_string());
    obj.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(OWNER_LABEL.to_string(), OWNER_LABEL_VALUE.to_string());
}

pub fn sync_token(obj: &DynamicObject) -> Option<&str> {
    annotation(obj, TOKEN_ANNOTATION)
}

pub fn set_sync_token(obj: &mut DynamicObject, token: &str) {
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(TOKEN_ANNOTATION.to_string(), token.to_string());
}

/// Strip every piece of ownership metadata, leaving the rest of the object alone.
pub fn remove_management(obj: &mut DynamicObject) {
    if let Some(annos) = obj.metadata.annotations.as_mut() {
        annos.remove(MANAGED_ANNOTATION);
        annos.remove(TOKEN_ANNOTATION);
        annos.remove(LAST_APPLIED_ANNOTATION);
        if annos.is_empty() {
            obj.metadata.annotations = None;
        }
    }
    if let Some(labels) = obj.metadata.labels.as_mut() {
        if labels.get(OWNER_LABEL).map(String::as_str) == Some(OWNER_LABEL_VALUE) {
            labels.remove(OWNER_LABEL);
        }
        if labels.is_empty() {
            obj.metadata.labels = None;
        }
    }
}

/// JSON merge patch that performs [`remove_management`] on the cluster.
/// `None` when the object carries no ownership metadata at all.
pub fn management_removal_patch(live: &DynamicObject) -> Option<Json> {
    let mut annos = serde_json::Map::new();
    for key in [MANAGED_ANNOTATION, TOKEN_ANNOTATION, LAST_APPLIED_ANNOTATION] {
        if annotation(live, key).is_some() {
            annos.insert(key.to_string(), Json::Null);
        }
    }
    let owns_label = live
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(OWNER_LABEL))
        .map(String::as_str)
        == Some(OWNER_LABEL_VALUE);

    if annos.is_empty() && !owns_label {
        return None;
    }
    let mut meta = serde_json::Map::new();
    if !annos.is_empty() {
        meta.insert("annotations".into(), Json::Object(annos));
    }
    if owns_label {
        meta.insert("labels".into(), json!({ OWNER_LABEL: null }));
    }
    Some(json!({ "metadata": meta }))
}

pub(crate) fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}
