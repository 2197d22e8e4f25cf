//! Tidepool schema: structural patch metadata (list merge keys) per kind.
//!
//! A kind with a [`StructuralSchema`] can be patched structurally: keyed lists
//! merge element by element and primitive set lists merge as sets, instead of
//! being replaced wholesale. Kinds without one fall back to JSON merge patch.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::core::GroupVersionKind;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tidepool_core::GroupKind;
use tracing::warn;

/// Merge keys for the keyed lists of one kind, addressed by dotted field path
/// from the object root. Paths skip list indices: `spec.containers.ports`
/// names the `ports` list inside every element of `spec.containers`.
///
/// Set lists are lists of scalars the server merges as a set (for example
/// `metadata.finalizers`): a patch adds its elements to the live list and
/// removes elements only through a `$deleteFromPrimitiveList` directive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralSchema {
    merge_keys: BTreeMap<String, String>,
    #[serde(default)]
    set_lists: BTreeSet<String>,
}

impl StructuralSchema {
    pub fn new() -> Self { Self::default() }

    pub fn with_merge_key(mut self, path: &str, key: &str) -> Self {
        match normalize_path(path) {
            Some(p) => { self.merge_keys.insert(p, key.to_string()); }
            None => warn!(path, "ignoring invalid merge key path"),
        }
        self
    }

    pub fn with_set_list(mut self, path: &str) -> Self {
        match normalize_path(path) {
            Some(p) => { self.set_lists.insert(p); }
            None => warn!(path, "ignoring invalid set list path"),
        }
        self
    }

    pub fn is_set_list(&self, path: &str) -> bool {
        self.set_lists.contains(path)
    }

    pub fn merge_key(&self, path: &str) -> Option<&str> {
        self.merge_keys.get(path).map(String::as_str)
    }

    pub fn merge_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.merge_keys.iter().map(|(p, k)| (p.as_str(), k.as_str()))
    }
}

/// Accept only plain dotted paths like `.spec.template.spec.containers`.
fn normalize_path(path: &str) -> Option<String> {
    let s = path.strip_prefix('.').unwrap_or(path);
    if s.is_empty() { return None; }
    for seg in s.split('.') {
        if seg.is_empty() { return None; }
        if !seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') { return None; }
    }
    Some(s.to_string())
}

/// Schema-source collaborator of the patch calculator.
pub trait SchemaSource: Send + Sync {
    /// Structural schema for the kind, or `None` when only JSON merge patch applies.
    fn lookup_resource(&self, gvk: &GroupVersionKind) -> Option<Arc<StructuralSchema>>;
}

/// Schemas for the built-in Kubernetes kinds that accept strategic merge patch.
/// Custom resources can be registered on top.
pub struct BuiltinSchemas {
    by_kind: FxHashMap<GroupKind, Arc<StructuralSchema>>,
}

impl Default for BuiltinSchemas {
    fn default() -> Self { Self::new() }
}

impl BuiltinSchemas {
    pub fn new() -> Self {
        let mut me = Self { by_kind: FxHashMap::default() };

        me.register("", "Pod", pod_spec(StructuralSchema::new(), "spec"));
        for kind in ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"] {
            me.register("apps", kind, pod_spec(StructuralSchema::new(), "spec.template.spec"));
        }
        me.register("batch", "Job", pod_spec(StructuralSchema::new(), "spec.template.spec"));
        me.register("batch", "CronJob", pod_spec(StructuralSchema::new(), "spec.jobTemplate.spec.template.spec"));
        me.register("", "Service", StructuralSchema::new().with_merge_key("spec.ports", "port"));
        me.register("", "ServiceAccount", StructuralSchema::new().with_merge_key("secrets", "name"));

        // Kinds with no keyed lists still take strategic merge patches.
        for kind in ["ConfigMap", "Secret", "Namespace", "PersistentVolumeClaim", "LimitRange", "ResourceQuota"] {
            me.register("", kind, StructuralSchema::new());
        }
        for kind in ["Role", "RoleBinding", "ClusterRole", "ClusterRoleBinding"] {
            me.register("rbac.authorization.k8s.io", kind, StructuralSchema::new());
        }
        for kind in ["Ingress", "NetworkPolicy"] {
            me.register("networking.k8s.io", kind, StructuralSchema::new());
        }
        me
    }

    /// Register (or replace) the schema for a group/kind, version independent.
    pub fn register(&mut self, group: &str, kind: &str, schema: StructuralSchema) {
        let schema = schema
            .with_merge_key("metadata.ownerReferences", "uid")
            .with_set_list("metadata.finalizers");
        self.by_kind.insert(GroupKind { group: group.to_string(), kind: kind.to_string() }, Arc::new(schema));
    }
}

impl SchemaSource for BuiltinSchemas {
    fn lookup_resource(&self, gvk: &GroupVersionKind) -> Option<Arc<StructuralSchema>> {
        let gk = GroupKind { group: gvk.group.clone(), kind: gvk.kind.clone() };
        self.by_kind.get(&gk).cloned()
    }
}

fn pod_spec(schema: StructuralSchema, prefix: &str) -> StructuralSchema {
    let mut s = schema;
    for list in ["containers", "initContainers", "ephemeralContainers"] {
        let base = format!("{}.{}", prefix, list);
        s = s
            .with_merge_key(&base, "name")
            .with_merge_key(&format!("{}.ports", base), "containerPort")
            .with_merge_key(&format!("{}.env", base), "name")
            .with_merge_key(&format!("{}.volumeMounts", base), "mountPath")
            .with_merge_key(&format!("{}.volumeDevices", base), "devicePath");
    }
    s.with_merge_key(&format!("{}.volumes", prefix), "name")
        .with_merge_key(&format!("{}.imagePullSecrets", prefix), "name")
        .with_merge_key(&format!("{}.hostAliases", prefix), "ip")
        .with_merge_key(&format!("{}.topologySpreadConstraints", prefix), "topologyKey")
        .with_merge_key(&format!("{}.schedulingGates", prefix), "name")
        .with_merge_key(&format!("{}.resourceClaims", prefix), "name")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvk(group: &str, version: &str, kind: &str) -> GroupVersionKind {
        GroupVersionKind { group: group.into(), version: version.into(), kind: kind.into() }
    }

    #[test]
    fn normalize_path_accepts_plain_dotted_paths() {
        assert_eq!(normalize_path(".spec.ports"), Some("spec.ports".to_string()));
        assert_eq!(normalize_path("spec.template.spec"), Some("spec.template.spec".to_string()));
        assert!(normalize_path("").is_none());
        assert!(normalize_path("spec..ports").is_none());
        assert!(normalize_path("spec.containers[0]").is_none());
        assert!(normalize_path("spec.*").is_none());
    }

    #[test]
    fn builtin_lookup_is_version_independent() {
        let s = BuiltinSchemas::new();
        let d1 = s.lookup_resource(&gvk("apps", "v1", "Deployment")).unwrap();
        let d2 = s.lookup_resource(&gvk("apps", "v1beta2", "Deployment")).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(d1.merge_key("spec.template.spec.containers"), Some("name"));
        assert_eq!(d1.merge_key("spec.template.spec.containers.ports"), Some("containerPort"));
        assert_eq!(d1.merge_key("metadata.ownerReferences"), Some("uid"));
        assert!(s.lookup_resource(&gvk("example.com", "v1", "Widget")).is_none());
    }

    #[test]
    fn server_merged_lists_are_registered() {
        let s = BuiltinSchemas::new();
        let d = s.lookup_resource(&gvk("apps", "v1", "Deployment")).unwrap();
        assert!(d.is_set_list("metadata.finalizers"));
        assert_eq!(d.merge_key("spec.template.spec.topologySpreadConstraints"), Some("topologyKey"));
        assert!(!d.is_set_list("spec.template.spec.containers.args"));

        let cm = s.lookup_resource(&gvk("", "v1", "ConfigMap")).unwrap();
        assert!(cm.is_set_list("metadata.finalizers"));
        assert_eq!(StructuralSchema::new().with_set_list("spec..x"), StructuralSchema::new());
    }

    #[test]
    fn register_custom_kind() {
        let mut s = BuiltinSchemas::new();
        s.register("example.com", "Widget", StructuralSchema::new().with_merge_key("spec.parts", "id"));
        let w = s.lookup_resource(&gvk("example.com", "v1", "Widget")).unwrap();
        assert_eq!(w.merge_key("spec.parts"), Some("id"));
    }
}
