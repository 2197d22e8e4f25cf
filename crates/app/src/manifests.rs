//! Declared state: YAML/JSON manifests read from a directory, grouped by
//! kind and namespace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use kube::core::{DynamicObject, GroupVersionKind};
use serde::Deserialize;
use serde_json::Value as Json;
use tidepool_core::{gvk_of, GroupKind, ResourceId};
use tracing::debug;

/// One reconcile unit: every declared object of a kind in one namespace,
/// whatever API version each was written against. `gvk` is the version the
/// unit lists live objects with (the first one declared).
#[derive(Debug, Clone)]
pub struct Group {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub declared: Vec<DynamicObject>,
}

/// Group key; version independent so that a kind declared at two API
/// versions still reconciles (and lists its orphans) as one unit.
pub type GroupKey = (GroupKind, Option<String>);

/// Parse every document in a (possibly multi-document) YAML or JSON text.
/// Empty documents are skipped and `kind: List` documents are flattened.
pub fn parse_documents(text: &str) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Json::deserialize(doc).with_context(|| format!("document {}", idx))?;
        collect(value, &mut out).with_context(|| format!("document {}", idx))?;
    }
    Ok(out)
}

fn collect(value: Json, out: &mut Vec<DynamicObject>) -> Result<()> {
    match value {
        Json::Null => Ok(()),
        Json::Object(ref m) if m.get("kind").and_then(Json::as_str) == Some("List") => {
            let items = m.get("items").and_then(Json::as_array).cloned().unwrap_or_default();
            for item in items {
                collect(item, out)?;
            }
            Ok(())
        }
        Json::Object(_) => {
            let obj: DynamicObject = serde_json::from_value(value).context("not a Kubernetes object")?;
            // identity must be complete before anything is applied
            ResourceId::of(&obj)?;
            out.push(obj);
            Ok(())
        }
        other => bail!("expected a mapping, found {}", other),
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

/// Manifest files under `dir`, recursively, in path order.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(d) = pending.pop() {
        let entries = std::fs::read_dir(&d).with_context(|| format!("reading {}", d.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_manifest(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Load every declared object under `dir`. A file that fails to parse fails
/// the load: applying a partial view would delete what the bad file declares.
pub fn load_dir(dir: &Path) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for file in manifest_files(dir)? {
        let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        let objs = parse_documents(&text).with_context(|| format!("parsing {}", file.display()))?;
        debug!(file = %file.display(), objects = objs.len(), "manifest loaded");
        out.extend(objs);
    }
    Ok(out)
}

/// Group declared objects by kind/namespace. A second declaration of the same
/// object, at any version, is an error.
pub fn group(objects: Vec<DynamicObject>) -> Result<BTreeMap<GroupKey, Group>> {
    let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();
    for obj in objects {
        let gvk = gvk_of(&obj)?;
        let namespace = obj.metadata.namespace.clone();
        let kind = GroupKind { group: gvk.group.clone(), kind: gvk.kind.clone() };
        let key = (kind, namespace.clone());
        let group = groups.entry(key).or_insert_with(|| Group { gvk, namespace, declared: Vec::new() });
        let name = obj.metadata.name.as_deref();
        if group.declared.iter().any(|d| d.metadata.name.as_deref() == name) {
            let id = ResourceId::of(&obj)?;
            return Err(anyhow!("{} is declared more than once", id));
        }
        group.declared.push(obj);
    }
    Ok(groups)
}
