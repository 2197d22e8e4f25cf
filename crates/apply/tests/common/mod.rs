#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::core::DynamicObject;
use serde_json::{json, Value as Json};
use tidepool_apply::{Applier, ClusterClient, ClusterError};
use tidepool_core::ResourceId;
use tidepool_fight::FightMonitor;
use tidepool_patch::{apply_merge_patch, apply_structural_patch, PatchType};
use tidepool_schema::{BuiltinSchemas, SchemaSource};

/// In-memory cluster that really applies the patches it receives.
pub struct FakeCluster {
    objects: Mutex<BTreeMap<String, Json>>,
    schemas: BuiltinSchemas,
    reject_strategic: bool,
    calls: Mutex<Vec<String>>,
    next_rv: Mutex<u64>,
}

fn key(id: &ResourceId) -> String {
    format!("{}/{}/{}/{}", id.gvk.group, id.gvk.kind, id.namespace.as_deref().unwrap_or(""), id.name)
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            schemas: BuiltinSchemas::new(),
            reject_strategic: false,
            calls: Mutex::new(Vec::new()),
            next_rv: Mutex::new(1),
        }
    }

    /// Behave like a server that only accepts JSON merge patches.
    pub fn rejecting_strategic() -> Self {
        Self { reject_strategic: true, ..Self::new() }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Put an object straight into the store, bypassing the applier.
    pub fn seed(&self, v: Json) {
        let o = obj(v);
        let id = ResourceId::of(&o).unwrap();
        let stored = self.server_fields(serde_json::to_value(&o).unwrap());
        self.objects.lock().unwrap().insert(key(&id), stored);
    }

    /// Mutate a stored object out of band, as another controller would.
    pub fn edit(&self, id: &ResourceId, patch: Json) {
        let mut objects = self.objects.lock().unwrap();
        let cur = objects.get_mut(&key(id)).unwrap();
        apply_merge_patch(cur, &patch);
    }

    pub fn stored(&self, id: &ResourceId) -> Option<Json> {
        self.objects.lock().unwrap().get(&key(id)).cloned()
    }

    fn server_fields(&self, mut v: Json) -> Json {
        let mut rv = self.next_rv.lock().unwrap();
        *rv += 1;
        v["metadata"]["resourceVersion"] = json!(rv.to_string());
        if v["metadata"].get("uid").is_none() {
            v["metadata"]["uid"] = json!(format!("00000000-0000-0000-0000-{:012}", *rv));
            v["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        }
        v
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, ClusterError> {
        self.record(format!("get {}", id));
        Ok(self.stored(id).map(obj))
    }

    async fn create(&self, o: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = ResourceId::of(o).map_err(|e| ClusterError::Other(e.into()))?;
        self.record(format!("create {}", id));
        let k = key(&id);
        if self.objects.lock().unwrap().contains_key(&k) {
            return Err(ClusterError::AlreadyExists);
        }
        let stored = self.server_fields(serde_json::to_value(o).unwrap());
        self.objects.lock().unwrap().insert(k, stored.clone());
        Ok(obj(stored))
    }

    async fn patch(&self, id: &ResourceId, patch_type: PatchType, patch: &Json) -> Result<DynamicObject, ClusterError> {
        self.record(format!("patch {} {}", patch_type.as_str(), id));
        if patch_type == PatchType::Strategic && self.reject_strategic {
            return Err(ClusterError::UnsupportedMediaType("strategic merge patch not supported".into()));
        }
        let k = key(id);
        let mut cur = self.objects.lock().unwrap().get(&k).cloned().ok_or(ClusterError::NotFound)?;
        match patch_type {
            PatchType::Merge => apply_merge_patch(&mut cur, patch),
            PatchType::Strategic => {
                let schema = self.schemas.lookup_resource(&id.gvk).unwrap_or_default();
                apply_structural_patch(&mut cur, patch, &schema);
            }
        }
        let stored = self.server_fields(cur);
        self.objects.lock().unwrap().insert(k, stored.clone());
        Ok(obj(stored))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        self.record(format!("delete {}", id));
        match self.objects.lock().unwrap().remove(&key(id)) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound),
        }
    }
}

pub fn obj(v: Json) -> DynamicObject {
    serde_json::from_value(v).unwrap()
}

pub fn config_map(name: &str, data: Json) -> DynamicObject {
    obj(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "shop" },
        "data": data
    }))
}

pub fn applier(cluster: Arc<FakeCluster>) -> Arc<Applier> {
    Arc::new(Applier::new(cluster, Arc::new(BuiltinSchemas::new()), Arc::new(FightMonitor::default())))
}
