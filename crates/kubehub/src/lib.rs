//! Tidepool kubehub: the kube-rs implementation of the applier's cluster
//! client, plus the owner-labelled listing the app's differ needs.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{pinned_kind, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tidepool_apply::{ClusterClient, ClusterError};
use tidepool_core::management::{OWNER_LABEL, OWNER_LABEL_VALUE};
use tidepool_core::{gvk_key, ResourceId};
use tidepool_patch::PatchType;
use tracing::debug;

/// Build a client from the local kubeconfig or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Label selector matching every object Tidepool has written.
pub fn managed_selector() -> String {
    format!("{}={}", OWNER_LABEL, OWNER_LABEL_VALUE)
}

#[derive(Debug, Clone)]
struct Resolved {
    ar: ApiResource,
    namespaced: bool,
}

/// Cluster client over dynamic objects. GVK resolution goes through discovery
/// once per kind; the results are cached for the life of the client.
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
    resources: ArcSwap<FxHashMap<String, Resolved>>,
}

impl KubeClusterClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            resources: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Resolved> {
        let key = gvk_key(gvk);
        if let Some(r) = self.resources.load().get(&key) {
            return Ok(r.clone());
        }
        let (ar, caps) = pinned_kind(&self.client, gvk)
            .await
            .with_context(|| format!("discovering {}", key))?;
        let resolved = Resolved { ar, namespaced: matches!(caps.scope, Scope::Namespaced) };
        self.resources.rcu(|cur| {
            let mut next = (**cur).clone();
            next.insert(key.clone(), resolved.clone());
            next
        });
        debug!(gvk = %key, namespaced = resolved.namespaced, "api resource resolved");
        Ok(resolved)
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource)> {
        let r = self.resolve(gvk).await?;
        let api = match (r.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            (true, None) => return Err(anyhow!("namespace required for namespaced kind {}", gvk_key(gvk))),
            (false, _) => Api::all_with(self.client.clone(), &r.ar),
        };
        Ok((api, r.ar))
    }

    fn post_params(&self) -> PostParams {
        PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }

    /// Live objects of `gvk` carrying the owner label: the deletion candidates
    /// of one kind/namespace. A namespaced kind listed without a namespace is
    /// listed across all namespaces.
    pub async fn list_managed(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let r = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = match (r.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            _ => Api::all_with(self.client.clone(), &r.ar),
        };
        let lp = ListParams::default().labels(&managed_selector());
        let list = api.list(&lp).await.with_context(|| format!("listing managed {}", gvk_key(gvk)))?;
        Ok(list.items.into_iter().map(|o| with_types(o, &r.ar)).collect())
    }
}

/// List items come back without type metadata; fill it in from discovery.
fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj
}

fn cluster_error(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ClusterError::NotFound,
            409 if ae.reason == "AlreadyExists" => ClusterError::AlreadyExists,
            409 => ClusterError::Conflict(ae.message),
            415 => ClusterError::UnsupportedMediaType(ae.message),
            code => ClusterError::Api { code, message: ae.message },
        },
        other => ClusterError::Other(other.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, ClusterError> {
        let (api, ar) = self.api(&id.gvk, id.namespace.as_deref()).await?;
        let found = api.get_opt(&id.name).await.map_err(cluster_error)?;
        Ok(found.map(|o| with_types(o, &ar)))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = ResourceId::of(obj).map_err(|e| ClusterError::Other(e.into()))?;
        let (api, ar) = self.api(&id.gvk, id.namespace.as_deref()).await?;
        let created = api.create(&self.post_params(), obj).await.map_err(cluster_error)?;
        Ok(with_types(created, &ar))
    }

    async fn patch(&self, id: &ResourceId, patch_type: PatchType, patch: &Json) -> Result<DynamicObject, ClusterError> {
        let (api, ar) = self.api(&id.gvk, id.namespace.as_deref()).await?;
        let body = match patch_type {
            PatchType::Strategic => Patch::Strategic(patch),
            PatchType::Merge => Patch::Merge(patch),
        };
        let patched = api.patch(&id.name, &self.patch_params(), &body).await.map_err(cluster_error)?;
        Ok(with_types(patched, &ar))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let (api, _) = self.api(&id.gvk, id.namespace.as_deref()).await?;
        api.delete(&id.name, &DeleteParams::background()).await.map_err(cluster_error)?;
        Ok(())
    }
}
