mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{applier, config_map, obj, FakeCluster};
use serde_json::json;
use tidepool_apply::{ApplyContext, ApplyError};
use tidepool_core::management::{enable_management, LAST_APPLIED_ANNOTATION, MANAGED_ANNOTATION, OWNER_LABEL};
use tidepool_core::ResourceId;
use tokio_util::sync::CancellationToken;

fn managed(mut o: kube::core::DynamicObject) -> kube::core::DynamicObject {
    enable_management(&mut o);
    o
}

#[tokio::test]
async fn reapplying_same_declaration_is_unchanged() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let declared = managed(config_map("cfg", json!({ "k": "v" })));
    let id = ResourceId::of(&declared).unwrap();

    assert!(a.create(&ctx, &declared).await.unwrap());
    let live = obj(cluster.stored(&id).unwrap());
    assert!(live.metadata.annotations.as_ref().unwrap().contains_key(LAST_APPLIED_ANNOTATION));

    cluster.clear_calls();
    assert!(!a.update(&ctx, &declared, &live).await.unwrap());
    assert!(cluster.calls().is_empty(), "calls={:?}", cluster.calls());
}

#[tokio::test]
async fn update_applies_declaration_and_keeps_foreign_fields() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let declared = managed(config_map("cfg", json!({ "a": "1" })));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();

    // another controller adds a label and a data key
    cluster.edit(&id, json!({ "metadata": { "labels": { "injected": "yes" } }, "data": { "c": "3" } }));

    let declared2 = managed(config_map("cfg", json!({ "a": "1", "b": "2" })));
    let live = obj(cluster.stored(&id).unwrap());
    assert!(a.update(&ctx, &declared2, &live).await.unwrap());

    let stored = cluster.stored(&id).unwrap();
    assert_eq!(stored["data"], json!({ "a": "1", "b": "2", "c": "3" }));
    assert_eq!(stored["metadata"]["labels"]["injected"], "yes");

    // and the next pass is quiet again
    let live = obj(stored);
    assert!(!a.update(&ctx, &declared2, &live).await.unwrap());
}

#[tokio::test]
async fn dropped_fields_are_removed() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let declared = managed(config_map("cfg", json!({ "a": "1", "b": "2" })));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();

    let declared2 = managed(config_map("cfg", json!({ "a": "1" })));
    let live = obj(cluster.stored(&id).unwrap());
    assert!(a.update(&ctx, &declared2, &live).await.unwrap());
    assert_eq!(cluster.stored(&id).unwrap()["data"], json!({ "a": "1" }));
}

#[tokio::test]
async fn structural_patch_falls_back_to_merge_patch() {
    let cluster = Arc::new(FakeCluster::rejecting_strategic());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let declared = managed(config_map("cfg", json!({ "a": "1" })));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();
    cluster.clear_calls();

    let declared2 = managed(config_map("cfg", json!({ "a": "2" })));
    let live = obj(cluster.stored(&id).unwrap());
    assert!(a.update(&ctx, &declared2, &live).await.unwrap());
    assert_eq!(
        cluster.calls(),
        vec![
            "patch strategic v1/ConfigMap shop/cfg".to_string(),
            "patch merge v1/ConfigMap shop/cfg".to_string(),
        ]
    );
    assert_eq!(cluster.stored(&id).unwrap()["data"]["a"], "2");
}

#[tokio::test]
async fn keyed_lists_merge_with_injected_elements() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let deploy = |image: &str| {
        managed(obj(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "shop" },
            "spec": { "template": { "spec": { "containers": [{ "name": "web", "image": image }] } } }
        })))
    };
    let declared = deploy("web:1");
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();

    // a mutating webhook injects a sidecar
    let mut live = cluster.stored(&id).unwrap();
    live["spec"]["template"]["spec"]["containers"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "name": "proxy", "image": "proxy:1" }));
    cluster.seed(live.clone());

    assert!(a.update(&ctx, &deploy("web:2"), &obj(live)).await.unwrap());
    let containers = cluster.stored(&id).unwrap()["spec"]["template"]["spec"]["containers"].clone();
    assert_eq!(
        containers,
        json!([{ "name": "web", "image": "web:2" }, { "name": "proxy", "image": "proxy:1" }])
    );
}

#[tokio::test]
async fn delete_of_absent_object_is_unchanged() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let gone = managed(config_map("gone", json!({})));
    assert!(!a.delete(&ApplyContext::new(), &gone).await.unwrap());
}

#[tokio::test]
async fn delete_removes_live_object() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let declared = managed(config_map("cfg", json!({})));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();
    let live = obj(cluster.stored(&id).unwrap());
    assert!(a.delete(&ctx, &live).await.unwrap());
    assert!(cluster.stored(&id).is_none());
}

#[tokio::test]
async fn cancelled_context_skips_the_patch_call() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let declared = managed(config_map("cfg", json!({ "a": "1" })));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ApplyContext::new(), &declared).await.unwrap();
    cluster.clear_calls();

    let token = CancellationToken::new();
    token.cancel();
    let ctx = ApplyContext::new().with_cancellation(token);
    let live = obj(cluster.stored(&id).unwrap());
    let err = a.update(&ctx, &managed(config_map("cfg", json!({ "a": "2" }))), &live).await.unwrap_err();
    assert!(matches!(err, ApplyError::Cancelled { reason: "cancelled", .. }), "err={}", err);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn expired_deadline_skips_the_patch_call() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let declared = managed(config_map("cfg", json!({ "a": "1" })));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ApplyContext::new(), &declared).await.unwrap();
    cluster.clear_calls();

    let ctx = ApplyContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
    let live = obj(cluster.stored(&id).unwrap());
    let err = a.update(&ctx, &managed(config_map("cfg", json!({ "a": "2" }))), &live).await.unwrap_err();
    assert!(matches!(err, ApplyError::Cancelled { reason: "deadline exceeded", .. }), "err={}", err);
    assert!(cluster.calls().is_empty(), "calls={:?}", cluster.calls());
    assert_eq!(cluster.stored(&id).unwrap()["data"]["a"], "1");
}

#[tokio::test]
async fn object_without_name_is_rejected_before_any_call() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let nameless = obj(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "namespace": "shop" }
    }));
    let err = a.create(&ApplyContext::new(), &nameless).await.unwrap_err();
    assert!(matches!(err, ApplyError::Object(_)), "err={}", err);
    let err = a.delete(&ApplyContext::new(), &nameless).await.unwrap_err();
    assert!(matches!(err, ApplyError::Object(_)), "err={}", err);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn dropped_finalizer_is_removed_and_pass_converges() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let with_finalizers = |finalizers: serde_json::Value| {
        managed(obj(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "shop", "finalizers": finalizers },
            "data": { "a": "1" }
        })))
    };
    let declared = with_finalizers(json!(["example.com/a", "example.com/b"]));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();

    // another controller registers its own finalizer
    let mut stored = cluster.stored(&id).unwrap();
    stored["metadata"]["finalizers"].as_array_mut().unwrap().push(json!("other.io/hold"));
    cluster.seed(stored);

    let declared2 = with_finalizers(json!(["example.com/a"]));
    let live = obj(cluster.stored(&id).unwrap());
    assert!(a.update(&ctx, &declared2, &live).await.unwrap());
    assert_eq!(
        cluster.stored(&id).unwrap()["metadata"]["finalizers"],
        json!(["example.com/a", "other.io/hold"])
    );

    cluster.clear_calls();
    let live = obj(cluster.stored(&id).unwrap());
    assert!(!a.update(&ctx, &declared2, &live).await.unwrap());
    assert!(cluster.calls().is_empty(), "calls={:?}", cluster.calls());
}

#[tokio::test]
async fn create_conflict_is_wrapped_with_identity() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let declared = managed(config_map("cfg", json!({})));
    let ctx = ApplyContext::new();
    a.create(&ctx, &declared).await.unwrap();
    let err = a.create(&ctx, &declared).await.unwrap_err();
    assert!(err.to_string().contains("creating v1/ConfigMap shop/cfg"), "err={}", err);
    assert_eq!(err.resource().map(|id| id.name.as_str()), Some("cfg"));
}

#[tokio::test]
async fn remove_management_strips_only_ownership() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    cluster.seed(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "cfg",
            "namespace": "shop",
            "annotations": { MANAGED_ANNOTATION: "disabled", "team": "blue" },
            "labels": { OWNER_LABEL: "tidepool", "app": "web" }
        },
        "data": { "k": "v" }
    }));
    let id = ResourceId::of(&config_map("cfg", json!({}))).unwrap();
    let live = obj(cluster.stored(&id).unwrap());

    assert!(a.remove_management(&ApplyContext::new(), &live).await.unwrap());
    let stored = cluster.stored(&id).unwrap();
    assert_eq!(stored["metadata"]["annotations"], json!({ "team": "blue" }));
    assert_eq!(stored["metadata"]["labels"], json!({ "app": "web" }));
    assert_eq!(stored["data"], json!({ "k": "v" }));

    // nothing left to strip
    let live = obj(stored);
    assert!(!a.remove_management(&ApplyContext::new(), &live).await.unwrap());
}

#[tokio::test]
async fn reverting_writer_heats_up_the_fight_detector() {
    let cluster = Arc::new(FakeCluster::new());
    let a = applier(cluster.clone());
    let ctx = ApplyContext::new();
    let declared = managed(config_map("cfg", json!({ "mode": "ours" })));
    let id = ResourceId::of(&declared).unwrap();
    a.create(&ctx, &declared).await.unwrap();

    for _ in 0..6 {
        cluster.edit(&id, json!({ "data": { "mode": "theirs" } }));
        let live = obj(cluster.stored(&id).unwrap());
        assert!(a.update(&ctx, &declared, &live).await.unwrap());
    }
    let heat = a.fights().detector().heat(&id.fight_key()).unwrap();
    assert!(a.fights().detector().is_fight(heat), "heat={}", heat);
}
