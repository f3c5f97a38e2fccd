#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kratix_controller::DynamicController;
use kratix_core::{kinds, naming, to_dynamic, LabelSelector, ObjectKey, Replicas, Work};
use kratix_pipeline::work_creator;
use kratix_runtime::{Action, Reconciler};
use kratix_store::{finalizers, MemoryStore, ObjectStore, Op, StoreError};
use kube::core::DynamicObject;

const REQUEST_ID: &str = "redis-default-default-my-redis";
const POD: &str = "request-pipeline-redis-default-abcde";

async fn setup() -> (Arc<MemoryStore>, DynamicController) {
    let store = Arc::new(MemoryStore::new());
    let promise: kratix_core::Promise = serde_yaml::from_str(REDIS_PROMISE).unwrap();
    let api = promise.spec.decode_api_type().unwrap();
    store.create(&kinds::crd(), &to_dynamic(&api.definition).unwrap()).await.unwrap();
    let ctrl = DynamicController::new(
        store.clone(),
        redis_kind(),
        "redis-default".into(),
        LabelSelector::new().with("env", "dev"),
        vec!["imageA".into()],
        config(),
    );
    (store, ctrl)
}

async fn request(store: &MemoryStore) -> DynamicObject {
    store.get(&redis_kind(), &request_key("my-redis")).await.unwrap()
}

fn pods(store: &MemoryStore) -> Vec<DynamicObject> {
    store.dump(&kinds::pod())
}

/// Stand in for the writer container.
async fn write_work(store: &MemoryStore) {
    let work = Work::new(REQUEST_ID, "default", Replicas::Exactly(1), LabelSelector::new().with("env", "dev"), vec![serde_json::json!({"kind": "Deployment"})]).unwrap();
    work_creator::submit(store, &work).await.unwrap();
}

fn work_key() -> ObjectKey { ObjectKey::namespaced("default", REQUEST_ID) }

#[tokio::test]
async fn first_pass_adds_finalizer_second_launches_pipeline() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();

    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    let obj = request(&store).await;
    assert!(finalizers::contains(&obj, "redis-cleanup"));
    assert!(pods(&store).is_empty());

    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    let pods = pods(&store);
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].metadata.name.as_deref(), Some(POD));
    assert_eq!(pods[0].metadata.labels.as_ref().unwrap()[naming::REQUEST_ID_LABEL], REQUEST_ID);
    assert_eq!(pods[0].data["spec"]["serviceAccountName"], "redis-default-sa");

    let cm = store.get(&kinds::config_map(), &ObjectKey::namespaced("default", format!("cluster-selectors-{}", REQUEST_ID))).await.unwrap();
    assert_eq!(cm.data["data"]["selectors"], "env=dev");

    let obj = request(&store).await;
    assert_eq!(obj.metadata.annotations.as_ref().unwrap()[naming::PIPELINE_LAUNCHED_ANNOTATION], POD);

    write_work(&store).await;
    assert!(store.get(&kinds::work(), &work_key()).await.is_ok());
}

#[tokio::test]
async fn redelivery_launches_at_most_once() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    for _ in 0..5 {
        ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    }
    assert_eq!(pods(&store).len(), 1);
    assert_eq!(store.calls(Op::Create, &kinds::pod()), 1);
}

#[tokio::test]
async fn executor_found_by_label_blocks_launch() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();

    let legacy: DynamicObject = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "request-pipeline-redis-default-old00",
            "namespace": "default",
            "labels": {"kratix-promise-resource-request-id": REQUEST_ID}
        }
    }))
    .unwrap();
    store.create(&kinds::pod(), &legacy).await.unwrap();

    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    assert_eq!(pods(&store).len(), 1);
    assert!(request(&store).await.metadata.annotations.is_none());
}

#[tokio::test]
async fn delete_removes_work_before_finalizer() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    write_work(&store).await;

    store.delete(&redis_kind(), &request_key("my-redis")).await.unwrap();
    let action = ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    assert_eq!(action, Action::RequeueAfter(Duration::from_secs(5)));
    assert!(store.get(&kinds::work(), &work_key()).await.unwrap_err().is_not_found());
    let obj = request(&store).await;
    assert!(finalizers::is_deleting(&obj));
    assert!(finalizers::contains(&obj, "redis-cleanup"));

    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    assert!(store.get(&redis_kind(), &request_key("my-redis")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn failed_work_deletion_keeps_finalizer_and_retries() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    write_work(&store).await;
    store.delete(&redis_kind(), &request_key("my-redis")).await.unwrap();
    store.fail_on(Op::Delete, &kinds::work(), StoreError::Unavailable("etcd leader change".into()));

    for _ in 0..3 {
        let action = ctrl.reconcile(&request_key("my-redis")).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(Duration::from_secs(5)));
    }
    assert!(store.get(&kinds::work(), &work_key()).await.is_ok());
    assert!(finalizers::contains(&request(&store).await, "redis-cleanup"));

    store.clear_failures();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();
    assert!(store.get(&redis_kind(), &request_key("my-redis")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn deletion_without_finalizer_is_left_alone() {
    let (store, ctrl) = setup().await;
    let mut obj = redis_request("my-redis");
    obj.metadata.finalizers = Some(vec!["example.com/keep".into()]);
    store.create(&redis_kind(), &obj).await.unwrap();
    store.delete(&redis_kind(), &request_key("my-redis")).await.unwrap();

    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    assert_eq!(store.calls(Op::Get, &kinds::work()), 0);
    assert_eq!(request(&store).await.metadata.finalizers, Some(vec!["example.com/keep".to_string()]));
}

#[tokio::test]
async fn missing_request_is_a_no_op() {
    let (_store, ctrl) = setup().await;
    assert_eq!(ctrl.reconcile(&request_key("ghost")).await.unwrap(), Action::Done);
}

#[tokio::test]
async fn finalizer_conflict_is_escalated() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    store.fail_on(Op::Update, &redis_kind(), StoreError::Conflict("stale".into()));
    assert!(ctrl.reconcile(&request_key("my-redis")).await.is_err());
}

#[tokio::test]
async fn failed_pod_creation_releases_the_claim() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();

    store.fail_on(Op::Create, &kinds::pod(), StoreError::Internal("quota exceeded".into()));
    assert!(ctrl.reconcile(&request_key("my-redis")).await.is_err());
    let annotations = request(&store).await.metadata.annotations.unwrap_or_default();
    assert!(!annotations.contains_key(naming::PIPELINE_LAUNCHED_ANNOTATION));

    store.clear_failures();
    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    assert_eq!(pods(&store).len(), 1);
}

#[tokio::test]
async fn failed_config_map_creation_releases_the_claim_without_a_pod() {
    let (store, ctrl) = setup().await;
    store.create(&redis_kind(), &redis_request("my-redis")).await.unwrap();
    ctrl.reconcile(&request_key("my-redis")).await.unwrap();

    store.fail_on(Op::Create, &kinds::config_map(), StoreError::Unavailable("etcd leader election".into()));
    assert!(ctrl.reconcile(&request_key("my-redis")).await.is_err());
    assert!(pods(&store).is_empty());
    let annotations = request(&store).await.metadata.annotations.unwrap_or_default();
    assert!(!annotations.contains_key(naming::PIPELINE_LAUNCHED_ANNOTATION));

    store.clear_failures();
    assert_eq!(ctrl.reconcile(&request_key("my-redis")).await.unwrap(), Action::Done);
    assert_eq!(pods(&store).len(), 1);
    assert_eq!(store.dump(&kinds::config_map()).len(), 1);
}
