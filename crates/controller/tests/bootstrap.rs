#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kratix_controller::PromiseReconciler;
use kratix_core::{from_dynamic, kinds, BootstrapPhase, ObjectKey, Promise, Replicas, Work};
use kratix_runtime::{Action, Reconciler, Registrar};
use kratix_store::{MemoryStore, ObjectStore, Op, StoreError};

fn reconciler(store: &Arc<MemoryStore>, registrar: &Arc<RecordingRegistrar>) -> PromiseReconciler {
    PromiseReconciler::new(store.clone(), registrar.clone(), config())
}

async fn stored_promise(store: &MemoryStore) -> Promise {
    from_dynamic(&store.get(&kinds::promise(), &promise_key()).await.unwrap()).unwrap()
}

#[tokio::test]
async fn bootstrap_creates_work_rbac_and_registers_controller() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    store.create(&kinds::promise(), &redis_promise()).await.unwrap();

    let action = reconciler(&store, &registrar).reconcile(&promise_key()).await.unwrap();
    assert_eq!(action, Action::Done);

    let work: Work = from_dynamic(&store.get(&kinds::work(), &ObjectKey::namespaced("default", "redis-default")).await.unwrap()).unwrap();
    assert_eq!(work.spec.replicas, Replicas::AllMatching);
    assert_eq!(work.spec.cluster_selector.get("env"), Some("dev"));
    let promise = stored_promise(&store).await;
    assert_eq!(work.manifests(), promise.spec.cluster_wide_manifests.as_slice());

    assert!(store.is_served(&redis_kind()).await.unwrap());
    assert_eq!(store.dump(&kinds::cluster_role()).len(), 2);
    assert_eq!(store.dump(&kinds::cluster_role_binding()).len(), 2);
    let sas = store.dump(&kinds::service_account());
    assert_eq!(sas.len(), 1);
    assert_eq!(sas[0].metadata.name.as_deref(), Some("redis-default-sa"));

    assert_eq!(registrar.registered(), vec![(redis_kind(), "redis-default".to_string())]);
    let status = promise.status.unwrap().bootstrap.unwrap();
    assert_eq!(status.phase, BootstrapPhase::Ready);
    assert!(status.failed_steps.is_empty());
}

#[tokio::test]
async fn repeated_bootstrap_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    store.create(&kinds::promise(), &redis_promise()).await.unwrap();
    let rec = reconciler(&store, &registrar);

    rec.reconcile(&promise_key()).await.unwrap();
    rec.reconcile(&promise_key()).await.unwrap();

    assert_eq!(store.dump(&kinds::crd()).len(), 1);
    assert_eq!(store.dump(&kinds::work()).len(), 1);
    assert_eq!(store.dump(&kinds::cluster_role()).len(), 2);
    assert_eq!(registrar.attempts(), 2);
    assert_eq!(registrar.registered().len(), 1);
    // unchanged outcome is not written again
    assert_eq!(store.calls(Op::UpdateStatus, &kinds::promise()), 1);
}

#[tokio::test]
async fn unserved_kind_requeues_without_side_effects() {
    let store = Arc::new(MemoryStore::with_deferred_establish());
    let registrar = Arc::new(RecordingRegistrar::default());
    store.create(&kinds::promise(), &redis_promise()).await.unwrap();
    let rec = reconciler(&store, &registrar);

    let action = rec.reconcile(&promise_key()).await.unwrap();
    assert_eq!(action, Action::RequeueAfter(Duration::from_secs(5)));
    assert!(store.dump(&kinds::work()).is_empty());
    assert!(store.dump(&kinds::cluster_role()).is_empty());
    assert!(registrar.registered().is_empty());

    assert!(store.establish(&redis_kind()));
    assert_eq!(rec.reconcile(&promise_key()).await.unwrap(), Action::Done);
    assert_eq!(store.dump(&kinds::work()).len(), 1);
    assert_eq!(registrar.registered().len(), 1);
}

#[tokio::test]
async fn malformed_api_type_is_terminal_and_reported_once() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    let mut promise = redis_promise();
    promise.data["spec"]["xaasCrd"] = serde_json::json!({"spec": "not a definition"});
    store.create(&kinds::promise(), &promise).await.unwrap();
    let rec = reconciler(&store, &registrar);

    assert_eq!(rec.reconcile(&promise_key()).await.unwrap(), Action::Done);
    assert_eq!(rec.reconcile(&promise_key()).await.unwrap(), Action::Done);

    assert!(store.dump(&kinds::crd()).is_empty());
    assert!(registrar.registered().is_empty());
    let status = stored_promise(&store).await.status.unwrap().bootstrap.unwrap();
    assert_eq!(status.phase, BootstrapPhase::Degraded);
    assert_eq!(status.failed_steps, vec!["decode".to_string()]);
    assert_eq!(store.calls(Op::UpdateStatus, &kinds::promise()), 1);
}

#[tokio::test]
async fn failed_rbac_degrades_then_heals() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    store.create(&kinds::promise(), &redis_promise()).await.unwrap();
    store.fail_on(Op::Create, &kinds::cluster_role(), StoreError::Internal("forbidden".into()));
    let rec = reconciler(&store, &registrar);

    assert_eq!(rec.reconcile(&promise_key()).await.unwrap(), Action::Done);
    assert_eq!(registrar.registered().len(), 1, "later steps still run");
    let status = stored_promise(&store).await.status.unwrap().bootstrap.unwrap();
    assert_eq!(status.phase, BootstrapPhase::Degraded);
    assert_eq!(status.failed_steps, vec!["controller-role".to_string(), "pipeline-role".to_string()]);

    store.clear_failures();
    rec.reconcile(&promise_key()).await.unwrap();
    assert_eq!(store.dump(&kinds::cluster_role()).len(), 2);
    let status = stored_promise(&store).await.status.unwrap().bootstrap.unwrap();
    assert_eq!(status.phase, BootstrapPhase::Ready);
}

#[tokio::test]
async fn existing_work_does_not_stop_bootstrap() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    store.create(&kinds::promise(), &redis_promise()).await.unwrap();
    let existing = Work::new("redis-default", "default", Replicas::AllMatching, Default::default(), vec![serde_json::json!({"kind": "Namespace"})]).unwrap();
    store.create(&kinds::work(), &kratix_core::to_dynamic(&existing).unwrap()).await.unwrap();

    reconciler(&store, &registrar).reconcile(&promise_key()).await.unwrap();
    assert_eq!(store.dump(&kinds::cluster_role()).len(), 2);
    assert_eq!(registrar.registered().len(), 1);
}

#[tokio::test]
async fn promise_without_cluster_wide_manifests_has_no_work() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    let mut promise = redis_promise();
    promise.data["spec"]["workerClusterResources"] = serde_json::json!([]);
    store.create(&kinds::promise(), &promise).await.unwrap();

    reconciler(&store, &registrar).reconcile(&promise_key()).await.unwrap();
    assert!(store.dump(&kinds::work()).is_empty());
    assert_eq!(registrar.registered().len(), 1);
    let status = stored_promise(&store).await.status.unwrap().bootstrap.unwrap();
    assert_eq!(status.phase, BootstrapPhase::Ready);
}

#[tokio::test]
async fn removed_promise_stops_its_controller_and_keeps_its_objects() {
    let store = Arc::new(MemoryStore::new());
    let registrar = Arc::new(RecordingRegistrar::default());
    store.create(&kinds::promise(), &redis_promise()).await.unwrap();
    let rec = reconciler(&store, &registrar);
    rec.reconcile(&promise_key()).await.unwrap();
    assert_eq!(registrar.registered().len(), 1);

    store.delete(&kinds::promise(), &promise_key()).await.unwrap();
    assert_eq!(rec.reconcile(&promise_key()).await.unwrap(), Action::Done);
    assert!(registrar.registered().is_empty());
    assert_eq!(store.dump(&kinds::crd()).len(), 1);
    assert_eq!(store.dump(&kinds::work()).len(), 1);
}
