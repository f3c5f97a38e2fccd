//! Lifecycle of one resource request: finalizer, one pipeline launch, delete cascade.

use std::sync::Arc;

use async_trait::async_trait;
use kratix_core::{kinds, naming, to_dynamic, LabelSelector, ObjectKey, ResourceKind};
use kratix_pipeline::{PipelinePlan, PipelineRequest, PipelineSettings};
use kratix_runtime::{Action, ReconcileError, Reconciler};
use kratix_store::{finalizers, ObjectStore, ObjectStoreExt, StoreError};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::ControllerConfig;

pub struct DynamicController {
    store: Arc<dyn ObjectStore>,
    kind: ResourceKind,
    promise_id: String,
    cluster_selector: LabelSelector,
    images: Vec<String>,
    config: Arc<ControllerConfig>,
    finalizer: String,
}

fn launched_by(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.annotations.as_ref()?.get(naming::PIPELINE_LAUNCHED_ANNOTATION).map(|s| s.as_str())
}

impl DynamicController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        kind: ResourceKind,
        promise_id: String,
        cluster_selector: LabelSelector,
        images: Vec<String>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        let finalizer = naming::cleanup_finalizer(&kind.kind);
        Self { store, kind, promise_id, cluster_selector, images, config, finalizer }
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }
    pub fn finalizer(&self) -> &str { &self.finalizer }

    fn work_key(&self, request_id: &str) -> ObjectKey {
        ObjectKey::namespaced(self.config.platform_namespace.clone(), request_id)
    }

    async fn release(&self, mut obj: DynamicObject, request_id: &str) -> Action {
        finalizers::remove(&mut obj, &self.finalizer);
        match self.store.update(&self.kind, &obj).await {
            Ok(_) => {
                info!(request = %request_id, "work gone; finalizer removed");
                Action::Done
            }
            Err(e) => {
                warn!(request = %request_id, error = %e, "finalizer removal failed; retrying");
                Action::RequeueAfter(self.config.retry_after)
            }
        }
    }

    /// The finalizer is only removed once the Work is confirmed absent.
    async fn delete_cascade(&self, obj: DynamicObject, request_id: &str) -> Action {
        let work = kinds::work();
        let key = self.work_key(request_id);
        match self.store.get_opt(&work, &key).await {
            Ok(None) => self.release(obj, request_id).await,
            Ok(Some(_)) => match self.store.delete(&work, &key).await {
                Ok(()) => {
                    info!(request = %request_id, "work deleted");
                    Action::RequeueAfter(self.config.retry_after)
                }
                Err(e) if e.is_not_found() => self.release(obj, request_id).await,
                Err(e) => {
                    warn!(request = %request_id, error = %e, "work deletion failed; retrying");
                    Action::RequeueAfter(self.config.retry_after)
                }
            },
            Err(e) => {
                warn!(request = %request_id, error = %e, "work lookup failed; retrying");
                Action::RequeueAfter(self.config.retry_after)
            }
        }
    }

    /// Executors launched before the marker existed are found by label.
    async fn executor_exists(&self, request_id: &str) -> Result<bool, StoreError> {
        let selector = LabelSelector::new().with(naming::REQUEST_ID_LABEL, request_id);
        let pods = self.store.list(&kinds::pod(), Some(&self.config.platform_namespace), &selector).await?;
        Ok(!pods.is_empty())
    }

    /// Mark the request as launched with a conditional write on the observed version.
    /// `Ok(None)` means another writer got there first.
    pub(crate) async fn claim(&self, observed: &DynamicObject, pod_name: &str) -> Result<Option<DynamicObject>, StoreError> {
        let mut next = observed.clone();
        next.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(naming::PIPELINE_LAUNCHED_ANNOTATION.to_string(), pod_name.to_string());
        match self.store.update(&self.kind, &next).await {
            Ok(stored) => Ok(Some(stored)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Best effort: drop the marker so the next pass can launch again.
    async fn unclaim(&self, key: &ObjectKey, request_id: &str) {
        let res = async {
            let mut current = self.store.get(&self.kind, key).await?;
            if let Some(a) = current.metadata.annotations.as_mut() {
                a.remove(naming::PIPELINE_LAUNCHED_ANNOTATION);
            }
            self.store.update(&self.kind, &current).await
        }
        .await;
        if let Err(e) = res {
            warn!(request = %request_id, error = %e, "could not clear launch marker");
        }
    }

    async fn launch(&self, key: &ObjectKey, obj: &DynamicObject, request_id: &str) -> Result<Action, ReconcileError> {
        let namespace = key.namespace().unwrap_or(&self.config.platform_namespace);
        let settings = PipelineSettings {
            namespace: self.config.platform_namespace.clone(),
            reader_image: self.config.reader_image.clone(),
            work_creator_image: self.config.work_creator_image.clone(),
            pod_suffix: self.config.pod_suffix(),
        };
        let req = PipelineRequest {
            kind: &self.kind,
            namespace,
            name: &key.name,
            promise_id: &self.promise_id,
            images: &self.images,
            cluster_selector: &self.cluster_selector,
        };
        let plan = match PipelinePlan::build(&req, &settings) {
            Ok(p) => p,
            Err(e) => {
                error!(request = %request_id, error = %e, "cannot plan pipeline; not retrying");
                return Ok(Action::Done);
            }
        };
        let config_map = to_dynamic(&plan.config_map())?;
        let pod = to_dynamic(&plan.pod())?;

        if self.claim(obj, &plan.pod_name).await?.is_none() {
            debug!(request = %request_id, "request changed before launch; retrying");
            return Ok(Action::RequeueAfter(self.config.retry_after));
        }

        // The pod mounts the selector document; without it the writer never starts.
        if let Err(e) = self.store.create_if_absent(&kinds::config_map(), &config_map).await {
            error!(request = %request_id, config_map = %plan.config_map_name, error = %e, "config map creation failed");
            self.unclaim(key, request_id).await;
            return Err(e.into());
        }
        if let Err(e) = self.store.create(&kinds::pod(), &pod).await {
            error!(request = %request_id, pod = %plan.pod_name, error = %e, "pipeline pod creation failed");
            self.unclaim(key, request_id).await;
            return Err(e.into());
        }
        counter!("pipeline_launch_total", 1u64, "promise" => self.promise_id.clone());
        info!(request = %request_id, pod = %plan.pod_name, stages = plan.stages.len(), "pipeline launched");
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for DynamicController {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(mut obj) = self.store.get_opt(&self.kind, key).await? else {
            debug!(kind = %self.kind, request = %key, "request gone");
            return Ok(Action::Done);
        };
        let namespace = key.namespace().unwrap_or(&self.config.platform_namespace);
        let request_id = naming::request_identifier(&self.promise_id, namespace, &key.name);

        if finalizers::is_deleting(&obj) {
            if !finalizers::contains(&obj, &self.finalizer) {
                debug!(request = %request_id, "deleting without finalizer; nothing to clean up");
                return Ok(Action::Done);
            }
            return Ok(self.delete_cascade(obj, &request_id).await);
        }

        if finalizers::add(&mut obj, &self.finalizer) {
            self.store.update(&self.kind, &obj).await?;
            info!(request = %request_id, finalizer = %self.finalizer, "finalizer added");
            return Ok(Action::Done);
        }

        if let Some(pod) = launched_by(&obj) {
            debug!(request = %request_id, pod, "pipeline already launched");
            return Ok(Action::Done);
        }
        if self.executor_exists(&request_id).await? {
            info!(request = %request_id, "pipeline executor already exists; not launching again");
            return Ok(Action::Done);
        }
        self.launch(key, &obj, &request_id).await
    }
}
