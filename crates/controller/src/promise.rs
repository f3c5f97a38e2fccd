//! Promise bootstrap: served API type, Promise-level Work, RBAC, then a
//! lifecycle controller registered for the new kind.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kratix_core::{
    from_dynamic, kinds, naming, to_dynamic, BootstrapPhase, BootstrapStatus, ObjectKey, Promise, Replicas,
    ResourceKind, Work,
};
use kratix_runtime::{Action, ReconcileError, Reconciler, Registrar, Registration};
use kratix_store::{Created, ObjectStore, ObjectStoreExt};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::{rbac, ControllerConfig, DynamicController};

/// Outcome of the side-effect steps of one bootstrap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    failed: Vec<String>,
}

impl BootstrapReport {
    pub fn fail(&mut self, promise: &str, step: &str, err: &dyn fmt::Display) {
        warn!(promise = %promise, step, error = %err, "bootstrap step failed");
        self.failed.push(step.to_string());
    }

    pub fn is_ready(&self) -> bool { self.failed.is_empty() }

    pub fn failed_steps(&self) -> &[String] { &self.failed }

    pub fn status(&self) -> BootstrapStatus {
        BootstrapStatus {
            phase: if self.is_ready() { BootstrapPhase::Ready } else { BootstrapPhase::Degraded },
            failed_steps: self.failed.clone(),
        }
    }
}

pub struct PromiseReconciler {
    store: Arc<dyn ObjectStore>,
    registrar: Arc<dyn Registrar>,
    config: Arc<ControllerConfig>,
}

impl PromiseReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, registrar: Arc<dyn Registrar>, config: Arc<ControllerConfig>) -> Self {
        Self { store, registrar, config }
    }

    /// Stop the lifecycle controller registered under this promise identifier, if any.
    fn forget_promise(&self, promise_id: &str) {
        for (kind, name) in self.registrar.registered() {
            if name == promise_id && self.registrar.deregister(&kind) {
                info!(promise = %promise_id, kind = %kind, "promise gone; lifecycle controller stopped");
            }
        }
    }

    /// Persist the bootstrap outcome, only when it differs from what is stored.
    async fn record(&self, key: &ObjectKey, promise: &Promise, report: &BootstrapReport) {
        let next = report.status();
        let current = promise.status.as_ref().and_then(|s| s.bootstrap.as_ref());
        if current == Some(&next) {
            return;
        }
        let status = match serde_json::to_value(&next) {
            Ok(v) => serde_json::json!({ "bootstrap": v }),
            Err(e) => {
                error!(promise = %key, error = %e, "cannot encode bootstrap status");
                return;
            }
        };
        match self.store.update_status(&kinds::promise(), key, status).await {
            Ok(_) => info!(promise = %key, phase = ?next.phase, failed = ?next.failed_steps, "bootstrap status updated"),
            Err(e) => warn!(promise = %key, error = %e, "bootstrap status update failed"),
        }
    }

    /// Create-if-absent one bootstrap object. False when the step failed.
    async fn submit(&self, promise_id: &str, report: &mut BootstrapReport, step: &str, kind: &ResourceKind, obj: &DynamicObject) -> bool {
        match self.store.create_if_absent(kind, obj).await {
            Ok(Created::New) => {
                debug!(promise = %promise_id, step, "created");
                true
            }
            Ok(Created::Existing) => {
                debug!(promise = %promise_id, step, "already exists");
                true
            }
            Err(e) => {
                report.fail(promise_id, step, &e);
                false
            }
        }
    }
}

#[async_trait]
impl Reconciler for PromiseReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let promise_id = naming::promise_identifier(&key.name, key.namespace().unwrap_or("default"));
        let Some(obj) = self.store.get_opt(&kinds::promise(), key).await? else {
            self.forget_promise(&promise_id);
            return Ok(Action::Done);
        };
        let promise: Promise = match from_dynamic(&obj) {
            Ok(p) => p,
            Err(e) => {
                error!(promise = %key, error = %e, "undecodable promise; not retrying");
                return Ok(Action::Done);
            }
        };
        let mut report = BootstrapReport::default();

        // 1. decode the API type
        let api = match promise.spec.decode_api_type().and_then(|api| promise.spec.validate().map(|_| api)) {
            Ok(api) => api,
            Err(e) => {
                report.fail(&promise_id, "decode", &e);
                self.record(key, &promise, &report).await;
                return Ok(Action::Done);
            }
        };

        // 2. submit it
        let crd = match to_dynamic(&api.definition) {
            Ok(crd) => crd,
            Err(e) => {
                report.fail(&promise_id, "api-type", &e);
                self.record(key, &promise, &report).await;
                return Ok(Action::Done);
            }
        };
        if let Err(e) = self.store.create_if_absent(&kinds::crd(), &crd).await {
            report.fail(&promise_id, "api-type", &e);
            self.record(key, &promise, &report).await;
            return Ok(Action::Done);
        }

        // 3. wait until the new kind is served
        if !self.store.is_served(&api.kind).await? {
            info!(promise = %promise_id, kind = %api.kind, "api type not served yet; requeue");
            return Ok(Action::RequeueAfter(self.config.retry_after));
        }

        // 4. Promise-level Work
        if promise.spec.cluster_wide_manifests.is_empty() {
            debug!(promise = %promise_id, "no cluster-wide manifests; skipping promise work");
        } else {
            let work = Work::new(
                promise_id.clone(),
                self.config.platform_namespace.clone(),
                Replicas::AllMatching,
                promise.spec.cluster_selector.clone(),
                promise.spec.cluster_wide_manifests.clone(),
            )
            .and_then(|w| to_dynamic(&w));
            match work {
                Ok(w) => {
                    if self.submit(&promise_id, &mut report, "work", &kinds::work(), &w).await {
                        counter!("work_create_total", 1u64, "source" => "promise", "outcome" => "ok");
                    }
                }
                Err(e) => report.fail(&promise_id, "work", &e),
            }
        }

        // 5. RBAC and the pipeline service account
        match rbac::bundle(&promise_id, &api.kind.group, &api.plural, &self.config) {
            Ok(objects) => {
                for o in &objects {
                    self.submit(&promise_id, &mut report, o.step, &o.kind, &o.object).await;
                }
            }
            Err(e) => report.fail(&promise_id, "rbac", &e),
        }

        // 6. lifecycle controller for the new kind
        let controller = DynamicController::new(
            Arc::clone(&self.store),
            api.kind.clone(),
            promise_id.clone(),
            promise.spec.cluster_selector.clone(),
            promise.spec.pipeline_images.clone(),
            Arc::clone(&self.config),
        );
        match self.registrar.register(api.kind.clone(), &promise_id, Arc::new(controller)) {
            Registration::Started => info!(promise = %promise_id, kind = %api.kind, "lifecycle controller registered"),
            Registration::AlreadyRegistered => debug!(promise = %promise_id, kind = %api.kind, "lifecycle controller already running"),
        }

        self.record(key, &promise, &report).await;
        Ok(Action::Done)
    }
}
