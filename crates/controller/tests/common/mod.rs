#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kratix_controller::ControllerConfig;
use kratix_core::{ObjectKey, ResourceKind};
use kratix_runtime::{Reconciler, Registrar, Registration};
use kube::core::DynamicObject;

pub const REDIS_PROMISE: &str = r#"
apiVersion: platform.kratix.io/v1alpha1
kind: Promise
metadata:
  name: redis
  namespace: default
spec:
  clusterSelector:
    env: dev
  xaasRequestPipeline:
    - imageA
  workerClusterResources:
    - apiVersion: v1
      kind: Namespace
      metadata:
        name: redis-operator
  xaasCrd:
    apiVersion: apiextensions.k8s.io/v1
    kind: CustomResourceDefinition
    metadata:
      name: redis.marketplace.kratix.io
    spec:
      group: marketplace.kratix.io
      scope: Namespaced
      names:
        plural: redis
        singular: redis
        kind: Redis
      versions:
        - name: v1alpha1
          served: true
          storage: true
"#;

pub fn redis_promise() -> DynamicObject {
    let value: serde_json::Value = serde_yaml::from_str(REDIS_PROMISE).unwrap();
    serde_json::from_value(value).unwrap()
}

pub fn redis_kind() -> ResourceKind {
    ResourceKind::new("marketplace.kratix.io", "v1alpha1", "Redis")
}

pub fn promise_key() -> ObjectKey {
    ObjectKey::namespaced("default", "redis")
}

pub fn request_key(name: &str) -> ObjectKey {
    ObjectKey::namespaced("default", name)
}

pub fn redis_request(name: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "marketplace.kratix.io/v1alpha1",
        "kind": "Redis",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"size": "small"}
    }))
    .unwrap()
}

pub fn config() -> Arc<ControllerConfig> {
    Arc::new(ControllerConfig { pod_suffix: Some("abcde".into()), ..ControllerConfig::default() })
}

pub fn fast_config() -> Arc<ControllerConfig> {
    Arc::new(ControllerConfig { retry_after: Duration::from_millis(50), ..ControllerConfig::default() })
}

/// Dispatch table that only records; reconcilers are driven by hand.
#[derive(Default)]
pub struct RecordingRegistrar {
    entries: Mutex<Vec<(ResourceKind, String, Arc<dyn Reconciler>)>>,
    pub attempts: Mutex<usize>,
}

impl RecordingRegistrar {
    pub fn reconciler(&self, kind: &ResourceKind) -> Option<Arc<dyn Reconciler>> {
        self.entries.lock().unwrap().iter().find(|(k, _, _)| k == kind).map(|(_, _, r)| Arc::clone(r))
    }

    pub fn attempts(&self) -> usize { *self.attempts.lock().unwrap() }
}

impl Registrar for RecordingRegistrar {
    fn register(&self, kind: ResourceKind, name: &str, reconciler: Arc<dyn Reconciler>) -> Registration {
        *self.attempts.lock().unwrap() += 1;
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|(k, _, _)| *k == kind) {
            return Registration::AlreadyRegistered;
        }
        entries.push((kind, name.to_string(), reconciler));
        Registration::Started
    }

    fn deregister(&self, kind: &ResourceKind) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(k, _, _)| k != kind);
        before != entries.len()
    }

    fn registered(&self) -> Vec<(ResourceKind, String)> {
        self.entries.lock().unwrap().iter().map(|(k, n, _)| (k.clone(), n.clone())).collect()
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() { return true; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
