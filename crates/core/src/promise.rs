//! Promise: a declared API type plus the pipeline that renders its instances.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{naming, CoreError, LabelSelector, ResourceKind, PLATFORM_GROUP, PLATFORM_VERSION};

fn default_api_version() -> String { format!("{}/{}", PLATFORM_GROUP, PLATFORM_VERSION) }
fn default_kind() -> String { "Promise".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promise {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PromiseSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PromiseStatus>,
}

/// Wire names follow the platform.kratix.io/v1alpha1 Promise CRD; the descriptive names are accepted too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseSpec {
    /// Embedded CustomResourceDefinition for the new API type.
    #[serde(rename = "xaasCrd", alias = "apiSchema", default)]
    pub api_schema: serde_json::Value,
    #[serde(default)]
    pub cluster_selector: LabelSelector,
    /// Ordered pipeline images run for every resource request.
    #[serde(rename = "xaasRequestPipeline", alias = "pipelineImages", default)]
    pub pipeline_images: Vec<String>,
    #[serde(rename = "workerClusterResources", alias = "clusterWideManifests", default)]
    pub cluster_wide_manifests: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromiseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapPhase {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapStatus {
    pub phase: BootstrapPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_steps: Vec<String>,
}

/// The API type a Promise materializes, decoded from its embedded definition.
#[derive(Debug, Clone)]
pub struct ApiType {
    pub definition: CustomResourceDefinition,
    pub kind: ResourceKind,
    pub plural: String,
}

impl Promise {
    pub fn new(name: &str, namespace: &str, spec: PromiseSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or("default") }

    /// `<name>-<namespace>`; names the Promise-level Work and every per-Promise object.
    pub fn identifier(&self) -> String { naming::promise_identifier(self.name(), self.namespace()) }
}

impl PromiseSpec {
    /// Decode the embedded definition. The first served version becomes the watched version.
    pub fn decode_api_type(&self) -> Result<ApiType, CoreError> {
        if self.api_schema.is_null() {
            return Err(CoreError::Invalid("promise declares no API type".into()));
        }
        let definition: CustomResourceDefinition = serde_json::from_value(self.api_schema.clone())?;
        let version = definition
            .spec
            .versions
            .first()
            .map(|v| v.name.clone())
            .ok_or_else(|| CoreError::Invalid("API type declares no versions".into()))?;
        let names = &definition.spec.names;
        if definition.spec.group.is_empty() || names.kind.is_empty() || names.plural.is_empty() {
            return Err(CoreError::Invalid("API type needs a group, kind and plural".into()));
        }
        let kind = ResourceKind::new(definition.spec.group.clone(), version, names.kind.clone());
        let plural = names.plural.clone();
        Ok(ApiType { definition, kind, plural })
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pipeline_images.is_empty() {
            return Err(CoreError::Invalid("promise declares no pipeline images".into()));
        }
        if let Some(bad) = self.pipeline_images.iter().find(|i| i.trim().is_empty()) {
            return Err(CoreError::Invalid(format!("blank pipeline image reference: {:?}", bad)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_PROMISE: &str = r#"
apiVersion: platform.kratix.io/v1alpha1
kind: Promise
metadata:
  name: redis-promise
  namespace: default
spec:
  clusterSelector:
    environment: dev
  xaasRequestPipeline:
    - syntasso/kustomize-redis
  workerClusterResources:
    - apiVersion: v1
      kind: Namespace
      metadata:
        name: a-non-crd-resource
  xaasCrd:
    apiVersion: apiextensions.k8s.io/v1
    kind: CustomResourceDefinition
    metadata:
      name: redis.redis.redis.opstreelabs.in
    spec:
      group: redis.redis.opstreelabs.in
      scope: Namespaced
      names:
        plural: redis
        singular: redis
        kind: Redis
      versions:
        - name: v1beta1
          served: true
          storage: true
"#;

    #[test]
    fn decodes_promise_and_embedded_api_type() {
        let promise: Promise = serde_yaml::from_str(REDIS_PROMISE).unwrap();
        assert_eq!(promise.identifier(), "redis-promise-default");
        assert_eq!(promise.spec.cluster_selector.get("environment"), Some("dev"));
        assert_eq!(promise.spec.pipeline_images, vec!["syntasso/kustomize-redis"]);
        assert_eq!(promise.spec.cluster_wide_manifests.len(), 1);
        promise.spec.validate().unwrap();

        let api = promise.spec.decode_api_type().unwrap();
        assert_eq!(api.kind, ResourceKind::new("redis.redis.opstreelabs.in", "v1beta1", "Redis"));
        assert_eq!(api.plural, "redis");
    }

    #[test]
    fn accepts_descriptive_field_names() {
        let json = serde_json::json!({
            "metadata": {"name": "redis", "namespace": "default"},
            "spec": {"apiSchema": null, "pipelineImages": ["imageA"], "clusterWideManifests": []}
        });
        let promise: Promise = serde_json::from_value(json).unwrap();
        assert_eq!(promise.kind, "Promise");
        assert_eq!(promise.spec.pipeline_images, vec!["imageA"]);
    }

    #[test]
    fn rejects_missing_or_versionless_api_type() {
        let mut spec = PromiseSpec::default();
        assert!(spec.decode_api_type().is_err());

        spec.api_schema = serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "redis.example.com"},
            "spec": {"group": "example.com", "scope": "Namespaced", "names": {"plural": "redis", "kind": "Redis"}, "versions": []}
        });
        assert!(spec.decode_api_type().is_err());

        spec.api_schema = serde_json::json!({"spec": "not a definition"});
        assert!(spec.decode_api_type().is_err());
    }

    #[test]
    fn validate_requires_a_pipeline() {
        let mut spec = PromiseSpec::default();
        assert!(spec.validate().is_err());
        spec.pipeline_images = vec!["  ".into()];
        assert!(spec.validate().is_err());
        spec.pipeline_images = vec!["imageA".into()];
        assert!(spec.validate().is_ok());
    }
}
