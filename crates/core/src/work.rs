//! Work: the rendered placement artifact consumed by the scheduler.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{CoreError, LabelSelector, PLATFORM_GROUP, PLATFORM_VERSION};

/// Wire value meaning "one copy per matching cluster".
pub const WORKER_RESOURCE_REPLICAS: i32 = -1;
/// Wire value used for resource-request Works: exactly one matching cluster.
pub const RESOURCE_REQUEST_REPLICAS: i32 = 1;

/// Fan-out of a Work across the clusters its selector matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Replicas {
    AllMatching,
    Exactly(u32),
}

impl TryFrom<i32> for Replicas {
    type Error = CoreError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            WORKER_RESOURCE_REPLICAS => Ok(Replicas::AllMatching),
            n if n > 0 => Ok(Replicas::Exactly(n as u32)),
            n => Err(CoreError::Invalid(format!("replicas must be positive or {}, got {}", WORKER_RESOURCE_REPLICAS, n))),
        }
    }
}

impl From<Replicas> for i32 {
    fn from(r: Replicas) -> i32 {
        match r {
            Replicas::AllMatching => WORKER_RESOURCE_REPLICAS,
            Replicas::Exactly(n) => n.min(i32::MAX as u32) as i32,
        }
    }
}

fn default_api_version() -> String { format!("{}/{}", PLATFORM_GROUP, PLATFORM_VERSION) }
fn default_kind() -> String { "Work".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: WorkSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSpec {
    pub replicas: Replicas,
    #[serde(default)]
    pub cluster_selector: LabelSelector,
    pub workload: Workload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub manifests: Vec<serde_json::Value>,
}

impl Work {
    /// Build a Work; refuses an empty manifest list.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        replicas: Replicas,
        cluster_selector: LabelSelector,
        manifests: Vec<serde_json::Value>,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        if manifests.is_empty() {
            return Err(CoreError::Invalid(format!("work {} has no manifests", name)));
        }
        Ok(Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta { name: Some(name), namespace: Some(namespace.into()), ..Default::default() },
            spec: WorkSpec { replicas, cluster_selector, workload: Workload { manifests } },
        })
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }
    pub fn manifests(&self) -> &[serde_json::Value] { &self.spec.workload.manifests }
}
