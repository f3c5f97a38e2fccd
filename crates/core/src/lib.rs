//! Kratix core types: the data model shared by the controllers, the pipeline and the stores.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod dynamic;
pub mod naming;
pub mod promise;
pub mod selector;
pub mod work;

pub use cluster::Cluster;
pub use dynamic::{from_dynamic, kind_of, to_dynamic};
pub use promise::{BootstrapPhase, BootstrapStatus, Promise, PromiseSpec, PromiseStatus};
pub use selector::LabelSelector;
pub use work::{Replicas, Work, WorkSpec, Workload};

/// API group owning Promise, Work and Cluster.
pub const PLATFORM_GROUP: &str = "platform.kratix.io";
pub const PLATFORM_VERSION: &str = "v1alpha1";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Group/Version/Kind of a stored record. The runtime type descriptor for dynamic kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` ("v1" or "group/v1") and pair it with a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(CoreError::Invalid(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn gvk(&self) -> kube::core::GroupVersionKind {
        kube::core::GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}/{}", self.version, self.kind) } else { write!(f, "{}/{}/{}", self.group, self.version, self.kind) }
    }
}

/// Well-known kinds this control plane reads or writes.
pub mod kinds {
    use super::{ResourceKind, PLATFORM_GROUP, PLATFORM_VERSION};

    pub fn promise() -> ResourceKind { ResourceKind::new(PLATFORM_GROUP, PLATFORM_VERSION, "Promise") }
    pub fn work() -> ResourceKind { ResourceKind::new(PLATFORM_GROUP, PLATFORM_VERSION, "Work") }
    pub fn cluster() -> ResourceKind { ResourceKind::new(PLATFORM_GROUP, PLATFORM_VERSION, "Cluster") }
    pub fn crd() -> ResourceKind { ResourceKind::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition") }
    pub fn pod() -> ResourceKind { ResourceKind::new("", "v1", "Pod") }
    pub fn config_map() -> ResourceKind { ResourceKind::new("", "v1", "ConfigMap") }
    pub fn service_account() -> ResourceKind { ResourceKind::new("", "v1", "ServiceAccount") }
    pub fn cluster_role() -> ResourceKind { ResourceKind::new("rbac.authorization.k8s.io", "v1", "ClusterRole") }
    pub fn cluster_role_binding() -> ResourceKind { ResourceKind::new("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding") }

    /// Kinds served without a CRD.
    pub fn builtin() -> Vec<ResourceKind> {
        vec![promise(), work(), cluster(), crd(), pod(), config_map(), service_account(), cluster_role(), cluster_role_binding()]
    }
}

/// Store key of a single record within a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self { namespace: None, name: name.into() } }

    pub fn of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Self {
        Self { namespace: meta.namespace.clone(), name: meta.name.clone().unwrap_or_default() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}
