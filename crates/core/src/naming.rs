//! Identifiers, labels and the downstream object naming contract.
//!
//! Works are named by identifier, and the placement side derives its object
//! names from those identifiers. Both sides must agree, so all naming lives here.

/// Pipeline executors and config records carry the producing Promise here.
pub const PROMISE_ID_LABEL: &str = "kratix-promise-id";
/// Pipeline executors and config records carry the request identifier here.
pub const REQUEST_ID_LABEL: &str = "kratix-promise-resource-request-id";
/// Set on a resource request once its pipeline has been claimed for launch.
pub const PIPELINE_LAUNCHED_ANNOTATION: &str = "kratix.io/pipeline-launched";

pub fn promise_identifier(name: &str, namespace: &str) -> String {
    format!("{}-{}", name, namespace)
}

/// `<promise-id>-<namespace>-<name>`; names the request's Work and correlates its executor.
pub fn request_identifier(promise_id: &str, namespace: &str, name: &str) -> String {
    format!("{}-{}-{}", promise_id, namespace, name)
}

/// `<lowercase-kind>-cleanup`
pub fn cleanup_finalizer(kind: &str) -> String {
    format!("{}-cleanup", kind.to_lowercase())
}

pub fn pipeline_service_account(promise_id: &str) -> String { format!("{}-sa", promise_id) }
pub fn controller_cluster_role(promise_id: &str) -> String { format!("{}-promise-controller", promise_id) }
pub fn pipeline_cluster_role(promise_id: &str) -> String { format!("{}-promise-pipeline", promise_id) }
pub fn binding_for(role: &str) -> String { format!("{}-binding", role) }
pub fn selectors_config_map(request_id: &str) -> String { format!("cluster-selectors-{}", request_id) }

pub fn pipeline_pod(promise_id: &str, suffix: &str) -> String {
    format!("request-pipeline-{}-{}", promise_id, suffix)
}

/// Object holding a Promise's cluster-wide manifests on one cluster.
pub fn crds_object_name(namespace: &str, promise_id: &str) -> String {
    format!("00-{}-{}-crds.yaml", namespace, promise_id)
}

/// Object holding a resource request's manifests on one cluster.
pub fn resources_object_name(namespace: &str, request_id: &str) -> String {
    format!("01-{}-{}-resources.yaml", namespace, request_id)
}

pub fn crds_bucket(bucket_path: &str) -> String { format!("{}-kratix-crds", bucket_path) }
pub fn resources_bucket(bucket_path: &str) -> String { format!("{}-kratix-resources", bucket_path) }
