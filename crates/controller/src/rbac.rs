//! Access rules and execution identity generated for each Promise.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kratix_core::{kinds, naming, to_dynamic, CoreError, ResourceKind, PLATFORM_GROUP};
use kube::core::DynamicObject;

use crate::ControllerConfig;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// One object to submit during bootstrap, with the step name reported on failure.
#[derive(Debug, Clone)]
pub struct RbacObject {
    pub step: &'static str,
    pub kind: ResourceKind,
    pub object: DynamicObject,
}

fn rule(group: &str, resource: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn named(name: String) -> ObjectMeta {
    ObjectMeta { name: Some(name), ..Default::default() }
}

/// Long-running controller: full control of the new kind and its sub-resources.
pub fn controller_role(promise_id: &str, group: &str, plural: &str) -> ClusterRole {
    ClusterRole {
        metadata: named(naming::controller_cluster_role(promise_id)),
        rules: Some(vec![
            rule(group, plural, &["get", "list", "update", "create", "patch", "delete", "watch"]),
            rule(group, &format!("{}/finalizers", plural), &["update"]),
            rule(group, &format!("{}/status", plural), &["get", "update", "patch"]),
            rule("", "configmaps", &["create"]),
        ]),
        ..Default::default()
    }
}

/// Pipeline stages: read and write the new kind, write Works.
pub fn pipeline_role(promise_id: &str, group: &str, plural: &str) -> ClusterRole {
    ClusterRole {
        metadata: named(naming::pipeline_cluster_role(promise_id)),
        rules: Some(vec![
            rule(group, plural, &["get", "list", "update", "create", "patch"]),
            rule(PLATFORM_GROUP, "works", &["get", "update", "create", "patch"]),
        ]),
        ..Default::default()
    }
}

pub fn binding(role: &ClusterRole, sa_namespace: &str, sa_name: &str) -> ClusterRoleBinding {
    let role_name = role.metadata.name.clone().unwrap_or_default();
    ClusterRoleBinding {
        metadata: named(naming::binding_for(&role_name)),
        role_ref: RoleRef { api_group: RBAC_GROUP.into(), kind: "ClusterRole".into(), name: role_name },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: sa_name.into(),
            namespace: Some(sa_namespace.into()),
            ..Default::default()
        }]),
    }
}

pub fn pipeline_service_account(promise_id: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(naming::pipeline_service_account(promise_id)),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Everything step 5 of bootstrap submits, in submission order.
pub fn bundle(promise_id: &str, group: &str, plural: &str, config: &ControllerConfig) -> Result<Vec<RbacObject>, CoreError> {
    let controller = controller_role(promise_id, group, plural);
    let pipeline = pipeline_role(promise_id, group, plural);
    let pipeline_sa = naming::pipeline_service_account(promise_id);
    Ok(vec![
        RbacObject {
            step: "controller-role",
            kind: kinds::cluster_role(),
            object: to_dynamic(&controller)?,
        },
        RbacObject {
            step: "controller-binding",
            kind: kinds::cluster_role_binding(),
            object: to_dynamic(&binding(&controller, &config.controller_sa_namespace, &config.controller_sa_name))?,
        },
        RbacObject {
            step: "pipeline-role",
            kind: kinds::cluster_role(),
            object: to_dynamic(&pipeline)?,
        },
        RbacObject {
            step: "pipeline-binding",
            kind: kinds::cluster_role_binding(),
            object: to_dynamic(&binding(&pipeline, &config.platform_namespace, &pipeline_sa))?,
        },
        RbacObject {
            step: "service-account",
            kind: kinds::service_account(),
            object: to_dynamic(&pipeline_service_account(promise_id, &config.platform_namespace))?,
        },
    ])
}
