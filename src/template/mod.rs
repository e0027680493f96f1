//! Desired-state builders for every managed component
//!
//! Each module turns an instance spec into plain `k8s-openapi` objects; the
//! controller wraps them into descriptors for the apply engine. Builders are
//! pure functions of the spec and the version catalog - no I/O, recomputed
//! on every pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, PodSecurityContext, SecretKeySelector, ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::Coroot;

pub mod clickhouse;
pub mod cluster_agent;
pub mod coroot;
pub mod node_agent;
pub mod prometheus;

/// Value of the `app.kubernetes.io/managed-by` label on every object
pub const MANAGED_BY: &str = "coroot-operator";

/// `{instance}-{component}` name for a namespaced object
pub fn component_name(cr: &Coroot, component: &str) -> String {
    format!("{}-{}", cr.name_any(), component)
}

/// Standard labels for a component of an instance
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub fn labels(cr: &Coroot, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        ),
        ("app.kubernetes.io/part-of".to_string(), cr.name_any()),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
    ])
}

/// Metadata for a namespaced object of a component
pub(crate) fn metadata(cr: &Coroot, name: String, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cr.namespace(),
        labels: Some(labels(cr, component)),
        ..Default::default()
    }
}

/// ServiceAccount for a component, named `{instance}-{component}`
pub fn service_account(cr: &Coroot, component: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(cr, component_name(cr, component), component),
        ..Default::default()
    }
}

/// Endpoint agents send their telemetry to: the instance's own collector,
/// or the external Coroot URL in agents-only mode
pub fn collector_endpoint(cr: &Coroot) -> String {
    match &cr.spec.agents_only {
        Some(agents_only) => agents_only.coroot_url.clone(),
        None => format!(
            "http://{}-coroot.{}:8080",
            cr.name_any(),
            cr.namespace().unwrap_or_default()
        ),
    }
}

/// Pod security context for everything that does not need root
pub(crate) fn nonroot_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(65534),
        run_as_group: Some(65534),
        fs_group: Some(65534),
        ..Default::default()
    }
}

/// Plain-value environment variable
pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment variable sourced from a secret key
pub(crate) fn env_var_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    env_var_from_selector(
        name,
        SecretKeySelector {
            name: Some(secret.to_string()),
            key: key.to_string(),
            ..Default::default()
        },
    )
}

/// Environment variable sourced from an existing secret key selector
pub(crate) fn env_var_from_selector(name: &str, selector: SecretKeySelector) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    }
}
