//! Cluster-agent Deployment and its RBAC
//!
//! The cluster-agent discovers cluster-level state (workloads, nodes,
//! databases) and ships it to the collector. Its ClusterRole and binding are
//! cluster-scoped and shared semantics apply: they carry no owner reference
//! and are cleaned up only when the last instance disappears.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::Coroot;
use crate::template::{
    collector_endpoint, component_name, env_var, labels, metadata, nonroot_security_context,
};
use crate::versions::{App, VersionCatalog};

/// Name of the cluster-scoped RBAC objects for an instance.
///
/// Includes the namespace so instances with the same name in different
/// namespaces cannot collide cluster-wide.
pub fn cluster_scoped_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}-cluster-agent")
}

/// ClusterRole granting the cluster-agent read access to cluster state
pub fn cluster_role(cr: &Coroot) -> ClusterRole {
    let read = ["get", "list", "watch"].map(String::from).to_vec();
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(cluster_scoped_name(
                &cr.namespace().unwrap_or_default(),
                &cr.name_any(),
            )),
            labels: Some(labels(cr, "cluster-agent")),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(
                    [
                        "namespaces",
                        "nodes",
                        "pods",
                        "services",
                        "endpoints",
                        "persistentvolumes",
                        "persistentvolumeclaims",
                        "configmaps",
                    ]
                    .map(String::from)
                    .to_vec(),
                ),
                verbs: read.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["apps".to_string()]),
                resources: Some(
                    ["deployments", "replicasets", "daemonsets", "statefulsets"]
                        .map(String::from)
                        .to_vec(),
                ),
                verbs: read.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["batch".to_string()]),
                resources: Some(["jobs", "cronjobs"].map(String::from).to_vec()),
                verbs: read.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["storage.k8s.io".to_string()]),
                resources: Some(
                    ["storageclasses", "volumeattachments"]
                        .map(String::from)
                        .to_vec(),
                ),
                verbs: read,
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Binding of the cluster-agent ServiceAccount to its ClusterRole
pub fn cluster_role_binding(cr: &Coroot) -> ClusterRoleBinding {
    let name = cluster_scoped_name(&cr.namespace().unwrap_or_default(), &cr.name_any());
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(labels(cr, "cluster-agent")),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: component_name(cr, "cluster-agent"),
            namespace: cr.namespace(),
            ..Default::default()
        }]),
    }
}

/// Build the cluster-agent Deployment for an instance
pub fn deployment(cr: &Coroot, catalog: &VersionCatalog) -> Deployment {
    let component = "cluster-agent";
    let ls = labels(cr, component);
    let spec = &cr.spec.cluster_agent;

    let mut env = vec![
        env_var("COLLECTOR_ENDPOINT", collector_endpoint(cr)),
        env_var("API_KEY", cr.spec.api_key.clone().unwrap_or_default()),
        env_var("SCRAPE_INTERVAL", cr.spec.refresh_interval()),
    ];
    env.extend(spec.env.iter().cloned());

    Deployment {
        metadata: metadata(cr, component_name(cr, component), component),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(ls.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ls),
                    annotations: if spec.pod_annotations.is_empty() {
                        None
                    } else {
                        Some(spec.pod_annotations.clone())
                    },
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(component_name(cr, component)),
                    security_context: Some(nonroot_security_context()),
                    affinity: spec.affinity.clone(),
                    tolerations: if spec.tolerations.is_empty() {
                        None
                    } else {
                        Some(spec.tolerations.clone())
                    },
                    containers: vec![Container {
                        name: component.to_string(),
                        image: Some(catalog.image(App::ClusterAgent, spec.version.as_deref())),
                        env: Some(env),
                        resources: spec.resources.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CorootSpec;

    fn instance() -> Coroot {
        let mut cr = Coroot::new("example", CorootSpec::default());
        cr.metadata.namespace = Some("monitoring".to_string());
        cr
    }

    #[test]
    fn rbac_names_are_namespace_qualified() {
        let cr = instance();
        let role = cluster_role(&cr);
        let binding = cluster_role_binding(&cr);
        assert_eq!(
            role.metadata.name.as_deref(),
            Some("monitoring-example-cluster-agent")
        );
        assert_eq!(binding.role_ref.name, "monitoring-example-cluster-agent");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, "example-cluster-agent");
        assert_eq!(subject.namespace.as_deref(), Some("monitoring"));
    }

    #[test]
    fn cluster_role_is_read_only() {
        let role = cluster_role(&instance());
        for rule in role.rules.unwrap() {
            assert_eq!(rule.verbs, vec!["get", "list", "watch"]);
        }
    }
}
