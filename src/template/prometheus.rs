//! Bundled Prometheus: Deployment, storage claim, and Service
//!
//! Coroot pushes metrics over remote write, so the bundled Prometheus runs
//! with the remote-write receiver enabled and the image's stock
//! configuration file.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::Coroot;
use crate::template::{component_name, labels, metadata, nonroot_security_context};
use crate::versions::{App, VersionCatalog};

const COMPONENT: &str = "prometheus";
const DEFAULT_RETENTION: &str = "2d";

/// Storage claim backing the Prometheus TSDB
pub fn pvc(cr: &Coroot) -> PersistentVolumeClaim {
    let storage = &cr.spec.prometheus.storage;
    PersistentVolumeClaim {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    storage.size_or("10Gi"),
                )])),
                ..Default::default()
            }),
            storage_class_name: storage.class_name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Prometheus Deployment for an instance
pub fn deployment(cr: &Coroot, catalog: &VersionCatalog) -> Deployment {
    let ls = labels(cr, COMPONENT);
    let spec = &cr.spec.prometheus;
    let retention = spec.retention.as_deref().unwrap_or(DEFAULT_RETENTION);

    Deployment {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // A single pod owns the TSDB volume; rolling updates would
            // deadlock on the claim.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
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
                    service_account_name: Some(component_name(cr, COMPONENT)),
                    security_context: Some(nonroot_security_context()),
                    affinity: spec.affinity.clone(),
                    tolerations: if spec.tolerations.is_empty() {
                        None
                    } else {
                        Some(spec.tolerations.clone())
                    },
                    containers: vec![Container {
                        name: COMPONENT.to_string(),
                        image: Some(catalog.image(App::Prometheus, None)),
                        args: Some(vec![
                            "--config.file=/etc/prometheus/prometheus.yml".to_string(),
                            "--storage.tsdb.path=/prometheus".to_string(),
                            format!("--storage.tsdb.retention.time={retention}"),
                            "--web.enable-remote-write-receiver".to_string(),
                        ]),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: 9090,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        resources: spec.resources.clone(),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "data".to_string(),
                            mount_path: "/prometheus".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: component_name(cr, COMPONENT),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service in front of the Prometheus pod
pub fn service(cr: &Coroot) -> Service {
    let ls = labels(cr, COMPONENT);
    Service {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        spec: Some(ServiceSpec {
            selector: Some(ls),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port: 9090,
                target_port: Some(IntOrString::String("http".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CorootSpec, PrometheusSpec};

    fn instance() -> Coroot {
        let mut cr = Coroot::new("example", CorootSpec::default());
        cr.metadata.namespace = Some("monitoring".to_string());
        cr
    }

    #[test]
    fn retention_defaults_and_overrides() {
        let dep = deployment(&instance(), &VersionCatalog::default());
        let args = dep.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert!(args.contains(&"--storage.tsdb.retention.time=2d".to_string()));

        let mut cr = instance();
        cr.spec.prometheus = PrometheusSpec {
            retention: Some("4w".to_string()),
            ..Default::default()
        };
        let dep = deployment(&cr, &VersionCatalog::default());
        let args = dep.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert!(args.contains(&"--storage.tsdb.retention.time=4w".to_string()));
    }

    #[test]
    fn deployment_recreates_instead_of_rolling() {
        let dep = deployment(&instance(), &VersionCatalog::default());
        assert_eq!(
            dep.spec.unwrap().strategy.unwrap().type_.as_deref(),
            Some("Recreate")
        );
    }
}
