//! Bundled ClickHouse: keeper ensemble, per-shard server StatefulSets,
//! storage claims, and Services

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::{Coroot, StorageSpec};
use crate::template::{component_name, env_var_from_secret, labels, metadata, nonroot_security_context};
use crate::versions::{App, VersionCatalog};

const COMPONENT: &str = "clickhouse";
const KEEPER_COMPONENT: &str = "clickhouse-keeper";
const KEEPER_REPLICAS: i32 = 3;

/// Name and key of the generated ClickHouse password secret
pub fn password_secret(cr: &Coroot) -> (String, String) {
    (component_name(cr, COMPONENT), "password".to_string())
}

fn claim_spec(storage: &StorageSpec) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
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
    }
}

fn data_volume_claim_template(cr: &Coroot, storage: &StorageSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            namespace: cr.namespace(),
            ..Default::default()
        },
        spec: Some(claim_spec(storage)),
        ..Default::default()
    }
}

/// Pod ordinal exposed to the container, used as the keeper server id
fn pod_index_env(name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.labels['apps.kubernetes.io/pod-index']".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Keeper (coordination service)
// =============================================================================

/// Headless Service for keeper raft peer discovery
pub fn keeper_service_headless(cr: &Coroot) -> Service {
    let ls = labels(cr, KEEPER_COMPONENT);
    Service {
        metadata: metadata(
            cr,
            format!("{}-headless", component_name(cr, KEEPER_COMPONENT)),
            KEEPER_COMPONENT,
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            // Peers must resolve each other before the ensemble is ready.
            publish_not_ready_addresses: Some(true),
            selector: Some(ls),
            ports: Some(vec![
                ServicePort {
                    name: Some("client".to_string()),
                    port: 9181,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("raft".to_string()),
                    port: 9234,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Storage claims for the keeper ensemble, named the way its StatefulSet
/// expects
pub fn keeper_pvcs(cr: &Coroot) -> Vec<PersistentVolumeClaim> {
    let ls = labels(cr, KEEPER_COMPONENT);
    let storage = &cr.spec.clickhouse.keeper.storage;
    (0..KEEPER_REPLICAS)
        .map(|replica| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(format!(
                    "data-{}-{replica}",
                    component_name(cr, KEEPER_COMPONENT)
                )),
                namespace: cr.namespace(),
                labels: Some(ls.clone()),
                ..Default::default()
            },
            spec: Some(claim_spec(storage)),
            ..Default::default()
        })
        .collect()
}

/// Build the keeper StatefulSet for an instance
pub fn keeper_stateful_set(cr: &Coroot, catalog: &VersionCatalog) -> StatefulSet {
    let ls = labels(cr, KEEPER_COMPONENT);
    let spec = &cr.spec.clickhouse.keeper;

    StatefulSet {
        metadata: metadata(cr, component_name(cr, KEEPER_COMPONENT), KEEPER_COMPONENT),
        spec: Some(StatefulSetSpec {
            service_name: format!("{}-headless", component_name(cr, KEEPER_COMPONENT)),
            replicas: Some(KEEPER_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(ls.clone()),
                ..Default::default()
            },
            volume_claim_templates: Some(vec![data_volume_claim_template(cr, &spec.storage)]),
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
                    service_account_name: Some(component_name(cr, KEEPER_COMPONENT)),
                    security_context: Some(nonroot_security_context()),
                    affinity: spec.affinity.clone(),
                    tolerations: if spec.tolerations.is_empty() {
                        None
                    } else {
                        Some(spec.tolerations.clone())
                    },
                    containers: vec![Container {
                        name: KEEPER_COMPONENT.to_string(),
                        image: Some(catalog.image(App::ClickhouseKeeper, None)),
                        env: Some(vec![pod_index_env("KEEPER_SERVER_ID")]),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("client".to_string()),
                                container_port: 9181,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("raft".to_string()),
                                container_port: 9234,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                        ]),
                        resources: spec.resources.clone(),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "data".to_string(),
                            mount_path: "/var/lib/clickhouse-keeper".to_string(),
                            ..Default::default()
                        }]),
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

// =============================================================================
// ClickHouse servers
// =============================================================================

/// Headless Service governing the server StatefulSets
pub fn service_headless(cr: &Coroot) -> Service {
    let ls = labels(cr, COMPONENT);
    Service {
        metadata: metadata(
            cr,
            format!("{}-headless", component_name(cr, COMPONENT)),
            COMPONENT,
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(ls),
            ports: Some(vec![ServicePort {
                name: Some("native".to_string()),
                port: 9000,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Client Service in front of every shard
pub fn service(cr: &Coroot) -> Service {
    let ls = labels(cr, COMPONENT);
    Service {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        spec: Some(ServiceSpec {
            selector: Some(ls),
            ports: Some(vec![ServicePort {
                name: Some("native".to_string()),
                protocol: Some("TCP".to_string()),
                port: 9000,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Storage claims for every shard and replica, named the way the shard
/// StatefulSets expect
pub fn pvcs(cr: &Coroot) -> Vec<PersistentVolumeClaim> {
    let ls = labels(cr, COMPONENT);
    let storage = &cr.spec.clickhouse.storage;
    let mut claims = Vec::new();
    for shard in 0..cr.spec.clickhouse_shards() {
        for replica in 0..cr.spec.clickhouse_replicas() {
            claims.push(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(format!(
                        "data-{}-shard-{shard}-{replica}",
                        component_name(cr, COMPONENT)
                    )),
                    namespace: cr.namespace(),
                    labels: Some(ls.clone()),
                    ..Default::default()
                },
                spec: Some(claim_spec(storage)),
                ..Default::default()
            });
        }
    }
    claims
}

/// One StatefulSet per shard
pub fn stateful_sets(cr: &Coroot, catalog: &VersionCatalog) -> Vec<StatefulSet> {
    (0..cr.spec.clickhouse_shards())
        .map(|shard| shard_stateful_set(cr, catalog, shard))
        .collect()
}

fn shard_stateful_set(cr: &Coroot, catalog: &VersionCatalog, shard: i32) -> StatefulSet {
    let spec = &cr.spec.clickhouse;
    let mut ls = labels(cr, COMPONENT);
    let mut pod_labels = ls.clone();
    // Shards share the component labels (and the client Service), but each
    // StatefulSet must select only its own pods.
    pod_labels.insert("coroot.com/shard".to_string(), shard.to_string());
    ls.insert("coroot.com/shard".to_string(), shard.to_string());

    let (secret, key) = password_secret(cr);
    let keeper_host = format!(
        "{}-headless.{}",
        component_name(cr, KEEPER_COMPONENT),
        cr.namespace().unwrap_or_default()
    );

    StatefulSet {
        metadata: metadata(
            cr,
            format!("{}-shard-{shard}", component_name(cr, COMPONENT)),
            COMPONENT,
        ),
        spec: Some(StatefulSetSpec {
            service_name: format!("{}-headless", component_name(cr, COMPONENT)),
            replicas: Some(cr.spec.clickhouse_replicas()),
            selector: LabelSelector {
                match_labels: Some(ls),
                ..Default::default()
            },
            volume_claim_templates: Some(vec![data_volume_claim_template(cr, &spec.storage)]),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
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
                        image: Some(catalog.image(App::Clickhouse, None)),
                        env: Some(vec![
                            env_var_from_secret("CLICKHOUSE_PASSWORD", &secret, &key),
                            EnvVar {
                                name: "KEEPER_HOST".to_string(),
                                value: Some(keeper_host.clone()),
                                ..Default::default()
                            },
                            pod_index_env("REPLICA_ID"),
                        ]),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("native".to_string()),
                                container_port: 9000,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                name: Some("http".to_string()),
                                container_port: 8123,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            },
                        ]),
                        resources: spec.resources.clone(),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "data".to_string(),
                            mount_path: "/var/lib/clickhouse".to_string(),
                            ..Default::default()
                        }]),
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
    use crate::crd::{ClickhouseSpec, CorootSpec};

    fn instance() -> Coroot {
        let mut cr = Coroot::new("example", CorootSpec::default());
        cr.metadata.namespace = Some("monitoring".to_string());
        cr
    }

    #[test]
    fn defaults_produce_a_single_shard() {
        let sets = stateful_sets(&instance(), &VersionCatalog::default());
        assert_eq!(sets.len(), 1);
        assert_eq!(
            sets[0].metadata.name.as_deref(),
            Some("example-clickhouse-shard-0")
        );
        assert_eq!(sets[0].spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn sharded_spec_produces_claims_per_shard_and_replica() {
        let mut cr = instance();
        cr.spec.clickhouse = ClickhouseSpec {
            shards: Some(2),
            replicas: Some(2),
            ..Default::default()
        };
        let claims = pvcs(&cr);
        let names: Vec<_> = claims
            .iter()
            .map(|pvc| pvc.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "data-example-clickhouse-shard-0-0",
                "data-example-clickhouse-shard-0-1",
                "data-example-clickhouse-shard-1-0",
                "data-example-clickhouse-shard-1-1",
            ]
        );
    }

    #[test]
    fn keeper_runs_a_three_node_ensemble() {
        let sts = keeper_stateful_set(&instance(), &VersionCatalog::default());
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(KEEPER_REPLICAS));
        assert_eq!(keeper_pvcs(&instance()).len(), KEEPER_REPLICAS as usize);
    }

    #[test]
    fn shard_selectors_do_not_overlap() {
        let mut cr = instance();
        cr.spec.clickhouse.shards = Some(2);
        let sets = stateful_sets(&cr, &VersionCatalog::default());
        let selector = |i: usize| {
            sets[i]
                .spec
                .as_ref()
                .unwrap()
                .selector
                .match_labels
                .clone()
                .unwrap()
        };
        assert_ne!(selector(0), selector(1));
    }
}
