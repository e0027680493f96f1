//! The Coroot workload: StatefulSet, Service, storage claims, ConfigMap,
//! and optional Ingress

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::CONFIG_FILE_KEY;
use crate::crd::{Coroot, PostgresSpec};
use crate::template::clickhouse;
use crate::template::{
    component_name, env_var, env_var_from_secret, env_var_from_selector, labels, metadata,
    nonroot_security_context,
};
use crate::versions::{App, VersionCatalog};

const COMPONENT: &str = "coroot";
const DATA_VOLUME: &str = "data";
const CONFIG_VOLUME: &str = "config";

/// Service exposing the Coroot UI and collector endpoint
pub fn service(cr: &Coroot) -> Service {
    let ls = labels(cr, COMPONENT);
    Service {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        spec: Some(ServiceSpec {
            selector: Some(ls),
            type_: cr.spec.service.type_.clone(),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port: cr.spec.service_port(),
                target_port: Some(IntOrString::String("http".to_string())),
                node_port: cr.spec.service.node_port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One storage claim per replica, named the way the StatefulSet expects
/// (`data-{instance}-coroot-{ordinal}`)
pub fn pvcs(cr: &Coroot) -> Vec<PersistentVolumeClaim> {
    let ls = labels(cr, COMPONENT);
    let size = cr.spec.storage.size_or("10Gi");
    (0..cr.spec.replica_count())
        .map(|replica| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(format!(
                    "{DATA_VOLUME}-{}-{COMPONENT}-{replica}",
                    cr.name_any()
                )),
                namespace: cr.namespace(),
                labels: Some(ls.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), size.clone())])),
                    ..Default::default()
                }),
                storage_class_name: cr.spec.storage.class_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

/// ConfigMap carrying the rendered configuration file
pub fn config_map(cr: &Coroot, config: &str) -> ConfigMap {
    ConfigMap {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        data: Some(BTreeMap::from([(
            CONFIG_FILE_KEY.to_string(),
            config.to_string(),
        )])),
        ..Default::default()
    }
}

/// Build the Coroot StatefulSet.
///
/// `config_hash` is stamped onto the pod template so pods roll when the
/// configuration file changes.
pub fn stateful_set(cr: &Coroot, catalog: &VersionCatalog, config_hash: &str) -> StatefulSet {
    let ls = labels(cr, COMPONENT);
    let name = cr.name_any();
    let namespace = cr.namespace().unwrap_or_default();

    let mut env = vec![
        env_var("GLOBAL_REFRESH_INTERVAL", cr.spec.refresh_interval()),
        env_var(
            "GLOBAL_PROMETHEUS_URL",
            match &cr.spec.external_prometheus {
                Some(external) => external.url.clone(),
                None => format!("http://{name}-prometheus.{namespace}:9090"),
            },
        ),
        env_var("INSTALLATION_TYPE", "k8s-operator"),
    ];
    if let Some(ttl) = &cr.spec.cache_ttl {
        env.push(env_var("CACHE_TTL", ttl.clone()));
    }
    if let Some(role) = &cr.spec.auth_anonymous_role {
        env.push(env_var("AUTH_ANONYMOUS_ROLE", role.clone()));
    }
    if let Some(password) = &cr.spec.auth_bootstrap_admin_password {
        env.push(env_var("AUTH_BOOTSTRAP_ADMIN_PASSWORD", password.clone()));
    }
    env.extend(cr.spec.env.iter().cloned());

    let image = match &cr.spec.enterprise_edition {
        Some(ee) => {
            env.push(env_var(
                "LICENSE_KEY",
                ee.license_key.clone().unwrap_or_default(),
            ));
            catalog.image(App::CorootEE, ee.version.as_deref())
        }
        None => catalog.image(App::CorootCE, cr.spec.community_edition.version.as_deref()),
    };

    match &cr.spec.external_clickhouse {
        Some(external) => {
            env.push(env_var("GLOBAL_CLICKHOUSE_ADDRESS", external.address.clone()));
            env.push(env_var("GLOBAL_CLICKHOUSE_USER", external.user.clone()));
            env.push(env_var(
                "GLOBAL_CLICKHOUSE_INITIAL_DATABASE",
                external.database.clone(),
            ));
            match &external.password_secret {
                Some(selector) => env.push(env_var_from_selector(
                    "GLOBAL_CLICKHOUSE_PASSWORD",
                    selector.clone(),
                )),
                None => env.push(env_var(
                    "GLOBAL_CLICKHOUSE_PASSWORD",
                    external.password.clone().unwrap_or_default(),
                )),
            }
        }
        None => {
            let (secret, key) = clickhouse::password_secret(cr);
            env.push(env_var(
                "GLOBAL_CLICKHOUSE_ADDRESS",
                format!("{name}-clickhouse.{namespace}:9000"),
            ));
            env.push(env_var("GLOBAL_CLICKHOUSE_USER", "default"));
            env.push(env_var_from_secret("GLOBAL_CLICKHOUSE_PASSWORD", &secret, &key));
            env.push(env_var("GLOBAL_CLICKHOUSE_INITIAL_DATABASE", "default"));
        }
    }

    if let Some(postgres) = &cr.spec.postgres {
        match &postgres.password_secret {
            Some(selector) => env.push(env_var_from_selector("PG_PASSWORD", selector.clone())),
            None => env.push(env_var(
                "PG_PASSWORD",
                postgres.password.clone().unwrap_or_default(),
            )),
        }
        env.push(env_var(
            "PG_CONNECTION_STRING",
            postgres_connection_string(postgres, "PG_PASSWORD"),
        ));
    }

    if let Some(ingress) = &cr.spec.ingress {
        if let Some(path) = &ingress.path {
            if !path.is_empty() {
                env.push(env_var("URL_BASE_PATH", path.clone()));
            }
        }
    }

    let mut pod_annotations = cr.spec.pod_annotations.clone();
    pod_annotations.insert("checksum/config".to_string(), config_hash.to_string());

    StatefulSet {
        metadata: metadata(cr, component_name(cr, COMPONENT), COMPONENT),
        spec: Some(StatefulSetSpec {
            service_name: component_name(cr, COMPONENT),
            replicas: Some(cr.spec.replica_count()),
            selector: LabelSelector {
                match_labels: Some(ls.clone()),
                ..Default::default()
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    namespace: cr.namespace(),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            cr.spec.storage.size_or("10Gi"),
                        )])),
                        ..Default::default()
                    }),
                    storage_class_name: cr.spec.storage.class_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ls),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(component_name(cr, COMPONENT)),
                    security_context: Some(nonroot_security_context()),
                    affinity: cr.spec.affinity.clone(),
                    tolerations: if cr.spec.tolerations.is_empty() {
                        None
                    } else {
                        Some(cr.spec.tolerations.clone())
                    },
                    containers: vec![Container {
                        name: COMPONENT.to_string(),
                        image: Some(image),
                        args: Some(vec![
                            format!("--config=/config/{CONFIG_FILE_KEY}"),
                            "--listen=:8080".to_string(),
                            "--data-dir=/data".to_string(),
                        ]),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: 8080,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: CONFIG_VOLUME.to_string(),
                                mount_path: "/config".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: DATA_VOLUME.to_string(),
                                mount_path: "/data".to_string(),
                                ..Default::default()
                            },
                        ]),
                        resources: cr.spec.resources.clone(),
                        readiness_probe: Some(Probe {
                            http_get: Some(HTTPGetAction {
                                path: Some("/health".to_string()),
                                port: IntOrString::String("http".to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(component_name(cr, COMPONENT)),
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

/// Ingress routing to the Coroot Service.
///
/// When the spec has no ingress section, a bare object is still built so the
/// controller can issue a deletion for it by identity.
pub fn ingress(cr: &Coroot) -> Ingress {
    let mut ingress = Ingress {
        metadata: metadata(cr, cr.name_any(), "ingress"),
        ..Default::default()
    };
    let Some(spec) = &cr.spec.ingress else {
        return ingress;
    };

    if !spec.annotations.is_empty() {
        ingress.metadata.annotations = Some(spec.annotations.clone());
    }
    let mut path = spec.path.clone().unwrap_or_default();
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    ingress.spec = Some(IngressSpec {
        ingress_class_name: spec.class_name.clone(),
        rules: Some(vec![IngressRule {
            host: if spec.host.is_empty() {
                None
            } else {
                Some(spec.host.clone())
            },
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(path),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: component_name(cr, COMPONENT),
                            port: Some(ServiceBackendPort {
                                name: Some("http".to_string()),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }]),
        tls: spec.tls.clone().map(|tls| vec![tls]),
        ..Default::default()
    });
    ingress
}

/// Postgres connection string with the password expanded from an
/// environment variable at runtime
fn postgres_connection_string(postgres: &PostgresSpec, password_env: &str) -> String {
    let port = postgres.port.unwrap_or(5432);
    let query = if postgres.params.is_empty() {
        String::new()
    } else {
        let params: Vec<String> = postgres
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("?{}", params.join("&"))
    };
    format!(
        "postgresql://{}:$({password_env})@{}:{port}/{}{query}",
        postgres.user, postgres.host, postgres.database
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CorootSpec, EnterpriseEditionSpec, IngressSpec as CrIngressSpec};

    fn instance() -> Coroot {
        let mut cr = Coroot::new("example", CorootSpec::default());
        cr.metadata.namespace = Some("monitoring".to_string());
        cr
    }

    #[test]
    fn pvcs_follow_the_stateful_set_naming() {
        let mut cr = instance();
        cr.spec.replicas = Some(2);
        let claims = pvcs(&cr);
        let names: Vec<_> = claims
            .iter()
            .map(|pvc| pvc.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["data-example-coroot-0", "data-example-coroot-1"]);
    }

    #[test]
    fn service_defaults_to_port_8080() {
        let svc = service(&instance());
        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(
            port.target_port,
            Some(IntOrString::String("http".to_string()))
        );
    }

    #[test]
    fn bundled_clickhouse_password_comes_from_the_generated_secret() {
        let sts = stateful_set(&instance(), &VersionCatalog::default(), "abc");
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();
        let password = env
            .iter()
            .find(|e| e.name == "GLOBAL_CLICKHOUSE_PASSWORD")
            .unwrap();
        let selector = password
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name.as_deref(), Some("example-clickhouse"));
        assert_eq!(selector.key, "password");
    }

    #[test]
    fn enterprise_edition_selects_the_ee_image_and_license() {
        let mut cr = instance();
        cr.spec.enterprise_edition = Some(EnterpriseEditionSpec {
            version: Some("1.6.0".to_string()),
            license_key: Some("lk-1".to_string()),
        });
        let sts = stateful_set(&cr, &VersionCatalog::default(), "abc");
        let pod = sts.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("docker.io/coroot/coroot-ee:1.6.0")
        );
        let env = pod.containers[0].env.clone().unwrap();
        assert!(env.iter().any(|e| e.name == "LICENSE_KEY"));
    }

    #[test]
    fn config_hash_is_stamped_on_the_pod_template() {
        let sts = stateful_set(&instance(), &VersionCatalog::default(), "deadbeef");
        let annotations = sts
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(annotations["checksum/config"], "deadbeef");
    }

    #[test]
    fn ingress_routes_to_the_coroot_service() {
        let mut cr = instance();
        cr.spec.ingress = Some(CrIngressSpec {
            host: "coroot.example.com".to_string(),
            path: Some("coroot".to_string()),
            ..Default::default()
        });
        let ing = ingress(&cr);
        let rules = ing.spec.unwrap().rules.unwrap();
        assert_eq!(rules[0].host.as_deref(), Some("coroot.example.com"));
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/coroot"));
        assert_eq!(
            path.backend.service.as_ref().unwrap().name,
            "example-coroot"
        );
    }

    #[test]
    fn absent_ingress_spec_still_names_the_object() {
        let ing = ingress(&instance());
        assert_eq!(ing.metadata.name.as_deref(), Some("example"));
        assert!(ing.spec.is_none());
    }

    #[test]
    fn postgres_connection_string_defers_the_password() {
        let postgres = PostgresSpec {
            host: "pg".to_string(),
            user: "coroot".to_string(),
            database: "coroot".to_string(),
            params: std::collections::BTreeMap::from([(
                "sslmode".to_string(),
                "require".to_string(),
            )]),
            ..Default::default()
        };
        assert_eq!(
            postgres_connection_string(&postgres, "PG_PASSWORD"),
            "postgresql://coroot:$(PG_PASSWORD)@pg:5432/coroot?sslmode=require"
        );
    }
}
