//! Node-agent DaemonSet
//!
//! The node-agent runs privileged on every node with host PID and the
//! kernel filesystems it needs for eBPF-based telemetry.

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crd::Coroot;
use crate::template::{collector_endpoint, component_name, env_var, labels, metadata};
use crate::versions::{App, VersionCatalog};

/// Build the node-agent DaemonSet for an instance
pub fn daemon_set(cr: &Coroot, catalog: &VersionCatalog) -> DaemonSet {
    let component = "node-agent";
    let ls = labels(cr, component);
    let spec = &cr.spec.node_agent;

    let mut env = vec![
        env_var("COLLECTOR_ENDPOINT", collector_endpoint(cr)),
        env_var("API_KEY", cr.spec.api_key.clone().unwrap_or_default()),
        env_var("SCRAPE_INTERVAL", cr.spec.refresh_interval()),
    ];
    env.extend(spec.env.iter().cloned());

    let host_path = |name: &str, path: &str| Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    DaemonSet {
        metadata: metadata(cr, component_name(cr, component), component),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(ls.clone()),
                ..Default::default()
            },
            update_strategy: spec.update_strategy.clone(),
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
                    host_pid: Some(true),
                    service_account_name: Some(component_name(cr, component)),
                    priority_class_name: spec.priority_class_name.clone(),
                    affinity: spec.affinity.clone(),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: component.to_string(),
                        image: Some(catalog.image(App::NodeAgent, spec.version.as_deref())),
                        args: Some(vec!["--cgroupfs-root=/host/sys/fs/cgroup".to_string()]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        env: Some(env),
                        resources: spec.resources.clone(),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "cgroupfs".to_string(),
                                mount_path: "/host/sys/fs/cgroup".to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "tracefs".to_string(),
                                mount_path: "/sys/kernel/tracing".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "debugfs".to_string(),
                                mount_path: "/sys/kernel/debug".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "tmp".to_string(),
                                mount_path: "/tmp".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        host_path("cgroupfs", "/sys/fs/cgroup"),
                        host_path("tracefs", "/sys/kernel/tracing"),
                        host_path("debugfs", "/sys/kernel/debug"),
                        Volume {
                            name: "tmp".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        },
                    ]),
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
    use crate::crd::{AgentsOnlySpec, CorootSpec};

    fn instance() -> Coroot {
        let mut cr = Coroot::new("example", CorootSpec::default());
        cr.metadata.namespace = Some("monitoring".to_string());
        cr
    }

    #[test]
    fn agent_reports_to_the_instance_collector() {
        let ds = daemon_set(&instance(), &VersionCatalog::default());
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.as_ref().unwrap();
        let endpoint = env
            .iter()
            .find(|e| e.name == "COLLECTOR_ENDPOINT")
            .and_then(|e| e.value.clone());
        assert_eq!(
            endpoint.as_deref(),
            Some("http://example-coroot.monitoring:8080")
        );
        assert_eq!(pod.host_pid, Some(true));
    }

    #[test]
    fn agents_only_mode_points_at_the_external_instance() {
        let mut cr = instance();
        cr.spec.agents_only = Some(AgentsOnlySpec {
            coroot_url: "https://coroot.example.com".to_string(),
        });
        let ds = daemon_set(&cr, &VersionCatalog::default());
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.as_ref().unwrap();
        let endpoint = env
            .iter()
            .find(|e| e.name == "COLLECTOR_ENDPOINT")
            .and_then(|e| e.value.clone());
        assert_eq!(endpoint.as_deref(), Some("https://coroot.example.com"));
    }
}
