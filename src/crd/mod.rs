//! The `Coroot` Custom Resource Definition
//!
//! A `Coroot` instance is the single configuration object the whole
//! deployment is derived from. The operator only reads `spec` and writes
//! `status`; instances are created, updated, and deleted externally.

use k8s_openapi::api::core::v1::{Affinity, EnvVar, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod types;

pub use types::*;

/// Specification for a Coroot instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "coroot.com",
    version = "v1",
    kind = "Coroot",
    plural = "coroots",
    status = "CorootStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CorootSpec {
    /// Specifies the metric resolution interval (e.g., 15s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_refresh_interval: Option<String>,
    /// Duration for which Coroot retains the metric cache (e.g., 720h).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<String>,
    /// Allows access to Coroot without authentication if set (one of Admin, Editor, or Viewer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_anonymous_role: Option<String>,
    /// Initial admin password for bootstrapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_bootstrap_admin_password: Option<String>,
    /// Projects Coroot creates or updates on startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<ProjectSpec>,
    /// Environment variables for Coroot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Configuration for Coroot Community Edition.
    #[serde(default)]
    pub community_edition: CommunityEditionSpec,
    /// Configuration for Coroot Enterprise Edition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_edition: Option<EnterpriseEditionSpec>,
    /// Configures the operator to install only the node-agent and cluster-agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_only: Option<AgentsOnlySpec>,

    /// Number of Coroot StatefulSet pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Service configuration for Coroot.
    #[serde(default)]
    pub service: ServiceSpec,
    /// Ingress configuration for Coroot; when absent, no Ingress is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
    /// Pod affinity rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Storage configuration for Coroot.
    #[serde(default)]
    pub storage: StorageSpec,
    /// Container resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Tolerations for Coroot pods.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Annotations for Coroot pods.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    /// The API key used by agents when sending telemetry to Coroot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Node-agent configuration.
    #[serde(default)]
    pub node_agent: NodeAgentSpec,
    /// Cluster-agent configuration.
    #[serde(default)]
    pub cluster_agent: ClusterAgentSpec,

    /// Bundled Prometheus configuration.
    #[serde(default)]
    pub prometheus: PrometheusSpec,
    /// Use an external Prometheus instead of deploying one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_prometheus: Option<ExternalPrometheusSpec>,

    /// Bundled ClickHouse configuration.
    #[serde(default)]
    pub clickhouse: ClickhouseSpec,
    /// Use an external ClickHouse instance instead of deploying one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_clickhouse: Option<ExternalClickhouseSpec>,

    /// Store configuration in a Postgres DB instead of SQLite (required if replicas > 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresSpec>,
}

impl CorootSpec {
    /// Number of Coroot pods, never below one
    pub fn replica_count(&self) -> i32 {
        self.replicas.unwrap_or(1).max(1)
    }

    /// Service port, defaulting to 8080
    pub fn service_port(&self) -> i32 {
        match self.service.port {
            Some(port) if port > 0 => port,
            _ => 8080,
        }
    }

    /// Metric refresh interval, defaulting when unset
    pub fn refresh_interval(&self) -> &str {
        self.metrics_refresh_interval
            .as_deref()
            .unwrap_or(DEFAULT_METRIC_REFRESH_INTERVAL)
    }

    /// Number of ClickHouse shards, never below one
    pub fn clickhouse_shards(&self) -> i32 {
        self.clickhouse.shards.unwrap_or(1).max(1)
    }

    /// Number of ClickHouse replicas per shard, never below one
    pub fn clickhouse_replicas(&self) -> i32 {
        self.clickhouse.replicas.unwrap_or(1).max(1)
    }
}

/// Observed state of a Coroot instance
///
/// The status projection is the single user-visible health signal: it
/// reflects configuration validity, not the success of individual apply
/// operations.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorootStatus {
    /// Overall state of the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceState>,
    /// Human-readable configuration errors, in the order they were found
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl CorootStatus {
    /// Status for a correctly configured instance
    pub fn ok() -> Self {
        Self {
            status: Some(InstanceState::Ok),
            errors: Vec::new(),
        }
    }

    /// Status for an instance with configuration errors
    pub fn misconfigured(errors: Vec<String>) -> Self {
        Self {
            status: Some(InstanceState::Misconfigured),
            errors,
        }
    }
}

/// Coarse instance state
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum InstanceState {
    /// The configuration is valid and has been applied
    #[serde(rename = "OK")]
    Ok,
    /// The configuration has user-visible errors; see `errors`
    Misconfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_count_defaults_to_one() {
        let spec = CorootSpec::default();
        assert_eq!(spec.replica_count(), 1);
        let spec = CorootSpec {
            replicas: Some(0),
            ..Default::default()
        };
        assert_eq!(spec.replica_count(), 1);
        let spec = CorootSpec {
            replicas: Some(3),
            ..Default::default()
        };
        assert_eq!(spec.replica_count(), 3);
    }

    #[test]
    fn service_port_defaults_to_8080() {
        let spec = CorootSpec::default();
        assert_eq!(spec.service_port(), 8080);
        let spec = CorootSpec {
            service: ServiceSpec {
                port: Some(9000),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(spec.service_port(), 9000);
    }

    #[test]
    fn status_serializes_state_as_plain_string() {
        let status = CorootStatus::ok();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "OK");

        let status = CorootStatus::misconfigured(vec!["bad".into()]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "Misconfigured");
        assert_eq!(json["errors"][0], "bad");
    }

    #[test]
    fn storage_retain_follows_reclaim_policy() {
        let storage = StorageSpec {
            reclaim_policy: Some("Retain".to_string()),
            ..Default::default()
        };
        assert!(storage.retain());
        assert!(!StorageSpec::default().retain());
    }
}
