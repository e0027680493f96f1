//! Rendering of the Coroot configuration file
//!
//! Coroot reads a YAML configuration file at startup listing the projects it
//! should create or update, each with its API keys. The operator renders the
//! file from the instance spec, ships it in a ConfigMap, and stamps a hash
//! of the content onto the pod template so the workload restarts when the
//! configuration changes.

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::apply::Applier;
use crate::crd::Coroot;
use crate::secrets::ensure_secret;
use crate::Error;

/// Key of the rendered file inside the ConfigMap
pub const CONFIG_FILE_KEY: &str = "config.yaml";

/// Length of auto-provisioned API key values
const API_KEY_LENGTH: usize = 32;

#[derive(Serialize)]
struct ConfigFile {
    projects: Vec<ProjectEntry>,
}

#[derive(Serialize)]
struct ProjectEntry {
    name: String,
    api_keys: Vec<ApiKeyEntry>,
}

#[derive(Serialize)]
struct ApiKeyEntry {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

/// Render the configuration file for an instance.
///
/// Plain API keys are taken from the spec; keys referencing a secret are
/// read from it, provisioning the secret on first sight. Keys that resolve
/// to nothing are skipped here — validation reports them separately.
pub async fn render(applier: &Applier, cr: &Coroot) -> Result<String, Error> {
    let mut projects = Vec::new();
    for project in &cr.spec.projects {
        let mut api_keys = Vec::new();
        for api_key in &project.api_keys {
            let value = match (&api_key.key, &api_key.key_secret) {
                (Some(key), _) if !key.is_empty() => key.clone(),
                (_, Some(selector)) => {
                    let name = selector.name.clone().unwrap_or_default();
                    if name.is_empty() {
                        continue;
                    }
                    ensure_secret(applier, cr, &name, &selector.key, API_KEY_LENGTH).await?
                }
                _ => continue,
            };
            api_keys.push(ApiKeyEntry {
                key: value,
                description: api_key.description.clone(),
            });
        }
        projects.push(ProjectEntry {
            name: project.name.clone(),
            api_keys,
        });
    }

    serde_yaml::to_string(&ConfigFile { projects })
        .map_err(|e| Error::Validation(format!("failed to render configuration: {e}")))
}

/// Stable hash of the rendered configuration, for the pod-template annotation
pub fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::FakeLiveClient;
    use crate::crd::{ApiKeySpec, CorootSpec, ProjectSpec};
    use k8s_openapi::api::core::v1::SecretKeySelector;
    use std::sync::Arc;

    fn instance(spec: CorootSpec) -> Coroot {
        let mut cr = Coroot::new("example", spec);
        cr.metadata.namespace = Some("ns".to_string());
        cr.metadata.uid = Some("uid-1".to_string());
        cr
    }

    #[tokio::test]
    async fn renders_projects_with_plain_keys() {
        let applier = Applier::new(Arc::new(FakeLiveClient::default()));
        let spec = CorootSpec {
            projects: vec![ProjectSpec {
                name: "production".to_string(),
                api_keys: vec![ApiKeySpec {
                    key: Some("k-123".to_string()),
                    description: Some("agents".to_string()),
                    ..Default::default()
                }],
            }],
            ..Default::default()
        };

        let rendered = render(&applier, &instance(spec)).await.unwrap();
        assert!(rendered.contains("name: production"));
        assert!(rendered.contains("key: k-123"));
        assert!(rendered.contains("description: agents"));
    }

    #[tokio::test]
    async fn secret_backed_keys_are_provisioned_once() {
        let live = Arc::new(FakeLiveClient::default());
        let applier = Applier::new(live.clone());
        let spec = CorootSpec {
            projects: vec![ProjectSpec {
                name: "production".to_string(),
                api_keys: vec![ApiKeySpec {
                    key_secret: Some(SecretKeySelector {
                        name: Some("production-api-key".to_string()),
                        key: "key".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            }],
            ..Default::default()
        };
        let cr = instance(spec);

        let first = render(&applier, &cr).await.unwrap();
        let second = render(&applier, &cr).await.unwrap();
        assert_eq!(first, second, "provisioned key must be stable");
        assert!(live.value_of("Secret", "ns", "production-api-key").is_some());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = content_hash("projects: []");
        let b = content_hash("projects:\n- name: production");
        assert_ne!(a, b);
        assert_eq!(a, content_hash("projects: []"));
    }
}
