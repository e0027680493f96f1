//! Spec validation
//!
//! Validation produces user-facing error strings for the instance status; it
//! never stops resources from being applied. An instance with a bad config
//! still gets every resource the valid parts of its spec describe.

use k8s_openapi::api::core::v1::{Secret, SecretKeySelector};
use kube::core::ApiResource;
use kube::ResourceExt;

use crate::apply::LiveClient;
use crate::crd::Coroot;

/// Validate an instance spec, resolving referenced secrets along the way.
///
/// Returns zero or more human-readable errors in the order they were found.
pub async fn validate(cr: &Coroot, live: &dyn LiveClient) -> Vec<String> {
    let mut errors = Vec::new();
    let spec = &cr.spec;

    if spec.replica_count() > 1 && spec.postgres.is_none() {
        errors.push("spec.postgres is required when spec.replicas > 1".to_string());
    }

    for project in &spec.projects {
        if project.name.is_empty() {
            errors.push("project name is required".to_string());
            continue;
        }
        if !is_valid_project_name(&project.name) {
            errors.push(format!(
                "invalid project name '{}': only lowercase letters, digits, and hyphens are allowed",
                project.name
            ));
        }
        if project.api_keys.is_empty() {
            errors.push(format!("project '{}' has no API keys", project.name));
        }
        for api_key in &project.api_keys {
            if api_key.key.is_none() && api_key.key_secret.is_none() {
                errors.push(format!(
                    "project '{}': an API key must set either key or keySecret",
                    project.name
                ));
            }
        }
    }

    if let Some(ee) = &spec.enterprise_edition {
        if ee.license_key.as_deref().unwrap_or_default().is_empty() {
            errors.push("spec.enterpriseEdition.licenseKey is required".to_string());
        }
    }

    if let Some(ingress) = &spec.ingress {
        if ingress.host.is_empty() {
            errors.push("spec.ingress.host is required".to_string());
        }
    }

    if let Some(postgres) = &spec.postgres {
        if postgres.host.is_empty() {
            errors.push("spec.postgres.host is required".to_string());
        }
        if let Some(selector) = &postgres.password_secret {
            if let Err(e) = resolve_secret(cr, live, selector).await {
                errors.push(format!("spec.postgres.passwordSecret: {e}"));
            }
        }
    }

    if let Some(external) = &spec.external_clickhouse {
        if external.address.is_empty() {
            errors.push("spec.externalClickhouse.address is required".to_string());
        }
        if external.user.is_empty() {
            errors.push("spec.externalClickhouse.user is required".to_string());
        }
        if external.password.as_deref().unwrap_or_default().is_empty()
            && external.password_secret.is_none()
        {
            errors.push(
                "spec.externalClickhouse requires either password or passwordSecret".to_string(),
            );
        }
        if let Some(selector) = &external.password_secret {
            if let Err(e) = resolve_secret(cr, live, selector).await {
                errors.push(format!("spec.externalClickhouse.passwordSecret: {e}"));
            }
        }
    }

    if let Some(external) = &spec.external_prometheus {
        if !external.url.starts_with("http://") && !external.url.starts_with("https://") {
            errors.push(format!(
                "spec.externalPrometheus.url '{}' must start with http:// or https://",
                external.url
            ));
        }
    }

    errors
}

fn is_valid_project_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Resolve a secret key reference in the instance's namespace.
///
/// Errors are returned as plain strings suitable for the status projection.
async fn resolve_secret(
    cr: &Coroot,
    live: &dyn LiveClient,
    selector: &SecretKeySelector,
) -> Result<(), String> {
    let resource = ApiResource::erase::<Secret>(&());
    let namespace = cr.namespace();
    let name = selector.name.clone().unwrap_or_default();
    if name.is_empty() {
        return Err("secret name is required".to_string());
    }
    let secret = live
        .get(&resource, namespace.as_deref(), &name)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("secret '{name}' not found"))?;
    let value = serde_json::to_value(&secret).map_err(|e| e.to_string())?;
    match value.get("data").and_then(|d| d.get(&selector.key)) {
        Some(_) => Ok(()),
        None => Err(format!(
            "key '{}' not found in secret '{name}'",
            selector.key
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::FakeLiveClient;
    use crate::crd::{CorootSpec, PostgresSpec, ProjectSpec};

    fn instance(spec: CorootSpec) -> Coroot {
        let mut cr = Coroot::new("example", spec);
        cr.metadata.namespace = Some("ns".to_string());
        cr
    }

    #[tokio::test]
    async fn default_spec_is_valid() {
        let live = FakeLiveClient::default();
        let errors = validate(&instance(CorootSpec::default()), &live).await;
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[tokio::test]
    async fn multiple_replicas_require_postgres() {
        let live = FakeLiveClient::default();
        let spec = CorootSpec {
            replicas: Some(3),
            ..Default::default()
        };
        let errors = validate(&instance(spec), &live).await;
        assert_eq!(
            errors,
            vec!["spec.postgres is required when spec.replicas > 1".to_string()]
        );

        let spec = CorootSpec {
            replicas: Some(3),
            postgres: Some(PostgresSpec {
                host: "pg".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let errors = validate(&instance(spec), &live).await;
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[tokio::test]
    async fn bad_project_names_are_reported() {
        let live = FakeLiveClient::default();
        let spec = CorootSpec {
            projects: vec![ProjectSpec {
                name: "Production!".to_string(),
                api_keys: vec![],
            }],
            ..Default::default()
        };
        let errors = validate(&instance(spec), &live).await;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("invalid project name"));
        assert!(errors[1].contains("has no API keys"));
    }

    #[tokio::test]
    async fn unresolvable_secret_references_are_reported() {
        let live = FakeLiveClient::default();
        let spec = CorootSpec {
            postgres: Some(PostgresSpec {
                host: "pg".to_string(),
                password_secret: Some(SecretKeySelector {
                    name: Some("pg-credentials".to_string()),
                    key: "password".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let errors = validate(&instance(spec), &live).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("secret 'pg-credentials' not found"));
    }
}
