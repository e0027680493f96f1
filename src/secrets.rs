//! Write-once credential provisioning
//!
//! Generated credentials (the bundled ClickHouse password, auto-created
//! project API keys) are created exactly once per (secret, key). The value
//! is generated on first sight and persisted through the apply engine, whose
//! Secret merge policy lets live entries win, so a concurrent writer can
//! never overwrite an existing value. Later calls return the stored value
//! unchanged, whatever length they ask for.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::core::ApiResource;
use kube::{Resource, ResourceExt};
use rand::Rng;
use serde_json::json;

use crate::apply::{Applier, ResourceDescriptor};
use crate::crd::Coroot;
use crate::Error;

/// Generate a random alphanumeric string of the given length
pub fn random_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..62);
            match idx {
                0..=9 => (b'0' + idx) as char,
                10..=35 => (b'a' + idx - 10) as char,
                _ => (b'A' + idx - 36) as char,
            }
        })
        .collect()
}

/// Return the value stored under `key` in the named Secret, generating and
/// persisting it first if absent.
///
/// `length` only applies when the value is first created.
pub async fn ensure_secret(
    applier: &Applier,
    owner: &Coroot,
    name: &str,
    key: &str,
    length: usize,
) -> Result<String, Error> {
    let resource = ApiResource::erase::<Secret>(&());
    let namespace = owner.namespace();

    if let Some(live) = applier
        .live()
        .get(&resource, namespace.as_deref(), name)
        .await?
    {
        if let Some(value) = decode_key(&serde_json::to_value(&live)?, key) {
            return Ok(value);
        }
    }

    let generated = random_string(length);
    let manifest = json!({
        "apiVersion": Secret::api_version(&()).as_ref(),
        "kind": Secret::kind(&()).as_ref(),
        "metadata": {
            "name": name,
            "namespace": namespace.clone(),
        },
        "type": "Opaque",
        "data": { key: STANDARD.encode(&generated) },
    });
    let descriptor = ResourceDescriptor {
        api_resource: resource.clone(),
        namespace: namespace.clone(),
        name: name.to_string(),
        manifest,
        retain: false,
        delete: false,
    };
    applier.apply(&descriptor, owner).await?;

    // Read back what actually landed: if another writer got there first,
    // the merge kept its value and that is the one in effect.
    if let Some(stored) = applier
        .live()
        .get(&resource, namespace.as_deref(), name)
        .await?
    {
        if let Some(value) = decode_key(&serde_json::to_value(&stored)?, key) {
            return Ok(value);
        }
    }
    Ok(generated)
}

fn decode_key(secret: &serde_json::Value, key: &str) -> Option<String> {
    let encoded = secret.get("data")?.get(key)?.as_str()?;
    let bytes = STANDARD.decode(encoded).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::FakeLiveClient;
    use crate::crd::CorootSpec;
    use std::sync::Arc;

    fn owner() -> Coroot {
        let mut cr = Coroot::new("example", CorootSpec::default());
        cr.metadata.namespace = Some("ns".to_string());
        cr.metadata.uid = Some("uid-1".to_string());
        cr
    }

    #[test]
    fn random_string_has_requested_length_and_alphabet() {
        let value = random_string(64);
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn value_is_stable_across_calls() {
        let live = Arc::new(FakeLiveClient::default());
        let applier = Applier::new(live.clone());
        let owner = owner();

        let first = ensure_secret(&applier, &owner, "example-clickhouse", "password", 16)
            .await
            .unwrap();
        assert_eq!(first.len(), 16);

        // A later pass asking for a different length still gets the
        // original value.
        let second = ensure_secret(&applier, &owner, "example-clickhouse", "password", 32)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn existing_values_are_never_overwritten() {
        let live = Arc::new(FakeLiveClient::default());
        let applier = Applier::new(live.clone());
        let owner = owner();

        ensure_secret(&applier, &owner, "example-clickhouse", "password", 16)
            .await
            .unwrap();
        let before = live.value_of("Secret", "ns", "example-clickhouse").unwrap();

        // New keys are added without touching the existing one.
        ensure_secret(&applier, &owner, "example-clickhouse", "token", 16)
            .await
            .unwrap();
        let after = live.value_of("Secret", "ns", "example-clickhouse").unwrap();
        assert_eq!(before["data"]["password"], after["data"]["password"]);
        assert!(after["data"]["token"].is_string());
    }
}
