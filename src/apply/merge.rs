//! Per-kind merge rules for reconciling desired state with live objects
//!
//! The apply engine never overwrites a live object wholesale: some fields are
//! allocated by the cluster (a Service's clusterIP), some are immutable after
//! creation (a StatefulSet's volumeClaimTemplates), and some are populated by
//! other components (a ConfigMap's binaryData). The rules for every managed
//! kind live in this one table so they can be tested in one place.

use serde_json::{Map, Value};

/// Merge rules for one resource kind
#[derive(Clone, Copy, Debug, Default)]
pub struct MergePolicy {
    /// JSON pointers whose live values survive the merge
    pub preserve: &'static [&'static str],
    /// JSON pointers where the desired value wins even over a preserved
    /// snapshot (applied last)
    pub force_desired: &'static [&'static str],
    /// JSON pointers to maps where existing live entries win over desired
    /// entries with the same key; desired-only keys are added
    pub live_wins_entries: &'static [&'static str],
}

/// Look up the merge rules for a resource kind
pub fn policy_for(kind: &str) -> MergePolicy {
    match kind {
        // The cluster allocates addressing on Services; the desired port
        // list always wins wholesale.
        "Service" => MergePolicy {
            preserve: &[
                "/spec/clusterIP",
                "/spec/clusterIPs",
                "/spec/ipFamilies",
                "/spec/ipFamilyPolicy",
                "/spec/healthCheckNodePort",
            ],
            force_desired: &["/spec/ports"],
            ..Default::default()
        },
        // volumeClaimTemplates are immutable after creation.
        "StatefulSet" => MergePolicy {
            preserve: &["/spec/volumeClaimTemplates"],
            ..Default::default()
        },
        // binaryData is populated by a separate component.
        "ConfigMap" => MergePolicy {
            preserve: &["/binaryData"],
            ..Default::default()
        },
        // Controllers and users annotate Ingresses; the desired routing
        // rules always win.
        "Ingress" => MergePolicy {
            force_desired: &["/spec/rules", "/spec/tls"],
            ..Default::default()
        },
        // Generated credentials are write-once: a live key is never
        // replaced by a desired value.
        "Secret" => MergePolicy {
            live_wins_entries: &["/data"],
            ..Default::default()
        },
        _ => MergePolicy::default(),
    }
}

/// Merge a desired manifest into a live object.
///
/// The result starts from the live object (server metadata and fields the
/// operator knows nothing about stay intact), takes every top-level field of
/// the desired manifest, then restores the preserved pointers snapshotted
/// from the live object and finally re-applies the desired-wins pointers, so
/// a stale snapshot can never shadow a newly introduced desired field.
/// Labels and annotations are merged key-wise with desired entries winning,
/// which keeps labels and annotations set by other actors alive.
pub fn merge_into_live(policy: &MergePolicy, live: &Value, desired: &Value) -> Value {
    let mut merged = live.clone();

    let snapshot: Vec<(&str, Value)> = policy
        .preserve
        .iter()
        .filter_map(|ptr| live.pointer(ptr).map(|v| (*ptr, v.clone())))
        .collect();

    if let Some(fields) = desired.as_object() {
        for (field, value) in fields {
            match field.as_str() {
                "metadata" => merge_metadata(&mut merged, value),
                "status" => {}
                _ => {
                    merged[field] = value.clone();
                }
            }
        }
    }

    for ptr in policy.live_wins_entries {
        if let (Some(Value::Object(live_map)), Some(Value::Object(desired_map))) =
            (live.pointer(ptr), desired.pointer(ptr))
        {
            let mut entries = desired_map.clone();
            for (key, value) in live_map {
                entries.insert(key.clone(), value.clone());
            }
            set_field(&mut merged, ptr, Value::Object(entries));
        }
    }

    for (ptr, value) in snapshot {
        set_field(&mut merged, ptr, value);
    }

    for ptr in policy.force_desired {
        if let Some(value) = desired.pointer(ptr) {
            set_field(&mut merged, ptr, value.clone());
        }
    }

    merged
}

/// Merge desired metadata into the target, keeping server-owned fields.
///
/// Only name, namespace, labels, and annotations are taken from the desired
/// manifest; labels and annotations are key-merged so entries written by
/// other actors survive.
fn merge_metadata(merged: &mut Value, desired_meta: &Value) {
    if merged.get("metadata").map_or(true, Value::is_null) {
        merged["metadata"] = Value::Object(Map::new());
    }
    let target = &mut merged["metadata"];
    for field in ["name", "namespace"] {
        if let Some(value) = desired_meta.get(field) {
            target[field] = value.clone();
        }
    }
    for field in ["labels", "annotations"] {
        if let Some(Value::Object(desired_map)) = desired_meta.get(field) {
            let mut entries = match target.get(field) {
                Some(Value::Object(live_map)) => live_map.clone(),
                _ => Map::new(),
            };
            for (key, value) in desired_map {
                entries.insert(key.clone(), value.clone());
            }
            target[field] = Value::Object(entries);
        }
    }
}

/// Set a value at a JSON pointer, creating intermediate objects as needed
pub(crate) fn set_field(target: &mut Value, pointer: &str, value: Value) {
    let mut current = target;
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            current[segment] = value;
            return;
        }
        if current.get(*segment).map_or(true, Value::is_null) {
            current[*segment] = Value::Object(Map::new());
        }
        current = &mut current[*segment];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_preserves_allocated_addressing() {
        let live = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "ns", "resourceVersion": "7"},
            "spec": {
                "clusterIP": "10.0.0.17",
                "clusterIPs": ["10.0.0.17"],
                "ports": [{"name": "http", "port": 8080}],
                "selector": {"app": "old"}
            }
        });
        let desired = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "ns"},
            "spec": {
                "ports": [{"name": "http", "port": 9090}],
                "selector": {"app": "new"}
            }
        });

        let merged = merge_into_live(&policy_for("Service"), &live, &desired);

        assert_eq!(merged["spec"]["clusterIP"], "10.0.0.17");
        assert_eq!(merged["spec"]["clusterIPs"][0], "10.0.0.17");
        assert_eq!(merged["spec"]["ports"][0]["port"], 9090);
        assert_eq!(merged["spec"]["selector"]["app"], "new");
        assert_eq!(merged["metadata"]["resourceVersion"], "7");
    }

    #[test]
    fn service_desired_ports_win_wholesale() {
        // A nodePort allocated on a port the desired state no longer wants
        // must not leak back in.
        let live = json!({
            "kind": "Service",
            "spec": {"ports": [
                {"name": "http", "port": 8080, "nodePort": 30123},
                {"name": "debug", "port": 6060}
            ]}
        });
        let desired = json!({
            "kind": "Service",
            "spec": {"ports": [{"name": "http", "port": 8080}]}
        });

        let merged = merge_into_live(&policy_for("Service"), &live, &desired);
        let ports = merged["spec"]["ports"].as_array().unwrap();
        assert_eq!(ports.len(), 1);
        assert!(ports[0].get("nodePort").is_none());
    }

    #[test]
    fn stateful_set_keeps_live_volume_claim_templates() {
        let live = json!({
            "kind": "StatefulSet",
            "spec": {
                "replicas": 1,
                "volumeClaimTemplates": [{"metadata": {"name": "data"},
                    "spec": {"resources": {"requests": {"storage": "10Gi"}}}}]
            }
        });
        let desired = json!({
            "kind": "StatefulSet",
            "spec": {
                "replicas": 2,
                "volumeClaimTemplates": [{"metadata": {"name": "data"},
                    "spec": {"resources": {"requests": {"storage": "20Gi"}}}}]
            }
        });

        let merged = merge_into_live(&policy_for("StatefulSet"), &live, &desired);
        assert_eq!(merged["spec"]["replicas"], 2);
        assert_eq!(
            merged["spec"]["volumeClaimTemplates"][0]["spec"]["resources"]["requests"]["storage"],
            "10Gi"
        );
    }

    #[test]
    fn config_map_keeps_live_binary_data() {
        let live = json!({
            "kind": "ConfigMap",
            "data": {"config.yaml": "projects: []"},
            "binaryData": {"bundle.tgz": "AAAA"}
        });
        let desired = json!({
            "kind": "ConfigMap",
            "data": {"config.yaml": "projects:\n- name: production"}
        });

        let merged = merge_into_live(&policy_for("ConfigMap"), &live, &desired);
        assert_eq!(merged["data"]["config.yaml"], "projects:\n- name: production");
        assert_eq!(merged["binaryData"]["bundle.tgz"], "AAAA");
    }

    #[test]
    fn ingress_merges_annotations_and_forces_rules() {
        let live = json!({
            "kind": "Ingress",
            "metadata": {"annotations": {
                "nginx.ingress.kubernetes.io/backend-protocol": "HTTP",
                "field.cattle.io/publicEndpoints": "[...]"
            }},
            "spec": {"rules": [{"host": "old.example.com"}]}
        });
        let desired = json!({
            "kind": "Ingress",
            "metadata": {"annotations": {
                "nginx.ingress.kubernetes.io/backend-protocol": "HTTPS"
            }},
            "spec": {"rules": [{"host": "coroot.example.com"}]}
        });

        let merged = merge_into_live(&policy_for("Ingress"), &live, &desired);
        let annotations = &merged["metadata"]["annotations"];
        // desired wins on shared keys, externally-set keys survive
        assert_eq!(
            annotations["nginx.ingress.kubernetes.io/backend-protocol"],
            "HTTPS"
        );
        assert_eq!(annotations["field.cattle.io/publicEndpoints"], "[...]");
        assert_eq!(merged["spec"]["rules"][0]["host"], "coroot.example.com");
    }

    #[test]
    fn secret_live_entries_are_never_overwritten() {
        let live = json!({
            "kind": "Secret",
            "data": {"password": "b2xk"}
        });
        let desired = json!({
            "kind": "Secret",
            "data": {"password": "bmV3", "token": "dA=="}
        });

        let merged = merge_into_live(&policy_for("Secret"), &live, &desired);
        assert_eq!(merged["data"]["password"], "b2xk");
        assert_eq!(merged["data"]["token"], "dA==");
    }

    #[test]
    fn unknown_kind_gets_plain_overwrite() {
        let live = json!({
            "kind": "ServiceAccount",
            "metadata": {"name": "sa", "uid": "u-1"},
            "secrets": [{"name": "sa-token"}]
        });
        let desired = json!({
            "kind": "ServiceAccount",
            "metadata": {"name": "sa", "labels": {"app.kubernetes.io/component": "coroot"}}
        });

        let merged = merge_into_live(&policy_for("ServiceAccount"), &live, &desired);
        assert_eq!(merged["metadata"]["uid"], "u-1");
        assert_eq!(
            merged["metadata"]["labels"]["app.kubernetes.io/component"],
            "coroot"
        );
        assert_eq!(merged["secrets"][0]["name"], "sa-token");
    }

    #[test]
    fn merge_of_identical_state_is_a_fixpoint() {
        let desired = json!({
            "kind": "Service",
            "metadata": {"name": "svc", "labels": {"a": "b"}},
            "spec": {"ports": [{"port": 8080}], "selector": {"a": "b"}}
        });
        let first = merge_into_live(&policy_for("Service"), &json!({}), &desired);
        let second = merge_into_live(&policy_for("Service"), &first, &desired);
        assert_eq!(first, second);
    }
}
