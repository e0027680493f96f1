//! Idempotent create-or-update engine for managed resources
//!
//! Every component of a Coroot deployment is reconciled through
//! [`Applier::apply`]: fetch the live object, merge the desired manifest
//! into it under the kind's [`merge::MergePolicy`], attach or strip the
//! controller owner reference, and write only when the merged object
//! actually differs from the live one. Failures stay scoped to the one
//! descriptor being applied; retry happens by the next reconcile pass, not
//! inside the engine. The single exception is a write conflict, which is
//! re-fetched and re-merged once within the pass.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::core::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Coroot;
use crate::Error;

pub mod merge;

pub use merge::{merge_into_live, policy_for, MergePolicy};

/// What a managed resource should look like, for one reconcile pass.
///
/// Descriptors are recomputed from the instance spec on every pass and never
/// persisted.
#[derive(Clone, Debug)]
pub struct ResourceDescriptor {
    /// Kind, group/version, and plural of the resource
    pub api_resource: ApiResource,
    /// Namespace; `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Resource name
    pub name: String,
    /// Desired fields as a sparse manifest
    pub manifest: Value,
    /// Whether the resource must outlive the owning instance
    pub retain: bool,
    /// Whether the resource must be removed rather than applied
    pub delete: bool,
}

impl ResourceDescriptor {
    /// Build a descriptor from a typed Kubernetes object
    pub fn from_object<K>(object: &K, retain: bool) -> Result<Self, Error>
    where
        K: Resource<DynamicType = ()> + serde::Serialize,
    {
        let mut manifest = serde_json::to_value(object)?;
        manifest["apiVersion"] = K::api_version(&()).as_ref().into();
        manifest["kind"] = K::kind(&()).as_ref().into();
        Ok(Self {
            api_resource: ApiResource::erase::<K>(&()),
            namespace: object.meta().namespace.clone(),
            name: object.meta().name.clone().unwrap_or_default(),
            manifest,
            retain,
            delete: false,
        })
    }

    /// Mark the descriptor as a deletion when `delete` is true
    pub fn deleting(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }
}

/// Result of applying one descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The resource did not exist and was created
    Created,
    /// The live resource differed from the merged state and was updated
    Updated,
    /// The live resource already matched; nothing was written
    Unchanged,
    /// The resource was deleted
    Deleted,
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Access to live resources by kind and identity.
///
/// The engine never lists or watches; it is told which object to reconcile.
/// The trait exists so the engine and everything built on it can be tested
/// against mocks and in-memory fakes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LiveClient: Send + Sync {
    /// Fetch an object; `None` when it does not exist
    async fn get<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create an object
    async fn create<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace an object (the object must carry the live resourceVersion)
    async fn replace<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object; `false` when it was already absent
    async fn delete<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<bool, Error>;
}

/// Production [`LiveClient`] backed by the cluster API
pub struct KubeLiveClient {
    client: Client,
}

impl KubeLiveClient {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl LiveClient for KubeLiveClient {
    async fn get<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn create<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        Ok(self
            .api(resource, namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        Ok(self
            .api(resource, namespace)
            .replace(name, &PostParams::default(), object)
            .await?)
    }

    async fn delete<'a>(
        &self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
        name: &str,
    ) -> Result<bool, Error> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// The apply engine
#[derive(Clone)]
pub struct Applier {
    live: std::sync::Arc<dyn LiveClient>,
}

impl Applier {
    /// Create an applier on top of a live-resource client
    pub fn new(live: std::sync::Arc<dyn LiveClient>) -> Self {
        Self { live }
    }

    /// The underlying live-resource client
    pub fn live(&self) -> &dyn LiveClient {
        self.live.as_ref()
    }

    /// Reconcile one descriptor against live state.
    ///
    /// Returns the outcome, or the transport error for this one resource;
    /// callers are expected to log the error and carry on with the rest of
    /// their pass.
    pub async fn apply(
        &self,
        descriptor: &ResourceDescriptor,
        owner: &Coroot,
    ) -> Result<ApplyOutcome, Error> {
        let resource = &descriptor.api_resource;
        let namespace = descriptor.namespace.as_deref();

        if descriptor.delete {
            return match self.live.delete(resource, namespace, &descriptor.name).await? {
                true => Ok(ApplyOutcome::Deleted),
                false => Ok(ApplyOutcome::Unchanged),
            };
        }

        let policy = policy_for(&resource.kind);
        let mut retried_conflict = false;
        loop {
            let live = self.live.get(resource, namespace, &descriptor.name).await?;

            let (live_value, existed) = match &live {
                Some(obj) => (serde_json::to_value(obj)?, true),
                None => (json!({}), false),
            };

            let mut merged = merge_into_live(&policy, &live_value, &descriptor.manifest);
            apply_ownership(&mut merged, owner, descriptor.retain);

            if existed && merged == live_value {
                return Ok(ApplyOutcome::Unchanged);
            }

            let object: DynamicObject = serde_json::from_value(merged)?;
            let result = if existed {
                self.live
                    .replace(resource, namespace, &descriptor.name, &object)
                    .await
                    .map(|_| ApplyOutcome::Updated)
            } else {
                self.live
                    .create(resource, namespace, &object)
                    .await
                    .map(|_| ApplyOutcome::Created)
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Kube(kube::Error::Api(ae))) if ae.code == 409 && !retried_conflict => {
                    // Concurrent writer; re-fetch and re-merge once.
                    debug!(kind = %resource.kind, name = %descriptor.name, "write conflict, retrying merge");
                    retried_conflict = true;
                }
                Err(Error::Kube(kube::Error::Api(ae))) if ae.code == 409 => {
                    return Err(Error::Conflict {
                        kind: resource.kind.clone(),
                        name: descriptor.name.clone(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Attach or strip the controller owner reference.
///
/// Owned resources are reclaimed by the cluster's garbage collector when
/// their instance is deleted. Retained resources are shared across instances
/// and must not carry a controller reference at all.
fn apply_ownership(manifest: &mut Value, owner: &Coroot, retain: bool) {
    if retain {
        remove_controller_reference(manifest);
        return;
    }
    let Some(uid) = owner.meta().uid.clone() else {
        return;
    };
    let owner_ref = json!({
        "apiVersion": Coroot::api_version(&()).as_ref(),
        "kind": Coroot::kind(&()).as_ref(),
        "name": owner.name_any(),
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    });
    let refs = manifest
        .pointer_mut("/metadata/ownerReferences")
        .and_then(Value::as_array_mut);
    match refs {
        Some(refs) => {
            refs.retain(|r| r["controller"] != json!(true));
            refs.push(owner_ref);
        }
        None => {
            merge::set_field(manifest, "/metadata/ownerReferences", json!([owner_ref]));
        }
    }
}

fn remove_controller_reference(manifest: &mut Value) {
    if let Some(refs) = manifest
        .pointer_mut("/metadata/ownerReferences")
        .and_then(Value::as_array_mut)
    {
        refs.retain(|r| r["controller"] != json!(true));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory [`LiveClient`] for exercising full apply flows

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type Key = (String, String, String);

    /// Stores full object manifests keyed by (kind, namespace, name) and
    /// records every write so tests can assert on write amplification.
    #[derive(Default)]
    pub(crate) struct FakeLiveClient {
        objects: Mutex<BTreeMap<Key, Value>>,
        writes: Mutex<Vec<String>>,
    }

    impl FakeLiveClient {
        fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
            (
                resource.kind.clone(),
                namespace.unwrap_or_default().to_string(),
                name.to_string(),
            )
        }

        pub(crate) fn value_of(
            &self,
            kind: &str,
            namespace: &str,
            name: &str,
        ) -> Option<Value> {
            self.objects
                .lock()
                .unwrap()
                .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
                .cloned()
        }

        pub(crate) fn names_of_kind(&self, kind: &str) -> Vec<String> {
            self.objects
                .lock()
                .unwrap()
                .keys()
                .filter(|(k, _, _)| k == kind)
                .map(|(_, _, name)| name.clone())
                .collect()
        }

        pub(crate) fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        /// Mutate a stored object in place, simulating another actor
        pub(crate) fn mutate<F: FnOnce(&mut Value)>(
            &self,
            kind: &str,
            namespace: &str,
            name: &str,
            f: F,
        ) {
            let mut objects = self.objects.lock().unwrap();
            let value = objects
                .get_mut(&(kind.to_string(), namespace.to_string(), name.to_string()))
                .expect("object not found");
            f(value);
        }
    }

    #[async_trait]
    impl LiveClient for FakeLiveClient {
        async fn get<'a>(
            &self,
            resource: &ApiResource,
            namespace: Option<&'a str>,
            name: &str,
        ) -> Result<Option<DynamicObject>, Error> {
            let objects = self.objects.lock().unwrap();
            match objects.get(&Self::key(resource, namespace, name)) {
                Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
                None => Ok(None),
            }
        }

        async fn create<'a>(
            &self,
            resource: &ApiResource,
            namespace: Option<&'a str>,
            object: &DynamicObject,
        ) -> Result<DynamicObject, Error> {
            let key = Self::key(resource, namespace, &object.name_any());
            let value = serde_json::to_value(object)?;
            self.objects.lock().unwrap().insert(key, value);
            self.writes
                .lock()
                .unwrap()
                .push(format!("create {} {}", resource.kind, object.name_any()));
            Ok(object.clone())
        }

        async fn replace<'a>(
            &self,
            resource: &ApiResource,
            namespace: Option<&'a str>,
            name: &str,
            object: &DynamicObject,
        ) -> Result<DynamicObject, Error> {
            let key = Self::key(resource, namespace, name);
            let value = serde_json::to_value(object)?;
            self.objects.lock().unwrap().insert(key, value);
            self.writes
                .lock()
                .unwrap()
                .push(format!("replace {} {}", resource.kind, name));
            Ok(object.clone())
        }

        async fn delete<'a>(
            &self,
            resource: &ApiResource,
            namespace: Option<&'a str>,
            name: &str,
        ) -> Result<bool, Error> {
            let existed = self
                .objects
                .lock()
                .unwrap()
                .remove(&Self::key(resource, namespace, name))
                .is_some();
            if existed {
                self.writes
                    .lock()
                    .unwrap()
                    .push(format!("delete {} {}", resource.kind, name));
            }
            Ok(existed)
        }
    }
}
