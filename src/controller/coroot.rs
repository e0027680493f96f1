//! Reconciliation logic for Coroot instances
//!
//! One reconcile pass drives everything a single instance describes:
//! agents, the Coroot workload, and the bundled backends. Convergence is
//! eventual, not transactional - a failed apply is logged and skipped, and
//! the pass relies on being invoked again (by a watch event or the periodic
//! version refresh) to finish the job. Passes for the same instance are
//! serialized by the controller runtime; passes for different instances run
//! concurrently and share only the instance registry and the version
//! catalog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::apply::{Applier, ApplyOutcome, KubeLiveClient, ResourceDescriptor};
use crate::config;
use crate::crd::{Coroot, CorootSpec, CorootStatus};
use crate::registry::{InstanceKey, InstanceRegistry};
use crate::template;
use crate::validate;
use crate::versions::{HttpVersionRegistry, VersionCatalog, VersionRegistry};
use crate::Error;

/// Re-check delay for instances with configuration errors
pub const MISCONFIGURED_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for one reconcile pass; expiry aborts in-flight work, which is
/// safe because every step is idempotent and retried on the next invocation
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(600);

/// Access to Coroot instances themselves (fetch and status writeback)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Fetch an instance; `None` when it has been deleted
    async fn fetch(&self, key: &InstanceKey) -> Result<Option<Coroot>, Error>;

    /// Write the status projection through the status subresource
    async fn patch_status(&self, cr: &Coroot, status: &CorootStatus) -> Result<(), Error>;
}

/// Production [`InstanceClient`] backed by the cluster API
pub struct InstanceClientImpl {
    client: Client,
}

impl InstanceClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceClient for InstanceClientImpl {
    async fn fetch(&self, key: &InstanceKey) -> Result<Option<Coroot>, Error> {
        let api: Api<Coroot> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn patch_status(&self, cr: &Coroot, status: &CorootStatus) -> Result<(), Error> {
        let namespace = cr.namespace().unwrap_or_default();
        let api: Api<Coroot> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &cr.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

/// Shared controller state
pub struct Context {
    /// Instance fetch and status writeback
    pub instances: Arc<dyn InstanceClient>,
    /// The apply engine
    pub applier: Applier,
    /// Set of currently known instances
    pub registry: Arc<InstanceRegistry>,
    /// Cached component versions
    pub catalog: Arc<VersionCatalog>,
    /// Source of published component versions
    pub version_registry: Arc<dyn VersionRegistry>,
}

impl Context {
    /// Create a production context from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            instances: Arc::new(InstanceClientImpl::new(client.clone())),
            applier: Applier::new(Arc::new(KubeLiveClient::new(client))),
            registry: Arc::new(InstanceRegistry::default()),
            catalog: Arc::new(VersionCatalog::default()),
            version_registry: Arc::new(HttpVersionRegistry::default()),
        }
    }

    /// Create a context over mock or in-memory collaborators
    #[cfg(test)]
    pub fn for_testing(
        instances: Arc<dyn InstanceClient>,
        applier: Applier,
        version_registry: Arc<dyn VersionRegistry>,
    ) -> Self {
        Self {
            instances,
            applier,
            registry: Arc::new(InstanceRegistry::default()),
            catalog: Arc::new(VersionCatalog::default()),
            version_registry,
        }
    }
}

/// Reconcile one Coroot instance (controller-runtime entry point)
#[instrument(skip(cr, ctx), fields(namespace = %cr.namespace().unwrap_or_default(), name = %cr.name_any()))]
pub async fn reconcile(cr: Arc<Coroot>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = InstanceKey::new(cr.namespace().unwrap_or_default(), cr.name_any());
    match tokio::time::timeout(RECONCILE_TIMEOUT, reconcile_key(&key, &ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(%key, "reconcile pass hit its deadline");
            Ok(Action::requeue(MISCONFIGURED_RECHECK_INTERVAL))
        }
    }
}

/// Requeue policy for reconcile errors (instance fetch failures; everything
/// else is handled inside the pass)
pub fn error_policy(_cr: Arc<Coroot>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(%error, "reconcile failed");
    Action::requeue(MISCONFIGURED_RECHECK_INTERVAL)
}

/// Reconcile by instance key.
///
/// This is the whole pass; the periodic version refresher drives the same
/// path directly, without going through the watch machinery.
pub async fn reconcile_key(key: &InstanceKey, ctx: &Context) -> Result<Action, Error> {
    let Some(cr) = ctx.instances.fetch(key).await? else {
        // Deletion is observed as a failed fetch, not a delete event. Owned
        // resources are reclaimed through owner references; the shared
        // cluster-scoped ones need manual cleanup once nobody is left.
        info!(%key, "instance has been deleted");
        if ctx.registry.mark_gone(key) {
            cleanup_shared_resources(ctx, key).await;
        }
        return Ok(Action::await_change());
    };
    ctx.registry.mark_seen(key);

    // Cluster-scoped RBAC first, then the node-level agent, then the
    // cluster-level agent. The order is not needed for correctness (every
    // apply is independently idempotent) but keeps the observable creation
    // sequence deterministic.
    apply_object(ctx, &cr, &template::service_account(&cr, "cluster-agent"), false).await;
    apply_object(ctx, &cr, &template::cluster_agent::cluster_role(&cr), true).await;
    apply_object(
        ctx,
        &cr,
        &template::cluster_agent::cluster_role_binding(&cr),
        true,
    )
    .await;

    apply_object(ctx, &cr, &template::service_account(&cr, "node-agent"), false).await;
    apply_object(
        ctx,
        &cr,
        &template::node_agent::daemon_set(&cr, &ctx.catalog),
        false,
    )
    .await;

    apply_object(
        ctx,
        &cr,
        &template::cluster_agent::deployment(&cr, &ctx.catalog),
        false,
    )
    .await;

    if cr.spec.agents_only.is_some() {
        write_status(ctx, &cr, CorootStatus::ok()).await;
        return Ok(Action::await_change());
    }

    let validation_errors = validate::validate(&cr, ctx.applier.live()).await;

    apply_object(ctx, &cr, &template::service_account(&cr, "coroot"), false).await;
    for pvc in template::coroot::pvcs(&cr) {
        apply_object(ctx, &cr, &pvc, cr.spec.storage.retain()).await;
    }
    match config::render(&ctx.applier, &cr).await {
        Ok(rendered) => {
            apply_object(ctx, &cr, &template::coroot::config_map(&cr, &rendered), false).await;
            let hash = config::content_hash(&rendered);
            apply_object(
                ctx,
                &cr,
                &template::coroot::stateful_set(&cr, &ctx.catalog, &hash),
                false,
            )
            .await;
        }
        Err(error) => {
            warn!(%error, "failed to render configuration, workload left as-is");
        }
    }
    apply_object(ctx, &cr, &template::coroot::service(&cr), false).await;
    apply_deletable(
        ctx,
        &cr,
        &template::coroot::ingress(&cr),
        cr.spec.ingress.is_none(),
    )
    .await;

    if cr.spec.external_prometheus.is_none() {
        apply_object(ctx, &cr, &template::service_account(&cr, "prometheus"), false).await;
        apply_object(
            ctx,
            &cr,
            &template::prometheus::pvc(&cr),
            cr.spec.prometheus.storage.retain(),
        )
        .await;
        apply_object(
            ctx,
            &cr,
            &template::prometheus::deployment(&cr, &ctx.catalog),
            false,
        )
        .await;
        apply_object(ctx, &cr, &template::prometheus::service(&cr), false).await;
    }

    if cr.spec.external_clickhouse.is_none() {
        let (secret, key_name) = template::clickhouse::password_secret(&cr);
        if let Err(error) =
            crate::secrets::ensure_secret(&ctx.applier, &cr, &secret, &key_name, 16).await
        {
            warn!(%error, secret = %secret, "failed to provision clickhouse password");
        }

        apply_object(
            ctx,
            &cr,
            &template::service_account(&cr, "clickhouse-keeper"),
            false,
        )
        .await;
        apply_object(
            ctx,
            &cr,
            &template::clickhouse::keeper_service_headless(&cr),
            false,
        )
        .await;
        for pvc in template::clickhouse::keeper_pvcs(&cr) {
            apply_object(ctx, &cr, &pvc, cr.spec.clickhouse.keeper.storage.retain()).await;
        }
        apply_object(
            ctx,
            &cr,
            &template::clickhouse::keeper_stateful_set(&cr, &ctx.catalog),
            false,
        )
        .await;

        apply_object(ctx, &cr, &template::service_account(&cr, "clickhouse"), false).await;
        apply_object(ctx, &cr, &template::clickhouse::service_headless(&cr), false).await;
        for pvc in template::clickhouse::pvcs(&cr) {
            apply_object(ctx, &cr, &pvc, cr.spec.clickhouse.storage.retain()).await;
        }
        for sts in template::clickhouse::stateful_sets(&cr, &ctx.catalog) {
            apply_object(ctx, &cr, &sts, false).await;
        }
        apply_object(ctx, &cr, &template::clickhouse::service(&cr), false).await;
    }

    if validation_errors.is_empty() {
        write_status(ctx, &cr, CorootStatus::ok()).await;
        Ok(Action::await_change())
    } else {
        write_status(ctx, &cr, CorootStatus::misconfigured(validation_errors)).await;
        Ok(Action::requeue(MISCONFIGURED_RECHECK_INTERVAL))
    }
}

/// Apply one typed object through the engine, logging instead of failing.
///
/// A transport error on one resource must not stop the rest of the pass;
/// the resource is retried whenever the pass runs next.
async fn apply_object<K>(ctx: &Context, cr: &Coroot, object: &K, retain: bool)
where
    K: kube::Resource<DynamicType = ()> + serde::Serialize,
{
    match ResourceDescriptor::from_object(object, retain) {
        Ok(descriptor) => apply_descriptor(ctx, cr, descriptor).await,
        Err(error) => warn!(%error, "failed to build resource descriptor"),
    }
}

async fn apply_deletable<K>(ctx: &Context, cr: &Coroot, object: &K, delete: bool)
where
    K: kube::Resource<DynamicType = ()> + serde::Serialize,
{
    match ResourceDescriptor::from_object(object, false) {
        Ok(descriptor) => apply_descriptor(ctx, cr, descriptor.deleting(delete)).await,
        Err(error) => warn!(%error, "failed to build resource descriptor"),
    }
}

async fn apply_descriptor(ctx: &Context, cr: &Coroot, descriptor: ResourceDescriptor) {
    let kind = descriptor.api_resource.kind.clone();
    let name = descriptor.name.clone();
    match ctx.applier.apply(&descriptor, cr).await {
        Ok(ApplyOutcome::Unchanged) => {}
        Ok(outcome) => info!(%kind, %name, %outcome, "applied"),
        Err(error) => warn!(%kind, %name, %error, "failed to apply"),
    }
}

async fn write_status(ctx: &Context, cr: &Coroot, status: CorootStatus) {
    if let Err(error) = ctx.instances.patch_status(cr, &status).await {
        warn!(%error, "failed to update status");
    }
}

/// Best-effort deletion of the shared cluster-scoped resources.
///
/// Called when the last known instance disappears. These objects carry no
/// owner reference, so nothing else will ever clean them up. Failures are
/// logged and swallowed; there is no retry path for this cleanup.
async fn cleanup_shared_resources(ctx: &Context, key: &InstanceKey) {
    info!(%key, "last instance removed, deleting shared cluster-scoped resources");
    let mut departed = Coroot::new(&key.name, CorootSpec::default());
    departed.metadata.namespace = Some(key.namespace.clone());

    apply_deletable(
        ctx,
        &departed,
        &template::cluster_agent::cluster_role_binding(&departed),
        true,
    )
    .await;
    apply_deletable(
        ctx,
        &departed,
        &template::cluster_agent::cluster_role(&departed),
        true,
    )
    .await;
}
