//! Coroot operator - Kubernetes operator for the Coroot observability stack

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coroot_operator::controller::{error_policy, reconcile, reconcile_key, Context};
use coroot_operator::crd::Coroot;
use coroot_operator::versions::{refresh_catalog, run_refresher, VERSIONS_UPDATE_INTERVAL};
use coroot_operator::FIELD_MANAGER;

/// Coroot operator - manages Coroot deployments from Coroot custom resources
#[derive(Parser, Debug)]
#[command(name = "coroot-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Coroot::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller().await
}

/// Install the Coroot CRD on startup using server-side apply, so the CRD
/// version always matches the operator version
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("installing Coroot CRD");
    crds.patch("coroots.coroot.com", &params, &Patch::Apply(&Coroot::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install Coroot CRD: {}", e))?;
    Ok(())
}

async fn run_controller() -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crd_installed(&client).await?;

    let ctx = Arc::new(Context::new(client.clone()));

    // First fetch happens synchronously; a failure leaves the cache empty
    // and every component falls back to its hardcoded default version
    // instead of blocking startup.
    refresh_catalog(&ctx.catalog, ctx.version_registry.as_ref()).await;

    // Periodic refresh plus a bounded re-reconcile of every known instance,
    // so unpinned instances pick up newly published versions without an
    // external trigger.
    let refresher_ctx = ctx.clone();
    tokio::spawn(run_refresher(
        ctx.catalog.clone(),
        ctx.version_registry.clone(),
        ctx.registry.clone(),
        VERSIONS_UPDATE_INTERVAL,
        move |key| {
            let ctx = refresher_ctx.clone();
            async move {
                match tokio::time::timeout(VERSIONS_UPDATE_INTERVAL, reconcile_key(&key, &ctx))
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(%key, %error, "periodic reconcile failed");
                    }
                    Err(_) => tracing::warn!(%key, "periodic reconcile timed out"),
                }
            }
        },
    ));

    let instances: Api<Coroot> = Api::all(client.clone());

    tracing::info!("starting Coroot controller");
    Controller::new(instances, WatcherConfig::default())
        .owns(Api::<Deployment>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<StatefulSet>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<DaemonSet>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ServiceAccount>::all(client.clone()), WatcherConfig::default())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            WatcherConfig::default(),
        )
        .owns(Api::<Secret>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ConfigMap>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Ingress>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ClusterRole>::all(client.clone()), WatcherConfig::default())
        .owns(
            Api::<ClusterRoleBinding>::all(client.clone()),
            WatcherConfig::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => tracing::warn!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    tracing::info!("controller terminated");
    Ok(())
}
