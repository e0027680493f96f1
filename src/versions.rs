//! Component version catalog and its background refresher
//!
//! Instances that do not pin a component version get the latest published
//! one. The catalog caches the published versions; the refresher re-fetches
//! them on a fixed interval and re-reconciles every known instance so new
//! defaults roll out without waiting for a spec change.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::registry::{InstanceKey, InstanceRegistry};
use crate::Error;

/// How often published component versions are re-fetched
pub const VERSIONS_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default endpoint publishing the latest component versions
pub const DEFAULT_VERSIONS_URL: &str = "https://coroot.com/versions.json";

/// A deployable component with a published version
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum App {
    /// Coroot Community Edition
    CorootCE,
    /// Coroot Enterprise Edition
    CorootEE,
    /// Per-node telemetry agent
    NodeAgent,
    /// Cluster-level agent
    ClusterAgent,
    /// Bundled Prometheus
    Prometheus,
    /// Bundled ClickHouse server
    Clickhouse,
    /// Bundled ClickHouse Keeper
    ClickhouseKeeper,
}

impl App {
    /// Every known component
    pub const ALL: [App; 7] = [
        App::CorootCE,
        App::CorootEE,
        App::NodeAgent,
        App::ClusterAgent,
        App::Prometheus,
        App::Clickhouse,
        App::ClickhouseKeeper,
    ];

    /// Key used for this component in the published version map
    pub fn key(&self) -> &'static str {
        match self {
            App::CorootCE => "coroot",
            App::CorootEE => "coroot-ee",
            App::NodeAgent => "node-agent",
            App::ClusterAgent => "cluster-agent",
            App::Prometheus => "prometheus",
            App::Clickhouse => "clickhouse",
            App::ClickhouseKeeper => "clickhouse-keeper",
        }
    }

    /// Look up a component by its published key
    pub fn from_key(key: &str) -> Option<App> {
        App::ALL.into_iter().find(|app| app.key() == key)
    }

    /// Image repository for this component
    pub fn repository(&self) -> &'static str {
        match self {
            App::CorootCE => "docker.io/coroot/coroot",
            App::CorootEE => "docker.io/coroot/coroot-ee",
            App::NodeAgent => "docker.io/coroot/coroot-node-agent",
            App::ClusterAgent => "docker.io/coroot/coroot-cluster-agent",
            App::Prometheus => "docker.io/prom/prometheus",
            App::Clickhouse => "docker.io/clickhouse/clickhouse-server",
            App::ClickhouseKeeper => "docker.io/clickhouse/clickhouse-keeper",
        }
    }

    /// Version used when neither the instance nor the catalog has one
    pub fn fallback_version(&self) -> &'static str {
        match self {
            App::CorootCE => "1.6.4",
            App::CorootEE => "1.6.4",
            App::NodeAgent => "1.23.5",
            App::ClusterAgent => "1.2.3",
            App::Prometheus => "v2.55.1",
            App::Clickhouse => "24.8",
            App::ClickhouseKeeper => "24.8",
        }
    }
}

/// Thread-safe cache of published component versions.
///
/// The cache is replaced wholesale on refresh; reads copy the entry out
/// under a briefly-held lock that is never held across I/O.
#[derive(Default)]
pub struct VersionCatalog {
    versions: Mutex<HashMap<App, String>>,
}

impl VersionCatalog {
    /// Replace the whole cache
    pub fn replace(&self, versions: HashMap<App, String>) {
        *self.versions.lock().expect("catalog lock") = versions;
    }

    /// Published version for a component, if any
    pub fn version(&self, app: App) -> Option<String> {
        self.versions.lock().expect("catalog lock").get(&app).cloned()
    }

    /// Full image reference for a component.
    ///
    /// A version pinned on the instance wins over the catalog; the hardcoded
    /// fallback applies when both are absent.
    pub fn image(&self, app: App, pinned: Option<&str>) -> String {
        let version = match pinned {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => self
                .version(app)
                .unwrap_or_else(|| app.fallback_version().to_string()),
        };
        format!("{}:{}", app.repository(), version)
    }
}

/// Source of published component versions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionRegistry: Send + Sync {
    /// Fetch the latest published version of every component
    async fn fetch_latest(&self) -> Result<HashMap<App, String>, Error>;
}

/// [`VersionRegistry`] backed by an HTTPS endpoint serving a JSON
/// `component -> version` map
pub struct HttpVersionRegistry {
    url: String,
    client: reqwest::Client,
}

impl HttpVersionRegistry {
    /// Use the given endpoint URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpVersionRegistry {
    fn default() -> Self {
        let url = std::env::var("COROOT_VERSIONS_URL")
            .unwrap_or_else(|_| DEFAULT_VERSIONS_URL.to_string());
        Self::new(url)
    }
}

#[async_trait]
impl VersionRegistry for HttpVersionRegistry {
    async fn fetch_latest(&self) -> Result<HashMap<App, String>, Error> {
        let published: HashMap<String, String> = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(published
            .into_iter()
            .filter_map(|(key, version)| App::from_key(&key).map(|app| (app, version)))
            .collect())
    }
}

/// Refresh the catalog from the registry once.
///
/// On failure the previous cache is kept unchanged; a transient fetch error
/// must never empty a working cache. Returns whether the refresh succeeded.
pub async fn refresh_catalog(catalog: &VersionCatalog, registry: &dyn VersionRegistry) -> bool {
    match registry.fetch_latest().await {
        Ok(versions) => {
            debug!(components = versions.len(), "refreshed component versions");
            catalog.replace(versions);
            true
        }
        Err(error) => {
            warn!(%error, "failed to fetch component versions");
            false
        }
    }
}

/// Run the periodic refresh loop.
///
/// Every `interval`: refresh the catalog, then re-reconcile every known
/// instance through `reconcile`. Re-reconciles are independent of each
/// other; the caller's closure is responsible for bounding each one with a
/// deadline and swallowing its errors.
pub async fn run_refresher<F, Fut>(
    catalog: Arc<VersionCatalog>,
    registry: Arc<dyn VersionRegistry>,
    instances: Arc<InstanceRegistry>,
    interval: Duration,
    reconcile: F,
) where
    F: Fn(InstanceKey) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The startup refresh already happened synchronously; skip the
    // immediate first tick.
    tick.tick().await;
    loop {
        tick.tick().await;
        refresh_catalog(&catalog, registry.as_ref()).await;
        let keys = instances.keys();
        info!(instances = keys.len(), "re-reconciling after version refresh");
        for key in keys {
            reconcile(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_version_wins_over_catalog_and_fallback() {
        let catalog = VersionCatalog::default();
        catalog.replace(HashMap::from([(App::CorootCE, "1.7.0".to_string())]));

        assert_eq!(
            catalog.image(App::CorootCE, Some("1.5.0")),
            "docker.io/coroot/coroot:1.5.0"
        );
        assert_eq!(
            catalog.image(App::CorootCE, None),
            "docker.io/coroot/coroot:1.7.0"
        );
        assert_eq!(
            catalog.image(App::NodeAgent, None),
            format!(
                "docker.io/coroot/coroot-node-agent:{}",
                App::NodeAgent.fallback_version()
            )
        );
    }

    #[test]
    fn empty_pin_falls_through_to_the_catalog() {
        let catalog = VersionCatalog::default();
        catalog.replace(HashMap::from([(App::NodeAgent, "1.24.0".to_string())]));
        assert_eq!(
            catalog.image(App::NodeAgent, Some("")),
            "docker.io/coroot/coroot-node-agent:1.24.0"
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_previous_cache() {
        let catalog = VersionCatalog::default();
        catalog.replace(HashMap::from([(App::CorootCE, "1.6.0".to_string())]));

        let mut registry = MockVersionRegistry::new();
        registry.expect_fetch_latest().returning(|| {
            Err(Error::validation("registry unreachable"))
        });

        assert!(!refresh_catalog(&catalog, &registry).await);
        assert_eq!(catalog.version(App::CorootCE), Some("1.6.0".to_string()));
    }

    #[tokio::test]
    async fn successful_refresh_replaces_the_cache_wholesale() {
        let catalog = VersionCatalog::default();
        catalog.replace(HashMap::from([
            (App::CorootCE, "1.6.0".to_string()),
            (App::NodeAgent, "1.23.0".to_string()),
        ]));

        let mut registry = MockVersionRegistry::new();
        registry.expect_fetch_latest().returning(|| {
            Ok(HashMap::from([(App::CorootCE, "1.7.0".to_string())]))
        });

        assert!(refresh_catalog(&catalog, &registry).await);
        assert_eq!(catalog.version(App::CorootCE), Some("1.7.0".to_string()));
        // Entries missing from the new map are gone, not merged.
        assert_eq!(catalog.version(App::NodeAgent), None);
    }

    #[test]
    fn published_keys_round_trip() {
        for app in App::ALL {
            assert_eq!(App::from_key(app.key()), Some(app));
        }
        assert_eq!(App::from_key("something-else"), None);
    }
}
