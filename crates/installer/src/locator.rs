//! Cross-provider cluster lookup by id.
//!
//! Every provider reports ids as `<provider>-<name>`, so the owning
//! provider is found from the id prefix alone. The local `kind` provider
//! is always present, configured or not.

use std::collections::BTreeMap;
use std::sync::Arc;

use adhar_cloud::providers::DEFAULT_PROVIDER;
use adhar_cloud::{Cluster, Provider, ProviderConfig, ProviderError, ProviderRegistry};
use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::debug;

use crate::config::PlatformConfig;

/// Providers indexed by registry name.
#[derive(Default)]
pub struct ClusterLocator {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ClusterLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `provider` under its own name, replacing any earlier one.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Every provider in `config` plus the default local provider.
    ///
    /// # Errors
    ///
    /// Provider settings that fail to resolve or construct.
    pub fn from_config(config: Option<&PlatformConfig>, registry: &ProviderRegistry) -> Result<Self> {
        let mut locator = Self::new();
        if let Some(config) = config {
            for key in config.providers.keys() {
                let (provider_type, settings) = config.provider_settings(key)?;
                let provider = registry
                    .create_provider(&provider_type, &settings)
                    .with_context(|| format!("Failed to create provider {key}"))?;
                locator = locator.with_provider(provider);
            }
        }
        if !locator.providers.contains_key(DEFAULT_PROVIDER) {
            debug!(provider = DEFAULT_PROVIDER, "Adding default local provider");
            locator = locator.with_provider(registry.create_provider(DEFAULT_PROVIDER, &ProviderConfig::new())?);
        }
        Ok(locator)
    }

    /// Registered provider names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Provider owning `id`. The longest matching prefix wins so that
    /// provider names containing dashes resolve correctly.
    #[must_use]
    pub fn provider_for(&self, id: &str) -> Option<&Arc<dyn Provider>> {
        self.providers
            .iter()
            .filter(|(name, _)| {
                id.strip_prefix(name.as_str())
                    .and_then(|rest| rest.strip_prefix('-'))
                    .is_some_and(|rest| !rest.is_empty())
            })
            .max_by_key(|(name, _)| name.len())
            .map(|(_, provider)| provider)
    }

    fn owner(&self, id: &str) -> Result<&Arc<dyn Provider>, ProviderError> {
        self.provider_for(id)
            .ok_or_else(|| ProviderError::NotFound(format!("no configured provider issues id {id}")))
    }

    /// # Errors
    ///
    /// `NotFound` when no provider owns the id or the cluster is absent.
    pub async fn get(&self, id: &str) -> Result<Cluster, ProviderError> {
        self.owner(id)?.get_cluster(id).await
    }

    /// # Errors
    ///
    /// Same as [`Self::get`].
    pub async fn kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        self.owner(id)?.get_kubeconfig(id).await
    }

    /// # Errors
    ///
    /// Same as [`Self::get`].
    pub async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        self.owner(id)?.delete_cluster(id).await
    }

    /// Clusters of every provider, queried concurrently. Each provider's
    /// error is reported separately.
    pub async fn list(&self) -> Vec<(String, Result<Vec<Cluster>, ProviderError>)> {
        let queries = self.providers.iter().map(|(name, provider)| async move {
            (name.clone(), provider.list_clusters().await)
        });
        join_all(queries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adhar_cloud::testing::FakeProvider;
    use adhar_cloud::ClusterSpec;

    fn locator() -> (ClusterLocator, Arc<FakeProvider>, Arc<FakeProvider>) {
        let kind = Arc::new(FakeProvider::new("kind"));
        let dashed = Arc::new(FakeProvider::new("kind-remote"));
        let locator = ClusterLocator::new()
            .with_provider(Arc::clone(&kind) as Arc<dyn Provider>)
            .with_provider(Arc::clone(&dashed) as Arc<dyn Provider>);
        (locator, kind, dashed)
    }

    #[test]
    fn test_longest_prefix_owns_the_id() {
        let (locator, _, _) = locator();
        assert_eq!(locator.provider_for("kind-adhar").unwrap().name(), "kind");
        assert_eq!(locator.provider_for("kind-remote-dev").unwrap().name(), "kind-remote");
        assert!(locator.provider_for("civo-dev").is_none());
        assert!(locator.provider_for("kind-").is_none());
    }

    #[tokio::test]
    async fn test_get_routes_to_owner() {
        let (locator, kind, dashed) = locator();
        dashed.insert(Cluster::new("kind-remote", &ClusterSpec::new("kind-remote", "dev")));

        let cluster = locator.get("kind-remote-dev").await.unwrap();
        assert_eq!(cluster.name, "dev");
        assert!(kind.calls().is_empty());

        let err = locator.get("aws-prod").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_reports_every_provider() {
        let (locator, kind, _) = locator();
        kind.insert(Cluster::new("kind", &ClusterSpec::new("kind", "adhar")));

        let listed = locator.list().await;
        assert_eq!(listed.len(), 2);
        let (name, clusters) = &listed[0];
        assert_eq!(name, "kind");
        assert_eq!(clusters.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_default_provider_is_always_present() {
        let registry = ProviderRegistry::new();
        registry.register("kind", |_| Ok(Arc::new(FakeProvider::new("kind")) as Arc<dyn Provider>));
        registry.register("civo", |_| Ok(Arc::new(FakeProvider::new("civo")) as Arc<dyn Provider>));
        let config = PlatformConfig::from_yaml("providers:\n  civo:\n    region: LON1\n").unwrap();

        let locator = ClusterLocator::from_config(Some(&config), &registry).unwrap();
        assert_eq!(locator.names(), ["civo", "kind"]);
    }
}
