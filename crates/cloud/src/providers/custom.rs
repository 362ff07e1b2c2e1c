//! Bring-your-own cluster provider.
//!
//! Adopts an existing cluster addressed by a kubeconfig file. The platform
//! never owns the underlying infrastructure, so "create" records the
//! cluster and "delete" only forgets it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use tracing::info;

use crate::command::{CommandRunner, ProcessRunner};
use crate::providers::registry::{config_string, ProviderConfig};
use crate::providers::traits::{ensure_spec_for, Provider, ProviderError};
use crate::providers::types::{
    cluster_id, Addon, AddonSpec, Cluster, ClusterSpec, ClusterStatus, CostEstimate, Credentials,
    KUBECONFIG_PATH_KEY,
};
use crate::providers::{addons, health};
use crate::store::{update_with, ClusterStore, FileClusterStore};

/// Registry name.
pub const PROVIDER_NAME: &str = "custom";

/// Existing-cluster provider.
#[derive(Clone)]
pub struct Custom {
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn ClusterStore>,
    kubeconfig_path: Option<PathBuf>,
}

impl Custom {
    /// Create a provider over an explicit runner and store.
    pub fn new(runner: Arc<dyn CommandRunner>, store: Arc<dyn ClusterStore>) -> Self {
        Self {
            runner,
            store,
            kubeconfig_path: None,
        }
    }

    /// Adopt clusters from the kubeconfig at `path`.
    #[must_use]
    pub fn with_kubeconfig_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = Some(path.into());
        self
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `kubeconfigPath`, `storePath`.
    ///
    /// # Errors
    ///
    /// Never fails today; a missing kubeconfig is reported on first use.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let store = config_string(config, "storePath")
            .map_or_else(FileClusterStore::at_default_path, FileClusterStore::new);
        let mut provider = Self::new(Arc::new(ProcessRunner), Arc::new(store));
        provider.kubeconfig_path = config_string(config, "kubeconfigPath").map(PathBuf::from);
        Ok(provider)
    }

    fn configured_path(&self) -> Result<&Path, ProviderError> {
        self.kubeconfig_path.as_deref().ok_or_else(|| {
            ProviderError::Config("custom: 'kubeconfigPath' is required".to_string())
        })
    }

    async fn read_kubeconfig(path: &Path) -> Result<String, ProviderError> {
        tokio::fs::read_to_string(path).await.map_err(|e| {
            ProviderError::Config(format!("cannot read kubeconfig {}: {e}", path.display()))
        })
    }

    async fn record(&self, id: &str) -> Result<Cluster, ProviderError> {
        self.store
            .load()
            .await?
            .remove(id)
            .filter(|c| c.provider == PROVIDER_NAME)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    fn recorded_path(cluster: &Cluster) -> Result<PathBuf, ProviderError> {
        cluster
            .metadata
            .get(KUBECONFIG_PATH_KEY)
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| {
                ProviderError::Config(format!("{} has no recorded kubeconfig", cluster.id))
            })
    }
}

#[async_trait]
impl Provider for Custom {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        let kubeconfig = Self::read_kubeconfig(self.configured_path()?).await?;
        health::client_from_kubeconfig(&kubeconfig).await?;
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        let kubeconfig = Self::read_kubeconfig(self.configured_path()?).await?;
        let client = health::client_from_kubeconfig(&kubeconfig).await?;
        Api::<Namespace>::all(client)
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| ProviderError::Auth(format!("cannot list namespaces: {e}")))?;
        Ok(())
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        let path = self.configured_path()?.to_path_buf();
        let kubeconfig = Self::read_kubeconfig(&path).await?;

        let mut cluster = Cluster::new(PROVIDER_NAME, spec);
        cluster.endpoint = health::kubeconfig_server(&kubeconfig);
        cluster.metadata.insert(
            KUBECONFIG_PATH_KEY.to_string(),
            path.display().to_string().into(),
        );
        cluster.transition(ClusterStatus::Running);

        info!(cluster_id = %cluster.id, kubeconfig = %path.display(), "Adopted existing cluster");
        let record = cluster.clone();
        self.store
            .update(Box::new(move |clusters| {
                clusters.insert(record.id.clone(), record);
                Ok(())
            }))
            .await?;
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let id = id.to_string();
        update_with(self.store.as_ref(), move |clusters| {
            match clusters.get(&id) {
                Some(c) if c.provider == PROVIDER_NAME => {}
                _ => return Err(ProviderError::NotFound(id)),
            }
            clusters.remove(&id);
            info!(cluster_id = %id, "Released adopted cluster; infrastructure left untouched");
            Ok(())
        })
        .await
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        let id = id.to_string();
        let tags = spec.tags.clone();
        update_with(self.store.as_ref(), move |clusters| {
            let cluster = clusters
                .get_mut(&id)
                .filter(|c| c.provider == PROVIDER_NAME)
                .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
            cluster.tags.extend(tags);
            cluster.updated_at = Utc::now();
            Ok(cluster.clone())
        })
        .await
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        self.record(id).await
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        Ok(self
            .store
            .load()
            .await?
            .into_values()
            .filter(|c| c.provider == PROVIDER_NAME)
            .collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        let cluster = self.record(id).await?;
        Self::read_kubeconfig(&Self::recorded_path(&cluster)?).await
    }

    async fn install_addon(&self, cluster_id: &str, addon: &AddonSpec) -> Result<(), ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::install(self.runner.as_ref(), &kubeconfig, addon).await
    }

    async fn uninstall_addon(
        &self,
        cluster_id: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::uninstall(self.runner.as_ref(), &kubeconfig, name, namespace).await
    }

    async fn list_addons(&self, cluster_id: &str) -> Result<Vec<Addon>, ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::list(self.runner.as_ref(), &kubeconfig).await
    }

    async fn estimate_cost(&self, _spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        // Infrastructure is billed outside the platform
        Ok(CostEstimate {
            currency: "USD".to_string(),
            hourly: 0.0,
            monthly: 0.0,
            items: Vec::new(),
        })
    }
}

/// Identifier a cluster named `name` gets when adopted.
#[must_use]
pub fn adopted_id(name: &str) -> String {
    cluster_id(PROVIDER_NAME, name)
}
