//! AKS API client implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde_json::Value;
use tracing::info;

use super::models::{
    AgentPool, AgentPoolListResponse, AgentPoolProfile, AgentPoolProperties, AksCluster,
    AksClusterListResponse, AksCredentials, CreateAksClusterProperties, CreateAksClusterRequest,
    ManagedIdentity, NetworkProfile, TagsPatch,
};
use crate::providers::http::ApiClient;
use crate::providers::pricing;
use crate::providers::registry::{config_string, required_string, ProviderConfig};
use crate::providers::traits::{ensure_spec_for, Provider, ProviderError};
use crate::providers::types::{
    cluster_id, parse_cluster_id, Cluster, ClusterSpec, ClusterStatus, CostEstimate, Credentials,
    NodeGroup, NodeGroupSpec, MANAGED_BY_TAG, NATIVE_ID_KEY,
};

/// Registry name.
pub const PROVIDER_NAME: &str = "azure";

/// Azure Resource Manager root.
pub const DEFAULT_BASE_URL: &str = "https://management.azure.com";

/// Azure API version for AKS.
const AKS_API_VERSION: &str = "2024-05-01";

/// Azure tag names cannot contain `/`.
const MANAGED_TAG: &str = "adhar-managed-by";

const DEFAULT_LOCATION: &str = "eastus";

/// Azure provider.
#[derive(Clone)]
pub struct Azure {
    api: ApiClient,
    /// Subscription ID.
    subscription_id: String,
    /// Resource group.
    resource_group: String,
    /// Default location.
    location: String,
}

impl Azure {
    /// Create a new Azure provider.
    ///
    /// # Arguments
    /// * `subscription_id` - Azure subscription ID
    /// * `resource_group` - Resource group name
    /// * `access_token` - `OAuth2` access token
    /// * `location` - Default location (e.g., "eastus")
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        subscription_id: &str,
        resource_group: &str,
        access_token: &str,
        location: &str,
    ) -> Result<Self, ProviderError> {
        Self::with_base_url(DEFAULT_BASE_URL, subscription_id, resource_group, access_token, location)
    }

    /// Create a provider against a different ARM root.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        base_url: &str,
        subscription_id: &str,
        resource_group: &str,
        access_token: &str,
        location: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            api: ApiClient::new(base_url, access_token)?.with_query("api-version", AKS_API_VERSION),
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            location: location.to_string(),
        })
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `subscriptionId` (required), `resourceGroup`
    /// (required), `accessToken` (falls back to `AZURE_ACCESS_TOKEN`),
    /// `location`, `baseUrl`.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] when a required key is missing.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let subscription = required_string(config, PROVIDER_NAME, "subscriptionId")?;
        let resource_group = required_string(config, PROVIDER_NAME, "resourceGroup")?;
        let token = config_string(config, "accessToken")
            .or_else(|| std::env::var("AZURE_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                ProviderError::Config(
                    "azure: 'accessToken' is required (or set AZURE_ACCESS_TOKEN)".to_string(),
                )
            })?;
        let location =
            config_string(config, "location").unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let base_url =
            config_string(config, "baseUrl").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(&base_url, &subscription, &resource_group, &token, &location)
    }

    fn clusters_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters",
            self.subscription_id, self.resource_group
        )
    }

    fn cluster_path(&self, name: &str) -> String {
        format!("{}/{name}", self.clusters_path())
    }

    fn bare_name(id: &str) -> Result<&str, ProviderError> {
        parse_cluster_id(PROVIDER_NAME, id)
            .ok_or_else(|| ProviderError::NotFound(format!("{id} is not an azure cluster id")))
    }

    fn encode_tags(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut encoded: BTreeMap<String, String> = tags
            .iter()
            .filter(|(k, _)| k.as_str() != MANAGED_BY_TAG)
            .map(|(k, v)| (k.replace(['/', '\\', '?', '%', '&', '<', '>'], "-"), v.clone()))
            .collect();
        encoded.insert(MANAGED_TAG.to_string(), "adhar".to_string());
        encoded
    }

    fn decode_tags(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        tags.iter()
            .map(|(k, v)| {
                if k == MANAGED_TAG {
                    (MANAGED_BY_TAG.to_string(), v.clone())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    fn agent_pool(spec: &NodeGroupSpec, system: bool) -> AgentPoolProfile {
        AgentPoolProfile {
            // AKS pool names are lowercase alphanumerics, at most 12 characters
            name: spec
                .name
                .to_lowercase()
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .take(12)
                .collect(),
            count: spec.replicas,
            vm_size: if spec.instance_type.is_empty() {
                pricing::AZURE.default_instance.to_string()
            } else {
                spec.instance_type.clone()
            },
            os_type: "Linux".to_string(),
            mode: if system { "System" } else { "User" }.to_string(),
            enable_auto_scaling: spec.autoscaling(),
            min_count: spec.min_size,
            max_count: spec.max_size,
            node_labels: spec.labels.clone(),
            node_taints: spec
                .taints
                .iter()
                .map(|t| format!("{}={}:{}", t.key, t.value, t.effect))
                .collect(),
            provisioning_state: None,
        }
    }

    /// Convert AKS cluster to our type.
    fn to_cluster(cluster: &AksCluster) -> Cluster {
        let status = match cluster.properties.provisioning_state.as_str() {
            "Creating" => ClusterStatus::Creating,
            "Succeeded" => ClusterStatus::Running,
            "Updating" | "Upgrading" | "Scaling" => ClusterStatus::Updating,
            "Deleting" => ClusterStatus::Deleting,
            "Failed" | "Canceled" => ClusterStatus::Error,
            _ => ClusterStatus::Unknown,
        };
        let now = Utc::now();

        Cluster {
            id: cluster_id(PROVIDER_NAME, &cluster.name),
            name: cluster.name.clone(),
            provider: PROVIDER_NAME.to_string(),
            region: cluster.location.clone(),
            version: cluster.properties.kubernetes_version.clone(),
            status,
            endpoint: cluster
                .properties
                .fqdn
                .as_ref()
                .map(|fqdn| format!("https://{fqdn}")),
            // ARM does not report a creation time on the resource
            created_at: now,
            updated_at: now,
            tags: Self::decode_tags(&cluster.tags),
            metadata: [(NATIVE_ID_KEY.to_string(), cluster.id.clone().into())].into(),
        }
    }

    fn to_node_group(cluster_id: &str, pool: &AgentPool) -> NodeGroup {
        NodeGroup {
            name: pool.name.clone(),
            cluster_id: cluster_id.to_string(),
            instance_type: pool.properties.vm_size.clone(),
            replicas: pool.properties.count,
            min_size: pool.properties.min_count,
            max_size: pool.properties.max_count,
            status: pool
                .properties
                .provisioning_state
                .clone()
                .unwrap_or_default()
                .to_lowercase(),
        }
    }

    async fn find(&self, id: &str) -> Result<AksCluster, ProviderError> {
        self.api.get(&self.cluster_path(Self::bare_name(id)?)).await
    }
}

#[async_trait]
impl Provider for Azure {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn api_endpoint(&self) -> Option<&str> {
        Some(self.api.base_url())
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        if !self.api.has_token() {
            return Err(ProviderError::Auth("no Azure access token configured".to_string()));
        }
        let _: AksClusterListResponse = self
            .api
            .get(&format!(
                "/subscriptions/{}/providers/Microsoft.ContainerService/managedClusters",
                self.subscription_id
            ))
            .await?;
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        let _: AksClusterListResponse = self.api.get(&self.clusters_path()).await?;
        Ok(())
    }

    // ========================================================================
    // AKS
    // ========================================================================

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        let location = if spec.region.is_empty() { &self.location } else { &spec.region };
        info!(
            name = %spec.name,
            version = %spec.version,
            location = %location,
            "Creating AKS cluster"
        );

        let body = CreateAksClusterRequest {
            location: location.clone(),
            tags: Self::encode_tags(&spec.tags),
            identity: ManagedIdentity {
                identity_type: "SystemAssigned".to_string(),
            },
            properties: CreateAksClusterProperties {
                kubernetes_version: (!spec.version.is_empty()).then(|| spec.version.clone()),
                dns_prefix: spec.name.clone(),
                agent_pool_profiles: spec
                    .node_groups
                    .iter()
                    .enumerate()
                    .map(|(i, g)| Self::agent_pool(g, i == 0))
                    .collect(),
                network_profile: NetworkProfile {
                    // Cilium and friends are installed by the bootstrap, so AKS brings none
                    network_plugin: if spec.networking.cni.is_empty() {
                        "azure".to_string()
                    } else {
                        "none".to_string()
                    },
                    pod_cidr: spec.networking.pod_cidr.clone(),
                    service_cidr: spec.networking.service_cidr.clone(),
                },
            },
        };

        let cluster: AksCluster = self.api.put(&self.cluster_path(&spec.name), &body).await?;
        info!(cluster_id = %cluster.id, "AKS cluster creation initiated");
        Ok(Self::to_cluster(&cluster))
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let name = Self::bare_name(id)?;
        info!(cluster_name = %name, "Deleting AKS cluster");
        self.api.delete(&self.cluster_path(name)).await?;
        info!(cluster_name = %name, "AKS cluster deletion initiated");
        Ok(())
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        let name = Self::bare_name(id)?;
        let updated: AksCluster = self
            .api
            .patch(
                &self.cluster_path(name),
                &TagsPatch {
                    tags: Self::encode_tags(&spec.tags),
                },
            )
            .await?;
        Ok(Self::to_cluster(&updated))
    }

    async fn upgrade_cluster(&self, id: &str, version: &str) -> Result<Cluster, ProviderError> {
        let name = Self::bare_name(id)?;
        info!(cluster_name = %name, version, "Upgrading AKS cluster");
        // ARM PUT replaces the resource, so round-trip the full document
        let mut document: Value = self.api.get(&self.cluster_path(name)).await?;
        document["properties"]["kubernetesVersion"] = Value::String(version.to_string());
        let upgraded: AksCluster = self.api.put(&self.cluster_path(name), &document).await?;
        Ok(Self::to_cluster(&upgraded))
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        Ok(Self::to_cluster(&self.find(id).await?))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        let response: AksClusterListResponse = self.api.get(&self.clusters_path()).await?;
        Ok(response.value.iter().map(Self::to_cluster).collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        let name = Self::bare_name(id)?;
        let credentials: AksCredentials = self
            .api
            .post(
                &format!("{}/listClusterUserCredential", self.cluster_path(name)),
                &serde_json::json!({}),
            )
            .await?;
        let entry = credentials
            .kubeconfigs
            .first()
            .ok_or_else(|| ProviderError::NotFound(format!("no kubeconfig returned for {id}")))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&entry.value)
            .map_err(|e| ProviderError::Config(format!("invalid kubeconfig encoding: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| ProviderError::Config(format!("kubeconfig is not UTF-8: {e}")))
    }

    // ========================================================================
    // Agent pools
    // ========================================================================

    async fn add_node_group(
        &self,
        cluster_id: &str,
        spec: &NodeGroupSpec,
    ) -> Result<NodeGroup, ProviderError> {
        let name = Self::bare_name(cluster_id)?;
        let profile = Self::agent_pool(spec, false);
        let body = AgentPool {
            name: profile.name.clone(),
            properties: AgentPoolProperties {
                count: profile.count,
                vm_size: profile.vm_size,
                os_type: profile.os_type,
                mode: profile.mode,
                enable_auto_scaling: profile.enable_auto_scaling,
                min_count: profile.min_count,
                max_count: profile.max_count,
                provisioning_state: None,
            },
        };
        let mut created: AgentPool = self
            .api
            .put(
                &format!("{}/agentPools/{}", self.cluster_path(name), profile.name),
                &body,
            )
            .await?;
        if created.name.is_empty() {
            created.name = profile.name;
        }
        Ok(Self::to_node_group(cluster_id, &created))
    }

    async fn remove_node_group(&self, cluster_id: &str, name: &str) -> Result<(), ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        self.api
            .delete(&format!("{}/agentPools/{name}", self.cluster_path(cluster)))
            .await
    }

    async fn scale_node_group(
        &self,
        cluster_id: &str,
        name: &str,
        replicas: u32,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        let path = format!("{}/agentPools/{name}", self.cluster_path(cluster));
        let mut pool: AgentPool = self.api.get(&path).await?;
        pool.properties.count = replicas;
        let mut scaled: AgentPool = self.api.put(&path, &pool).await?;
        if scaled.name.is_empty() {
            scaled.name = name.to_string();
        }
        Ok(Self::to_node_group(cluster_id, &scaled))
    }

    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        let response: AgentPoolListResponse = self
            .api
            .get(&format!("{}/agentPools", self.cluster_path(cluster)))
            .await?;
        Ok(response
            .value
            .iter()
            .map(|p| Self::to_node_group(cluster_id, p))
            .collect())
    }

    async fn estimate_cost(&self, spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(pricing::AZURE.estimate(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLUSTERS: &str =
        "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters";

    fn aks(name: &str, state: &str, version: &str) -> serde_json::Value {
        json!({
            "id": format!("{CLUSTERS}/{name}"),
            "name": name,
            "location": "eastus",
            "tags": {"adhar-managed-by": "adhar"},
            "properties": {
                "provisioningState": state,
                "kubernetesVersion": version,
                "fqdn": format!("{name}-dns.hcp.eastus.azmk8s.io"),
                "agentPoolProfiles": [{"name": "default", "count": 3, "vmSize": "Standard_D4s_v3"}]
            }
        })
    }

    fn provider(server: &MockServer) -> Azure {
        Azure::with_base_url(&server.uri(), "sub", "rg", "token", "eastus").unwrap()
    }

    #[tokio::test]
    async fn test_create_uses_put_with_system_pool() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("{CLUSTERS}/prod")))
            .and(query_param("api-version", AKS_API_VERSION))
            .and(body_partial_json(json!({
                "location": "eastus",
                "identity": {"type": "SystemAssigned"},
                "properties": {
                    "dnsPrefix": "prod",
                    "agentPoolProfiles": [{"name": "default", "mode": "System", "count": 1}]
                }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(aks("prod", "Creating", "1.30.4")))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = provider(&server)
            .create_cluster(&ClusterSpec::new(PROVIDER_NAME, "prod"))
            .await
            .unwrap();
        assert_eq!(cluster.id, "azure-prod");
        assert_eq!(cluster.status, ClusterStatus::Creating);
        assert!(cluster.is_managed());
        assert_eq!(
            cluster.endpoint.as_deref(),
            Some("https://prod-dns.hcp.eastus.azmk8s.io")
        );
    }

    #[tokio::test]
    async fn test_upgrade_round_trips_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS}/prod")))
            .respond_with(ResponseTemplate::new(200).set_body_json(aks("prod", "Succeeded", "1.30.4")))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{CLUSTERS}/prod")))
            .and(body_partial_json(json!({
                "location": "eastus",
                "properties": {"kubernetesVersion": "1.31.1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(aks("prod", "Upgrading", "1.31.1")))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = provider(&server).upgrade_cluster("azure-prod", "1.31.1").await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Updating);
        assert_eq!(cluster.version, "1.31.1");
    }

    #[tokio::test]
    async fn test_kubeconfig_is_base64_decoded() {
        let server = MockServer::start().await;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode("apiVersion: v1\nkind: Config\n");
        Mock::given(method("POST"))
            .and(path(format!("{CLUSTERS}/prod/listClusterUserCredential")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kubeconfigs": [{"name": "clusterUser", "value": encoded}]
            })))
            .mount(&server)
            .await;

        let kubeconfig = provider(&server).get_kubeconfig("azure-prod").await.unwrap();
        assert_eq!(kubeconfig, "apiVersion: v1\nkind: Config\n");
    }

    #[tokio::test]
    async fn test_scale_agent_pool() {
        let server = MockServer::start().await;
        let pool = json!({"name": "user", "properties": {"count": 2, "vmSize": "Standard_D4s_v3"}});
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS}/prod/agentPools/user")))
            .respond_with(ResponseTemplate::new(200).set_body_json(pool))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{CLUSTERS}/prod/agentPools/user")))
            .and(body_partial_json(json!({"properties": {"count": 6}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "user",
                "properties": {"count": 6, "vmSize": "Standard_D4s_v3", "provisioningState": "Scaling"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let group = provider(&server)
            .scale_node_group("azure-prod", "user", 6)
            .await
            .unwrap();
        assert_eq!(group.replicas, 6);
        assert_eq!(group.status, "scaling");
    }

    #[test]
    fn test_pool_name_is_sanitized() {
        let spec = NodeGroupSpec {
            name: "General-Purpose-Pool".into(),
            ..NodeGroupSpec::default()
        };
        assert_eq!(Azure::agent_pool(&spec, false).name, "generalpurpo");
    }
}
