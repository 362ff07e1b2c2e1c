//! GKE API client implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::models::{
    ClusterDefinition, ClusterListResponse, ClusterUpdate, CreateClusterRequest,
    CreateNodePoolRequest, GkeCluster, NodeConfigDefinition, NodePool, NodePoolAutoscaling,
    NodePoolDefinition, NodePoolListResponse, NodeTaint, SetLabelsRequest, SetNodePoolSizeRequest,
    UpdateClusterRequest,
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
pub const PROVIDER_NAME: &str = "gcp";

/// GKE API root.
pub const DEFAULT_BASE_URL: &str = "https://container.googleapis.com/v1";

/// GKE labels are lowercase `[a-z0-9_-]`, so ownership uses a flat label.
const MANAGED_LABEL: &str = "adhar-managed-by";

const DEFAULT_LOCATION: &str = "us-central1";

/// GCP provider.
#[derive(Clone)]
pub struct Gcp {
    api: ApiClient,
    /// Project ID.
    project_id: String,
    /// Default zone or region.
    location: String,
}

impl Gcp {
    /// Create a new GCP provider.
    ///
    /// # Arguments
    /// * `project_id` - GCP project ID
    /// * `access_token` - `OAuth2` access token
    /// * `location` - Default zone or region (e.g., "us-central1")
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(project_id: &str, access_token: &str, location: &str) -> Result<Self, ProviderError> {
        Self::with_base_url(DEFAULT_BASE_URL, project_id, access_token, location)
    }

    /// Create a provider against a different API root.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        base_url: &str,
        project_id: &str,
        access_token: &str,
        location: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            api: ApiClient::new(base_url, access_token)?,
            project_id: project_id.to_string(),
            location: location.to_string(),
        })
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `project` (required), `accessToken` (falls back to
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`), `location`, `baseUrl`.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] when the project or token is missing.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let project = required_string(config, PROVIDER_NAME, "project")?;
        let token = config_string(config, "accessToken")
            .or_else(|| {
                std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty())
            })
            .ok_or_else(|| {
                ProviderError::Config(
                    "gcp: 'accessToken' is required (or set GOOGLE_OAUTH_ACCESS_TOKEN)".to_string(),
                )
            })?;
        let location =
            config_string(config, "location").unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let base_url =
            config_string(config, "baseUrl").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(&base_url, &project, &token, &location)
    }

    fn clusters_path(&self, location: &str) -> String {
        format!("/projects/{}/locations/{location}/clusters", self.project_id)
    }

    fn cluster_path(&self, name: &str) -> String {
        format!("{}/{name}", self.clusters_path(&self.location))
    }

    fn bare_name(id: &str) -> Result<&str, ProviderError> {
        parse_cluster_id(PROVIDER_NAME, id)
            .ok_or_else(|| ProviderError::NotFound(format!("{id} is not a gcp cluster id")))
    }

    fn sanitize_label(s: &str) -> String {
        s.to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(63)
            .collect()
    }

    fn encode_labels(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut labels: BTreeMap<String, String> = tags
            .iter()
            .filter(|(k, _)| k.as_str() != MANAGED_BY_TAG)
            .map(|(k, v)| (Self::sanitize_label(k), Self::sanitize_label(v)))
            .collect();
        labels.insert(MANAGED_LABEL.to_string(), "adhar".to_string());
        labels
    }

    fn decode_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        labels
            .iter()
            .map(|(k, v)| {
                if k == MANAGED_LABEL {
                    (MANAGED_BY_TAG.to_string(), v.clone())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    fn node_pool(spec: &NodeGroupSpec) -> NodePoolDefinition {
        NodePoolDefinition {
            name: spec.name.clone(),
            initial_node_count: spec.replicas,
            config: NodeConfigDefinition {
                machine_type: if spec.instance_type.is_empty() {
                    pricing::GCP.default_instance.to_string()
                } else {
                    spec.instance_type.clone()
                },
                disk_size_gb: Some(100),
                image_type: Some("COS_CONTAINERD".to_string()),
                labels: spec.labels.clone(),
                taints: spec
                    .taints
                    .iter()
                    .map(|t| NodeTaint {
                        key: t.key.clone(),
                        value: t.value.clone(),
                        effect: match t.effect.as_str() {
                            "PreferNoSchedule" => "PREFER_NO_SCHEDULE",
                            "NoExecute" => "NO_EXECUTE",
                            _ => "NO_SCHEDULE",
                        }
                        .to_string(),
                    })
                    .collect(),
            },
            autoscaling: spec.autoscaling().then(|| NodePoolAutoscaling {
                enabled: true,
                min_node_count: spec.min_size,
                max_node_count: spec.max_size,
            }),
        }
    }

    /// Convert GKE cluster to our type.
    fn to_cluster(&self, cluster: &GkeCluster) -> Cluster {
        let status = match cluster.status.as_str() {
            "PROVISIONING" => ClusterStatus::Creating,
            "RUNNING" => ClusterStatus::Running,
            "RECONCILING" => ClusterStatus::Updating,
            "STOPPING" => ClusterStatus::Deleting,
            "ERROR" | "DEGRADED" => ClusterStatus::Error,
            _ => ClusterStatus::Unknown,
        };
        let created_at = cluster
            .create_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));
        let native_id = format!(
            "projects/{}/locations/{}/clusters/{}",
            self.project_id, cluster.location, cluster.name
        );

        Cluster {
            id: cluster_id(PROVIDER_NAME, &cluster.name),
            name: cluster.name.clone(),
            provider: PROVIDER_NAME.to_string(),
            region: cluster.location.clone(),
            version: cluster.current_master_version.clone().unwrap_or_default(),
            status,
            endpoint: cluster
                .endpoint
                .as_deref()
                .filter(|e| !e.is_empty())
                .map(|e| format!("https://{e}")),
            created_at,
            updated_at: Utc::now(),
            tags: Self::decode_labels(&cluster.resource_labels),
            metadata: [(NATIVE_ID_KEY.to_string(), native_id.into())].into(),
        }
    }

    fn to_node_group(cluster_id: &str, pool: &NodePool) -> NodeGroup {
        NodeGroup {
            name: pool.name.clone(),
            cluster_id: cluster_id.to_string(),
            instance_type: pool
                .config
                .as_ref()
                .map(|c| c.machine_type.clone())
                .unwrap_or_default(),
            replicas: pool.initial_node_count.unwrap_or(0),
            min_size: pool.autoscaling.as_ref().and_then(|a| a.min_node_count),
            max_size: pool.autoscaling.as_ref().and_then(|a| a.max_node_count),
            status: pool.status.clone().unwrap_or_default().to_lowercase(),
        }
    }

    async fn find(&self, id: &str) -> Result<GkeCluster, ProviderError> {
        let name = Self::bare_name(id)?;
        self.api.get(&self.cluster_path(name)).await
    }

    /// Render a kubeconfig that authenticates with `gke-gcloud-auth-plugin`.
    fn render_kubeconfig(cluster: &GkeCluster) -> Result<String, ProviderError> {
        let endpoint = cluster
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ProviderError::Config("Cluster endpoint not available".to_string()))?;
        let ca = cluster
            .master_auth
            .as_ref()
            .and_then(|a| a.cluster_ca_certificate.as_deref())
            .unwrap_or_default();
        let name = &cluster.name;

        Ok(format!(
            r"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: {ca}
    server: https://{endpoint}
  name: {name}
contexts:
- context:
    cluster: {name}
    user: {name}
  name: {name}
current-context: {name}
users:
- name: {name}
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: gke-gcloud-auth-plugin
      installHint: Install gke-gcloud-auth-plugin for use with kubectl
      provideClusterInfo: true
"
        ))
    }
}

#[async_trait]
impl Provider for Gcp {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn api_endpoint(&self) -> Option<&str> {
        Some(self.api.base_url())
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        if !self.api.has_token() {
            return Err(ProviderError::Auth("no GCP access token configured".to_string()));
        }
        let _: ClusterListResponse = self.api.get(&self.clusters_path("-")).await?;
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        let _: ClusterListResponse = self.api.get(&self.clusters_path(&self.location)).await?;
        Ok(())
    }

    // ========================================================================
    // GKE
    // ========================================================================

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        let location = if spec.region.is_empty() { &self.location } else { &spec.region };
        info!(
            name = %spec.name,
            version = %spec.version,
            location = %location,
            "Creating GKE cluster"
        );

        let body = CreateClusterRequest {
            cluster: ClusterDefinition {
                name: spec.name.clone(),
                initial_cluster_version: (!spec.version.is_empty()).then(|| spec.version.clone()),
                network: spec.networking.vpc_id.clone(),
                cluster_ipv4_cidr: spec.networking.pod_cidr.clone(),
                node_pools: spec.node_groups.iter().map(Self::node_pool).collect(),
                resource_labels: Self::encode_labels(&spec.tags),
            },
        };
        // The create call returns a long-running operation, not the cluster
        self.api.post_unit(&self.clusters_path(location), &body).await?;

        info!(cluster_name = %spec.name, "GKE cluster creation initiated");
        let mut cluster = Cluster::new(PROVIDER_NAME, spec);
        cluster.region.clone_from(location);
        cluster.metadata.insert(
            NATIVE_ID_KEY.to_string(),
            format!("projects/{}/locations/{location}/clusters/{}", self.project_id, spec.name)
                .into(),
        );
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let name = Self::bare_name(id)?;
        info!(cluster_name = %name, "Deleting GKE cluster");
        self.api.delete(&self.cluster_path(name)).await?;
        info!(cluster_name = %name, "GKE cluster deletion initiated");
        Ok(())
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        let body = SetLabelsRequest {
            resource_labels: Self::encode_labels(&spec.tags),
            label_fingerprint: cluster.label_fingerprint.clone().unwrap_or_default(),
        };
        self.api
            .post_unit(
                &format!("{}:setResourceLabels", self.cluster_path(&cluster.name)),
                &body,
            )
            .await?;
        let mut updated = self.to_cluster(&cluster);
        updated.tags = Self::decode_labels(&body.resource_labels);
        Ok(updated)
    }

    async fn upgrade_cluster(&self, id: &str, version: &str) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        info!(cluster_name = %cluster.name, version, "Upgrading GKE control plane");
        let body = UpdateClusterRequest {
            update: ClusterUpdate {
                desired_master_version: version.to_string(),
            },
        };
        let _: serde_json::Value = self.api.put(&self.cluster_path(&cluster.name), &body).await?;
        let mut upgraded = self.to_cluster(&cluster);
        upgraded.transition(ClusterStatus::Updating);
        Ok(upgraded)
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        Ok(self.to_cluster(&cluster))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        let response: ClusterListResponse = self.api.get(&self.clusters_path("-")).await?;
        Ok(response.clusters.iter().map(|c| self.to_cluster(c)).collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        let cluster = self.find(id).await?;
        Self::render_kubeconfig(&cluster)
    }

    // ========================================================================
    // Node pools
    // ========================================================================

    async fn add_node_group(
        &self,
        cluster_id: &str,
        spec: &NodeGroupSpec,
    ) -> Result<NodeGroup, ProviderError> {
        let name = Self::bare_name(cluster_id)?;
        let body = CreateNodePoolRequest {
            node_pool: Self::node_pool(spec),
        };
        self.api
            .post_unit(&format!("{}/nodePools", self.cluster_path(name)), &body)
            .await?;
        Ok(NodeGroup {
            name: spec.name.clone(),
            cluster_id: cluster_id.to_string(),
            instance_type: body.node_pool.config.machine_type,
            replicas: spec.replicas,
            min_size: spec.min_size,
            max_size: spec.max_size,
            status: "provisioning".to_string(),
        })
    }

    async fn remove_node_group(&self, cluster_id: &str, name: &str) -> Result<(), ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        self.api
            .delete(&format!("{}/nodePools/{name}", self.cluster_path(cluster)))
            .await
    }

    async fn scale_node_group(
        &self,
        cluster_id: &str,
        name: &str,
        replicas: u32,
    ) -> Result<NodeGroup, ProviderError> {
        let mut group = self.get_node_group(cluster_id, name).await?;
        let cluster = Self::bare_name(cluster_id)?;
        self.api
            .post_unit(
                &format!("{}/nodePools/{name}:setSize", self.cluster_path(cluster)),
                &SetNodePoolSizeRequest {
                    node_count: replicas,
                },
            )
            .await?;
        group.replicas = replicas;
        Ok(group)
    }

    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let name = Self::bare_name(cluster_id)?;
        let response: NodePoolListResponse = self
            .api
            .get(&format!("{}/nodePools", self.cluster_path(name)))
            .await?;
        Ok(response
            .node_pools
            .iter()
            .map(|p| Self::to_node_group(cluster_id, p))
            .collect())
    }

    async fn estimate_cost(&self, spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(pricing::GCP.estimate(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLUSTERS: &str = "/projects/my-project/locations/us-central1/clusters";

    fn gke(name: &str, status: &str) -> serde_json::Value {
        json!({
            "name": name,
            "location": "us-central1",
            "status": status,
            "currentMasterVersion": "1.31.1-gke.100",
            "endpoint": "34.1.2.3",
            "masterAuth": {"clusterCaCertificate": "Q0E="},
            "resourceLabels": {"adhar-managed-by": "adhar", "env": "prod"},
            "labelFingerprint": "abc",
            "createTime": "2025-01-02T03:04:05+00:00",
            "nodePools": []
        })
    }

    fn provider(server: &MockServer) -> Gcp {
        Gcp::with_base_url(&server.uri(), "my-project", "token", "us-central1").unwrap()
    }

    #[test]
    fn test_label_sanitizing() {
        let tags = [("Team.Name".to_string(), "Platform Eng".to_string())].into();
        let labels = Gcp::encode_labels(&tags);
        assert_eq!(labels.get("team_name").map(String::as_str), Some("platform_eng"));
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("adhar"));
    }

    #[tokio::test]
    async fn test_create_posts_node_pools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CLUSTERS))
            .and(body_partial_json(json!({
                "cluster": {
                    "name": "prod",
                    "nodePools": [{"name": "default", "initialNodeCount": 1,
                                   "config": {"machineType": "e2-standard-4"}}]
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "operation-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = provider(&server)
            .create_cluster(&ClusterSpec::new(PROVIDER_NAME, "prod"))
            .await
            .unwrap();
        assert_eq!(cluster.id, "gcp-prod");
        assert_eq!(cluster.status, ClusterStatus::Creating);
        assert_eq!(
            cluster.native_id(),
            Some("projects/my-project/locations/us-central1/clusters/prod")
        );
    }

    #[tokio::test]
    async fn test_get_cluster_and_kubeconfig() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS}/prod")))
            .respond_with(ResponseTemplate::new(200).set_body_json(gke("prod", "RUNNING")))
            .mount(&server)
            .await;

        let provider = provider(&server);
        let cluster = provider.get_cluster("gcp-prod").await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert_eq!(cluster.endpoint.as_deref(), Some("https://34.1.2.3"));
        assert!(cluster.is_managed());

        let kubeconfig = provider.get_kubeconfig("gcp-prod").await.unwrap();
        assert!(kubeconfig.contains("server: https://34.1.2.3"));
        assert!(kubeconfig.contains("certificate-authority-data: Q0E="));
        assert!(kubeconfig.contains("command: gke-gcloud-auth-plugin"));
    }

    #[tokio::test]
    async fn test_missing_cluster_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS}/ghost")))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{CLUSTERS}/ghost")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert!(provider.get_cluster("gcp-ghost").await.unwrap_err().is_not_found());
        assert!(provider.delete_cluster("gcp-ghost").await.unwrap_err().is_not_found());
        assert!(provider.get_cluster("aws-ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_scale_node_pool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS}/prod/nodePools")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nodePools": [{"name": "default", "status": "RUNNING", "initialNodeCount": 3,
                               "config": {"machineType": "e2-standard-4"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{CLUSTERS}/prod/nodePools/default:setSize")))
            .and(body_partial_json(json!({"nodeCount": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "op"})))
            .expect(1)
            .mount(&server)
            .await;

        let group = provider(&server)
            .scale_node_group("gcp-prod", "default", 5)
            .await
            .unwrap();
        assert_eq!(group.replicas, 5);
        assert_eq!(group.instance_type, "e2-standard-4");
    }
}
