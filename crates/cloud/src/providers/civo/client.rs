//! Civo API client implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::models::{
    Ack, CivoCluster, CivoNetwork, CivoPool, CivoVolume, ClusterListResponse,
    CreateClusterRequest, CreateNetworkRequest, CreateVolumeRequest, Quota, UpdateClusterRequest,
    UpdatePoolRequest,
};
use crate::providers::http::ApiClient;
use crate::providers::pricing;
use crate::providers::registry::{config_string, ProviderConfig};
use crate::providers::traits::{ensure_spec_for, Provider, ProviderError, QuotaChecker};
use crate::providers::types::{
    cluster_id, parse_cluster_id, Cluster, ClusterSpec, ClusterStatus, CostEstimate, Credentials,
    NodeGroup, NodeGroupSpec, QuotaItem, QuotaReport, Volume, VolumeSpec, Vpc, VpcSpec,
    MANAGED_BY_TAG, NATIVE_ID_KEY,
};

/// Registry name.
pub const PROVIDER_NAME: &str = "civo";

/// Public API root.
pub const DEFAULT_BASE_URL: &str = "https://api.civo.com/v2";

const MANAGED_TAG: &str = "adhar-managed";

const DEFAULT_REGION: &str = "LON1";

/// Civo provider.
#[derive(Clone)]
pub struct Civo {
    api: ApiClient,
    region: String,
}

impl Civo {
    /// Create a new Civo provider.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(token: &str, region: &str) -> Result<Self, ProviderError> {
        Self::with_base_url(DEFAULT_BASE_URL, token, region)
    }

    /// Create a provider against a different API root.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_base_url(base_url: &str, token: &str, region: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            api: ApiClient::new(base_url, token)?.with_query("region", region),
            region: region.to_string(),
        })
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `token` (falls back to `CIVO_TOKEN`), `region`,
    /// `baseUrl`.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] when no token is available.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let token = config_string(config, "token")
            .or_else(|| std::env::var("CIVO_TOKEN").ok().filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                ProviderError::Config("civo: 'token' is required (or set CIVO_TOKEN)".to_string())
            })?;
        let region = config_string(config, "region").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let base_url =
            config_string(config, "baseUrl").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(&base_url, &token, &region)
    }

    fn encode_tags(tags: &BTreeMap<String, String>) -> String {
        tags.iter()
            .filter(|(k, _)| k.as_str() != MANAGED_BY_TAG)
            .map(|(k, v)| format!("{k}={v}").replace(' ', "_"))
            .chain(std::iter::once(MANAGED_TAG.to_string()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn decode_tags(tags: &[String]) -> BTreeMap<String, String> {
        tags.iter()
            .map(|t| {
                if t == MANAGED_TAG {
                    (MANAGED_BY_TAG.to_string(), "adhar".to_string())
                } else {
                    let (k, v) = t.split_once('=').unwrap_or((t.as_str(), ""));
                    (k.to_string(), v.to_string())
                }
            })
            .collect()
    }

    /// Convert a Civo cluster to our type.
    fn to_cluster(&self, cluster: &CivoCluster) -> Cluster {
        let status = match cluster.status.as_str() {
            "ACTIVE" if cluster.ready => ClusterStatus::Running,
            "ACTIVE" | "BUILDING" | "INSTALLING" | "PENDING" => ClusterStatus::Creating,
            "UPGRADING" | "SCALING" | "UPDATING" => ClusterStatus::Updating,
            "DELETING" => ClusterStatus::Deleting,
            "ERROR" | "FAILED" => ClusterStatus::Error,
            _ => ClusterStatus::Unknown,
        };
        let created_at = cluster
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));

        Cluster {
            id: cluster_id(PROVIDER_NAME, &cluster.name),
            name: cluster.name.clone(),
            provider: PROVIDER_NAME.to_string(),
            region: self.region.clone(),
            version: cluster.kubernetes_version.clone(),
            status,
            endpoint: cluster.api_endpoint.clone().filter(|e| !e.is_empty()),
            created_at,
            updated_at: Utc::now(),
            tags: Self::decode_tags(&cluster.tags),
            metadata: [(NATIVE_ID_KEY.to_string(), cluster.id.clone().into())].into(),
        }
    }

    fn to_node_group(cluster_id: &str, pool: &CivoPool) -> NodeGroup {
        NodeGroup {
            name: pool.id.clone(),
            cluster_id: cluster_id.to_string(),
            instance_type: pool.size.clone(),
            replicas: pool.count,
            min_size: None,
            max_size: None,
            status: "active".to_string(),
        }
    }

    fn pool(spec: &NodeGroupSpec) -> CivoPool {
        CivoPool {
            id: spec.name.clone(),
            size: if spec.instance_type.is_empty() {
                pricing::CIVO.default_instance.to_string()
            } else {
                spec.instance_type.clone()
            },
            count: spec.replicas,
        }
    }

    async fn find(&self, id: &str) -> Result<CivoCluster, ProviderError> {
        let name = parse_cluster_id(PROVIDER_NAME, id)
            .ok_or_else(|| ProviderError::NotFound(format!("{id} is not a civo cluster id")))?;
        let response: ClusterListResponse = self.api.get("/kubernetes/clusters").await?;
        response
            .items
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl QuotaChecker for Civo {
    async fn check_quotas(&self, spec: &ClusterSpec) -> Result<QuotaReport, ProviderError> {
        let quota: Quota = self.api.get("/quota").await?;
        Ok(QuotaReport {
            checked: true,
            items: vec![QuotaItem {
                resource: "instances".to_string(),
                used: quota.instance_count_usage,
                limit: quota.instance_count_limit,
                required: u64::from(spec.total_nodes()),
            }],
        })
    }
}

#[async_trait]
impl Provider for Civo {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn api_endpoint(&self) -> Option<&str> {
        Some(self.api.base_url())
    }

    fn quotas(&self) -> &dyn QuotaChecker {
        self
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        if !self.api.has_token() {
            return Err(ProviderError::Auth("no Civo token configured".to_string()));
        }
        let _: Quota = self.api.get("/quota").await?;
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        let _: ClusterListResponse = self.api.get("/kubernetes/clusters").await?;
        Ok(())
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        info!(name = %spec.name, region = %self.region, "Creating Civo cluster");

        let body = CreateClusterRequest {
            name: spec.name.clone(),
            region: self.region.clone(),
            pools: spec.node_groups.iter().map(Self::pool).collect(),
            kubernetes_version: (!spec.version.is_empty()).then(|| spec.version.clone()),
            cni_plugin: if spec.networking.cni == "flannel" {
                "flannel".to_string()
            } else {
                "cilium".to_string()
            },
            network_id: spec.networking.vpc_id.clone(),
            tags: Self::encode_tags(&spec.tags),
        };
        let created: CivoCluster = self.api.post("/kubernetes/clusters", &body).await?;
        info!(cluster_id = %created.id, "Civo cluster creation initiated");
        Ok(self.to_cluster(&created))
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let cluster = self.find(id).await?;
        info!(civo_id = %cluster.id, "Deleting Civo cluster");
        self.api
            .delete(&format!("/kubernetes/clusters/{}", cluster.id))
            .await
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        let body = UpdateClusterRequest {
            region: self.region.clone(),
            kubernetes_version: None,
            tags: Some(Self::encode_tags(&spec.tags)),
        };
        let updated: CivoCluster = self
            .api
            .put(&format!("/kubernetes/clusters/{}", cluster.id), &body)
            .await?;
        Ok(self.to_cluster(&updated))
    }

    async fn upgrade_cluster(&self, id: &str, version: &str) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        info!(civo_id = %cluster.id, version, "Upgrading Civo cluster");
        let body = UpdateClusterRequest {
            region: self.region.clone(),
            kubernetes_version: Some(version.to_string()),
            tags: None,
        };
        let updated: CivoCluster = self
            .api
            .put(&format!("/kubernetes/clusters/{}", cluster.id), &body)
            .await?;
        Ok(self.to_cluster(&updated))
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        Ok(self.to_cluster(&cluster))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        let response: ClusterListResponse = self.api.get("/kubernetes/clusters").await?;
        Ok(response.items.iter().map(|c| self.to_cluster(c)).collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        self.find(id)
            .await?
            .kubeconfig
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::Config(format!("kubeconfig for {id} is not available yet")))
    }

    async fn add_node_group(
        &self,
        cluster_id: &str,
        spec: &NodeGroupSpec,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = self.find(cluster_id).await?;
        let pool = Self::pool(spec);
        self.api
            .post_unit(&format!("/kubernetes/clusters/{}/pools", cluster.id), &pool)
            .await?;
        Ok(Self::to_node_group(cluster_id, &pool))
    }

    async fn remove_node_group(&self, cluster_id: &str, name: &str) -> Result<(), ProviderError> {
        let cluster = self.find(cluster_id).await?;
        if !cluster.pools.iter().any(|p| p.id == name) {
            return Err(ProviderError::NotFound(format!("node pool {name}")));
        }
        self.api
            .delete(&format!("/kubernetes/clusters/{}/pools/{name}", cluster.id))
            .await
    }

    async fn scale_node_group(
        &self,
        cluster_id: &str,
        name: &str,
        replicas: u32,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = self.find(cluster_id).await?;
        let mut pool = cluster
            .pools
            .into_iter()
            .find(|p| p.id == name)
            .ok_or_else(|| ProviderError::NotFound(format!("node pool {name}")))?;
        let _: serde_json::Value = self
            .api
            .put(
                &format!("/kubernetes/clusters/{}/pools/{name}", cluster.id),
                &UpdatePoolRequest {
                    region: self.region.clone(),
                    count: replicas,
                },
            )
            .await?;
        pool.count = replicas;
        Ok(Self::to_node_group(cluster_id, &pool))
    }

    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let cluster = self.find(cluster_id).await?;
        Ok(cluster
            .pools
            .iter()
            .map(|p| Self::to_node_group(cluster_id, p))
            .collect())
    }

    async fn create_vpc(&self, spec: &VpcSpec) -> Result<Vpc, ProviderError> {
        let ack: Ack = self
            .api
            .post(
                "/networks",
                &CreateNetworkRequest {
                    label: spec.name.clone(),
                    region: self.region.clone(),
                    cidr_v4: spec.cidr.clone(),
                },
            )
            .await?;
        Ok(Vpc {
            id: ack.id,
            name: spec.name.clone(),
            region: self.region.clone(),
            cidr: spec.cidr.clone(),
        })
    }

    async fn delete_vpc(&self, id: &str) -> Result<(), ProviderError> {
        self.api.delete(&format!("/networks/{id}")).await
    }

    async fn list_vpcs(&self) -> Result<Vec<Vpc>, ProviderError> {
        let networks: Vec<CivoNetwork> = self.api.get("/networks").await?;
        Ok(networks
            .into_iter()
            .map(|n| Vpc {
                id: n.id,
                name: n.label,
                region: if n.region.is_empty() { self.region.clone() } else { n.region },
                cidr: n.cidr,
            })
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume, ProviderError> {
        let ack: Ack = self
            .api
            .post(
                "/volumes",
                &CreateVolumeRequest {
                    name: spec.name.clone(),
                    size_gb: spec.size_gb,
                    region: self.region.clone(),
                },
            )
            .await?;
        Ok(Volume {
            id: ack.id,
            name: spec.name.clone(),
            size_gb: spec.size_gb,
        })
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ProviderError> {
        self.api.delete(&format!("/volumes/{id}")).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, ProviderError> {
        let volumes: Vec<CivoVolume> = self.api.get("/volumes").await?;
        Ok(volumes
            .into_iter()
            .map(|v| Volume {
                id: v.id,
                name: v.name,
                size_gb: v.size_gigabytes,
            })
            .collect())
    }

    async fn estimate_cost(&self, spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(pricing::CIVO.estimate(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn civo(name: &str, status: &str, ready: bool) -> serde_json::Value {
        json!({
            "id": format!("id-{name}"),
            "name": name,
            "status": status,
            "ready": ready,
            "kubernetes_version": "1.30.5-k3s1",
            "api_endpoint": "https://74.220.0.1:6443",
            "kubeconfig": if ready { "apiVersion: v1\nkind: Config\n" } else { "" },
            "pools": [{"id": "default", "size": "g4s.kube.medium", "count": 2}],
            "tags": ["adhar-managed", "env=dev"],
        })
    }

    async fn mount_list(server: &MockServer, clusters: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/kubernetes/clusters"))
            .and(query_param("region", "LON1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": clusters})))
            .mount(server)
            .await;
    }

    fn provider(server: &MockServer) -> Civo {
        Civo::with_base_url(&server.uri(), "token", "LON1").unwrap()
    }

    #[tokio::test]
    async fn test_create_cluster() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kubernetes/clusters"))
            .and(body_partial_json(json!({
                "name": "dev",
                "region": "LON1",
                "cni_plugin": "cilium",
                "pools": [{"id": "default", "size": "g4s.kube.medium", "count": 1}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(civo("dev", "BUILDING", false)))
            .expect(1)
            .mount(&server)
            .await;

        let cluster = provider(&server)
            .create_cluster(&ClusterSpec::new(PROVIDER_NAME, "dev"))
            .await
            .unwrap();
        assert_eq!(cluster.id, "civo-dev");
        assert_eq!(cluster.status, ClusterStatus::Creating);
        assert_eq!(cluster.native_id(), Some("id-dev"));
        assert!(cluster.is_managed());
    }

    #[tokio::test]
    async fn test_kubeconfig_only_when_ready() {
        let server = MockServer::start().await;
        mount_list(
            &server,
            json!([civo("ready", "ACTIVE", true), civo("pending", "ACTIVE", false)]),
        )
        .await;

        let provider = provider(&server);
        assert!(provider.get_kubeconfig("civo-ready").await.unwrap().contains("kind: Config"));
        let err = provider.get_kubeconfig("civo-pending").await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
        assert_eq!(
            provider.get_cluster("civo-pending").await.unwrap().status,
            ClusterStatus::Creating
        );
        assert!(provider.get_cluster("civo-nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_node_groups_come_from_pools() {
        let server = MockServer::start().await;
        mount_list(&server, json!([civo("dev", "ACTIVE", true)])).await;
        Mock::given(method("PUT"))
            .and(path("/kubernetes/clusters/id-dev/pools/default"))
            .and(body_partial_json(json!({"count": 4})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "default"})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let groups = provider.list_node_groups("civo-dev").await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].replicas, 2);
        let scaled = provider.scale_node_group("civo-dev", "default", 4).await.unwrap();
        assert_eq!(scaled.replicas, 4);
        assert!(provider
            .remove_node_group("civo-dev", "missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_quota() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quota"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "instance_count_limit": 16,
                "instance_count_usage": 4,
                "cpu_core_limit": 32,
                "cpu_core_usage": 8
            })))
            .mount(&server)
            .await;

        let report = provider(&server)
            .check_quotas(&ClusterSpec::new(PROVIDER_NAME, "dev"))
            .await
            .unwrap();
        assert!(report.checked);
        assert!(report.exceeded().is_empty());
    }
}
