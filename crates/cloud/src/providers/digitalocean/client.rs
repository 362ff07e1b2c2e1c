//! DigitalOcean API client implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::models::{
    AccountEnvelope, ClusterEnvelope, ClusterListResponse, CountResponse, CreateClusterRequest,
    DoCluster, DoLoadBalancer, DoNodePool, DoTaint, DoVolume, DoVpc, ForwardingRule,
    LoadBalancerEnvelope, LoadBalancerListResponse, NodePoolEnvelope, NodePoolListResponse,
    UpdateClusterRequest, UpdateNodePoolRequest, UpgradeRequest, VolumeEnvelope,
    VolumeListResponse, VpcEnvelope, VpcListResponse,
};
use crate::providers::http::ApiClient;
use crate::providers::pricing;
use crate::providers::registry::{config_string, ProviderConfig};
use crate::providers::traits::{ensure_spec_for, Provider, ProviderError, QuotaChecker};
use crate::providers::types::{
    cluster_id, parse_cluster_id, Cluster, ClusterSpec, ClusterStatus, CostEstimate, Credentials,
    LoadBalancer, LoadBalancerSpec, NodeGroup, NodeGroupSpec, QuotaItem, QuotaReport, Volume,
    VolumeSpec, Vpc, VpcSpec, MANAGED_BY_TAG, NATIVE_ID_KEY,
};

/// Registry name.
pub const PROVIDER_NAME: &str = "digitalocean";

/// Public API root.
pub const DEFAULT_BASE_URL: &str = "https://api.digitalocean.com/v2";

/// DigitalOcean tags cannot contain `/` or `.`, so ownership uses a flat tag.
const MANAGED_TAG: &str = "adhar-managed";

const DEFAULT_REGION: &str = "nyc3";

/// DigitalOcean provider.
#[derive(Clone)]
pub struct DigitalOcean {
    api: ApiClient,
    region: String,
}

impl DigitalOcean {
    /// Create a new DigitalOcean provider.
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
            api: ApiClient::new(base_url, token)?,
            region: region.to_string(),
        })
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `token` (falls back to `DIGITALOCEAN_TOKEN`),
    /// `region`, `baseUrl`.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] when no token is available.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let token = config_string(config, "token")
            .or_else(|| std::env::var("DIGITALOCEAN_TOKEN").ok().filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                ProviderError::Config(
                    "digitalocean: 'token' is required (or set DIGITALOCEAN_TOKEN)".to_string(),
                )
            })?;
        let region = config_string(config, "region").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let base_url =
            config_string(config, "baseUrl").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(&base_url, &token, &region)
    }

    fn encode_tags(tags: &BTreeMap<String, String>) -> Vec<String> {
        let sanitize = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect::<String>()
        };
        let mut encoded: Vec<String> = tags
            .iter()
            .filter(|(k, _)| k.as_str() != MANAGED_BY_TAG)
            .map(|(k, v)| format!("{}:{}", sanitize(k), sanitize(v)))
            .collect();
        encoded.push(MANAGED_TAG.to_string());
        encoded
    }

    fn decode_tags(tags: &[String]) -> BTreeMap<String, String> {
        tags.iter()
            .filter(|t| !t.starts_with("k8s"))
            .map(|t| {
                if t == MANAGED_TAG {
                    (MANAGED_BY_TAG.to_string(), "adhar".to_string())
                } else {
                    let (k, v) = t.split_once(':').unwrap_or((t.as_str(), ""));
                    (k.to_string(), v.to_string())
                }
            })
            .collect()
    }

    /// Convert a DOKS cluster to our type.
    fn to_cluster(cluster: &DoCluster) -> Cluster {
        let status = match cluster.status.state.as_str() {
            "provisioning" => ClusterStatus::Creating,
            "running" | "degraded" => ClusterStatus::Running,
            "upgrading" => ClusterStatus::Updating,
            "deleting" | "deleted" => ClusterStatus::Deleting,
            "error" | "invalid" => ClusterStatus::Error,
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
            region: cluster.region.clone(),
            version: cluster.version.clone(),
            status,
            endpoint: cluster.endpoint.clone().filter(|e| !e.is_empty()),
            created_at,
            updated_at: Utc::now(),
            tags: Self::decode_tags(&cluster.tags),
            metadata: [(NATIVE_ID_KEY.to_string(), cluster.id.clone().into())].into(),
        }
    }

    fn to_node_group(cluster_id: &str, pool: &DoNodePool) -> NodeGroup {
        NodeGroup {
            name: pool.name.clone(),
            cluster_id: cluster_id.to_string(),
            instance_type: pool.size.clone(),
            replicas: pool.count,
            min_size: pool.min_nodes,
            max_size: pool.max_nodes,
            status: "active".to_string(),
        }
    }

    fn node_pool(&self, spec: &NodeGroupSpec) -> DoNodePool {
        DoNodePool {
            id: String::new(),
            name: spec.name.clone(),
            size: if spec.instance_type.is_empty() {
                pricing::DIGITALOCEAN.default_instance.to_string()
            } else {
                spec.instance_type.clone()
            },
            count: spec.replicas,
            auto_scale: spec.autoscaling(),
            min_nodes: spec.min_size,
            max_nodes: spec.max_size,
            labels: spec.labels.clone(),
            taints: spec
                .taints
                .iter()
                .map(|t| DoTaint {
                    key: t.key.clone(),
                    value: t.value.clone(),
                    effect: t.effect.clone(),
                })
                .collect(),
        }
    }

    /// Look up the DOKS cluster behind one of our ids.
    async fn find(&self, id: &str) -> Result<DoCluster, ProviderError> {
        let name = parse_cluster_id(PROVIDER_NAME, id)
            .ok_or_else(|| ProviderError::NotFound(format!("{id} is not a digitalocean cluster id")))?;
        let response: ClusterListResponse = self.api.get("/kubernetes/clusters").await?;
        response
            .kubernetes_clusters
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn find_pool(&self, cluster_uuid: &str, name: &str) -> Result<DoNodePool, ProviderError> {
        let response: NodePoolListResponse = self
            .api
            .get(&format!("/kubernetes/clusters/{cluster_uuid}/node_pools"))
            .await?;
        response
            .node_pools
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ProviderError::NotFound(format!("node pool {name}")))
    }
}

#[async_trait]
impl QuotaChecker for DigitalOcean {
    async fn check_quotas(&self, spec: &ClusterSpec) -> Result<QuotaReport, ProviderError> {
        let account: AccountEnvelope = self.api.get("/account").await?;
        let droplets: CountResponse = self.api.get("/droplets?per_page=1").await?;
        Ok(QuotaReport {
            checked: true,
            items: vec![QuotaItem {
                resource: "droplets".to_string(),
                used: droplets.meta.total,
                limit: account.account.droplet_limit,
                required: u64::from(spec.total_nodes()),
            }],
        })
    }
}

#[async_trait]
impl Provider for DigitalOcean {
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
            return Err(ProviderError::Auth("no DigitalOcean token configured".to_string()));
        }
        let account: AccountEnvelope = self.api.get("/account").await?;
        debug!(status = %account.account.status, "Authenticated with DigitalOcean");
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        let _: ClusterListResponse = self.api.get("/kubernetes/clusters").await?;
        Ok(())
    }

    // ========================================================================
    // DOKS
    // ========================================================================

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        let region = if spec.region.is_empty() { &self.region } else { &spec.region };
        info!(name = %spec.name, region = %region, "Creating DOKS cluster");

        let body = CreateClusterRequest {
            name: spec.name.clone(),
            region: region.clone(),
            version: if spec.version.is_empty() {
                "latest".to_string()
            } else {
                spec.version.clone()
            },
            node_pools: spec.node_groups.iter().map(|g| self.node_pool(g)).collect(),
            tags: Self::encode_tags(&spec.tags),
            vpc_uuid: spec.networking.vpc_id.clone(),
            ha: spec.control_plane.high_availability,
        };
        let created: ClusterEnvelope = self.api.post("/kubernetes/clusters", &body).await?;

        info!(cluster_uuid = %created.kubernetes_cluster.id, "DOKS cluster creation initiated");
        Ok(Self::to_cluster(&created.kubernetes_cluster))
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let cluster = self.find(id).await?;
        info!(cluster_uuid = %cluster.id, "Deleting DOKS cluster");
        self.api
            .delete(&format!("/kubernetes/clusters/{}", cluster.id))
            .await
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        let body = UpdateClusterRequest {
            name: cluster.name.clone(),
            tags: Self::encode_tags(&spec.tags),
        };
        let updated: ClusterEnvelope = self
            .api
            .put(&format!("/kubernetes/clusters/{}", cluster.id), &body)
            .await?;
        Ok(Self::to_cluster(&updated.kubernetes_cluster))
    }

    async fn upgrade_cluster(&self, id: &str, version: &str) -> Result<Cluster, ProviderError> {
        let cluster = self.find(id).await?;
        info!(cluster_uuid = %cluster.id, version, "Upgrading DOKS cluster");
        self.api
            .post_unit(
                &format!("/kubernetes/clusters/{}/upgrade", cluster.id),
                &UpgradeRequest {
                    version: version.to_string(),
                },
            )
            .await?;
        let mut converted = Self::to_cluster(&cluster);
        converted.transition(ClusterStatus::Updating);
        Ok(converted)
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        Ok(Self::to_cluster(&self.find(id).await?))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        let response: ClusterListResponse = self.api.get("/kubernetes/clusters").await?;
        Ok(response.kubernetes_clusters.iter().map(Self::to_cluster).collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        let cluster = self.find(id).await?;
        self.api
            .get_text(&format!("/kubernetes/clusters/{}/kubeconfig", cluster.id))
            .await
    }

    // ========================================================================
    // Node pools
    // ========================================================================

    async fn add_node_group(
        &self,
        cluster_id: &str,
        spec: &NodeGroupSpec,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = self.find(cluster_id).await?;
        let created: NodePoolEnvelope = self
            .api
            .post(
                &format!("/kubernetes/clusters/{}/node_pools", cluster.id),
                &self.node_pool(spec),
            )
            .await?;
        Ok(Self::to_node_group(cluster_id, &created.node_pool))
    }

    async fn remove_node_group(&self, cluster_id: &str, name: &str) -> Result<(), ProviderError> {
        let cluster = self.find(cluster_id).await?;
        let pool = self.find_pool(&cluster.id, name).await?;
        self.api
            .delete(&format!("/kubernetes/clusters/{}/node_pools/{}", cluster.id, pool.id))
            .await
    }

    async fn scale_node_group(
        &self,
        cluster_id: &str,
        name: &str,
        replicas: u32,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = self.find(cluster_id).await?;
        let pool = self.find_pool(&cluster.id, name).await?;
        let updated: NodePoolEnvelope = self
            .api
            .put(
                &format!("/kubernetes/clusters/{}/node_pools/{}", cluster.id, pool.id),
                &UpdateNodePoolRequest {
                    name: pool.name.clone(),
                    count: replicas,
                },
            )
            .await?;
        Ok(Self::to_node_group(cluster_id, &updated.node_pool))
    }

    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let cluster = self.find(cluster_id).await?;
        let response: NodePoolListResponse = self
            .api
            .get(&format!("/kubernetes/clusters/{}/node_pools", cluster.id))
            .await?;
        Ok(response
            .node_pools
            .iter()
            .map(|p| Self::to_node_group(cluster_id, p))
            .collect())
    }

    // ========================================================================
    // VPC, load balancers, volumes
    // ========================================================================

    async fn create_vpc(&self, spec: &VpcSpec) -> Result<Vpc, ProviderError> {
        let body = DoVpc {
            id: String::new(),
            name: spec.name.clone(),
            region: spec.region.clone(),
            ip_range: spec.cidr.clone(),
        };
        let created: VpcEnvelope = self.api.post("/vpcs", &body).await?;
        Ok(Vpc {
            id: created.vpc.id,
            name: created.vpc.name,
            region: created.vpc.region,
            cidr: created.vpc.ip_range,
        })
    }

    async fn delete_vpc(&self, id: &str) -> Result<(), ProviderError> {
        self.api.delete(&format!("/vpcs/{id}")).await
    }

    async fn list_vpcs(&self) -> Result<Vec<Vpc>, ProviderError> {
        let response: VpcListResponse = self.api.get("/vpcs").await?;
        Ok(response
            .vpcs
            .into_iter()
            .map(|v| Vpc {
                id: v.id,
                name: v.name,
                region: v.region,
                cidr: v.ip_range,
            })
            .collect())
    }

    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancer, ProviderError> {
        let body = DoLoadBalancer {
            id: String::new(),
            name: spec.name.clone(),
            region: spec.region.clone(),
            ip: None,
            forwarding_rules: spec
                .ports
                .iter()
                .map(|&port| ForwardingRule {
                    entry_protocol: "tcp".to_string(),
                    entry_port: port,
                    target_protocol: "tcp".to_string(),
                    target_port: port,
                })
                .collect(),
        };
        let created: LoadBalancerEnvelope = self.api.post("/load_balancers", &body).await?;
        Ok(to_load_balancer(created.load_balancer))
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<(), ProviderError> {
        self.api.delete(&format!("/load_balancers/{id}")).await
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, ProviderError> {
        let response: LoadBalancerListResponse = self.api.get("/load_balancers").await?;
        Ok(response.load_balancers.into_iter().map(to_load_balancer).collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume, ProviderError> {
        let body = DoVolume {
            id: String::new(),
            name: spec.name.clone(),
            region: spec.region.clone(),
            size_gigabytes: spec.size_gb,
        };
        let created: VolumeEnvelope = self.api.post("/volumes", &body).await?;
        Ok(Volume {
            id: created.volume.id,
            name: created.volume.name,
            size_gb: created.volume.size_gigabytes,
        })
    }

    async fn delete_volume(&self, id: &str) -> Result<(), ProviderError> {
        self.api.delete(&format!("/volumes/{id}")).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, ProviderError> {
        let response: VolumeListResponse = self.api.get("/volumes").await?;
        Ok(response
            .volumes
            .into_iter()
            .map(|v| Volume {
                id: v.id,
                name: v.name,
                size_gb: v.size_gigabytes,
            })
            .collect())
    }

    async fn estimate_cost(&self, spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(pricing::DIGITALOCEAN.estimate(spec))
    }
}

fn to_load_balancer(lb: DoLoadBalancer) -> LoadBalancer {
    LoadBalancer {
        id: lb.id,
        name: lb.name,
        address: lb.ip.filter(|ip| !ip.is_empty()),
        ports: lb.forwarding_rules.iter().map(|r| r.entry_port).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doks(name: &str, state: &str) -> serde_json::Value {
        json!({
            "id": format!("uuid-{name}"),
            "name": name,
            "region": "nyc3",
            "version": "1.31.1-do.4",
            "endpoint": format!("https://{name}.k8s.ondigitalocean.com"),
            "status": {"state": state},
            "node_pools": [{"id": "pool-1", "name": "default", "size": "s-2vcpu-4gb", "count": 3}],
            "tags": ["k8s", "adhar-managed", "team:platform"],
            "created_at": "2025-01-02T03:04:05Z"
        })
    }

    async fn provider(server: &MockServer) -> DigitalOcean {
        DigitalOcean::with_base_url(&server.uri(), "token", "nyc3").unwrap()
    }

    #[tokio::test]
    async fn test_create_cluster_posts_pools_and_tags() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/kubernetes/clusters"))
            .and(body_partial_json(json!({
                "name": "prod",
                "region": "nyc3",
                "version": "latest",
                "node_pools": [{"name": "default", "size": "s-2vcpu-4gb", "count": 1}],
            })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"kubernetes_cluster": doks("prod", "provisioning")})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cluster = provider(&server)
            .await
            .create_cluster(&ClusterSpec::new(PROVIDER_NAME, "prod"))
            .await
            .unwrap();
        assert_eq!(cluster.id, "digitalocean-prod");
        assert_eq!(cluster.status, ClusterStatus::Creating);
        assert_eq!(cluster.native_id(), Some("uuid-prod"));
        assert!(cluster.is_managed());
        assert_eq!(cluster.tags.get("team").map(String::as_str), Some("platform"));
    }

    #[tokio::test]
    async fn test_get_and_delete_resolve_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kubernetes/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"kubernetes_clusters": [doks("other", "running"), doks("prod", "running")]}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/kubernetes/clusters/uuid-prod"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let cluster = provider.get_cluster("digitalocean-prod").await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert_eq!(
            cluster.endpoint.as_deref(),
            Some("https://prod.k8s.ondigitalocean.com")
        );

        provider.delete_cluster("digitalocean-prod").await.unwrap();
        let err = provider.delete_cluster("digitalocean-ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_kubeconfig_is_returned_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kubernetes/clusters"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"kubernetes_clusters": [doks("prod", "running")]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/kubernetes/clusters/uuid-prod/kubeconfig"))
            .respond_with(ResponseTemplate::new(200).set_body_string("apiVersion: v1\nkind: Config\n"))
            .mount(&server)
            .await;

        let kubeconfig = provider(&server)
            .await
            .get_kubeconfig("digitalocean-prod")
            .await
            .unwrap();
        assert!(kubeconfig.starts_with("apiVersion: v1"));
    }

    #[tokio::test]
    async fn test_quota_uses_droplet_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"account": {"droplet_limit": 10, "status": "active"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/droplets"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"droplets": [], "meta": {"total": 8}})),
            )
            .mount(&server)
            .await;

        let mut spec = ClusterSpec::new(PROVIDER_NAME, "prod");
        spec.node_groups[0].replicas = 3;
        let report = provider(&server).await.check_quotas(&spec).await.unwrap();
        assert!(report.checked);
        assert_eq!(report.exceeded().len(), 1);
    }

    #[tokio::test]
    async fn test_scale_node_group() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kubernetes/clusters"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"kubernetes_clusters": [doks("prod", "running")]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/kubernetes/clusters/uuid-prod/node_pools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_pools": [{"id": "pool-1", "name": "default", "size": "s-2vcpu-4gb", "count": 3}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/kubernetes/clusters/uuid-prod/node_pools/pool-1"))
            .and(body_partial_json(json!({"count": 5})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "node_pool": {"id": "pool-1", "name": "default", "size": "s-2vcpu-4gb", "count": 5}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let group = provider(&server)
            .await
            .scale_node_group("digitalocean-prod", "default", 5)
            .await
            .unwrap();
        assert_eq!(group.replicas, 5);
    }

    #[test]
    fn test_from_config_requires_token() {
        let mut config = ProviderConfig::new();
        config.insert("token".into(), "".into());
        // An empty token counts as missing; the env fallback may still supply one.
        if std::env::var("DIGITALOCEAN_TOKEN").is_err() {
            assert!(DigitalOcean::from_config(&config).is_err());
        }
        config.insert("token".into(), "abc".into());
        assert!(DigitalOcean::from_config(&config).is_ok());
    }
}
