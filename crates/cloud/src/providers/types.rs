//! Domain types shared by every provider.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key holding the provider-native identifier of a cluster.
pub const NATIVE_ID_KEY: &str = "nativeId";

/// Metadata key holding the path of a kubeconfig written for the cluster.
pub const KUBECONFIG_PATH_KEY: &str = "kubeconfigPath";

/// Tag marking a cluster as created and owned by the platform.
pub const MANAGED_BY_TAG: &str = "adhar.io/managed-by";

/// Build the uniform cluster identifier `<provider>-<name>`.
#[must_use]
pub fn cluster_id(provider: &str, name: &str) -> String {
    format!("{provider}-{name}")
}

/// Recover the bare cluster name from an identifier issued by `provider`.
///
/// Returns `None` when the identifier was not issued by that provider.
#[must_use]
pub fn parse_cluster_id<'a>(provider: &str, id: &'a str) -> Option<&'a str> {
    id.strip_prefix(provider)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|name| !name.is_empty())
}

// ============================================================================
// Cluster
// ============================================================================

/// Cluster lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Cluster is being created.
    Creating,
    /// Cluster is active and running.
    Running,
    /// Cluster is being updated.
    Updating,
    /// Cluster is being deleted.
    Deleting,
    /// Cluster is in an error state.
    Error,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl ClusterStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    ///
    /// Statuses only move forward, except `updating -> running`. `error` is
    /// absorbing unless the caller explicitly retries creation.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ClusterStatus::{Creating, Deleting, Error, Running, Unknown, Updating};

        if self == next || self == Unknown || next == Unknown {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Running | Error | Deleting)
                | (Running, Updating | Deleting | Error)
                | (Updating, Running | Deleting | Error)
                | (Deleting | Error, Error)
                | (Error, Creating | Deleting)
        )
    }

    /// Whether the status is terminal for a "wait until ready" loop.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Running | Self::Error)
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Updating => write!(f, "updating"),
            Self::Deleting => write!(f, "deleting"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A provisioned (or provisioning) Kubernetes cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Provider-prefixed identifier, stable for the cluster's lifetime.
    pub id: String,
    /// Cluster name.
    pub name: String,
    /// Provider that owns the cluster.
    pub provider: String,
    /// Region/location.
    pub region: String,
    /// Kubernetes version.
    pub version: String,
    /// Current status.
    pub status: ClusterStatus,
    /// API server endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// When the cluster was created.
    pub created_at: DateTime<Utc>,
    /// When the cluster record last changed.
    pub updated_at: DateTime<Utc>,
    /// Ownership and user tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Provider-specific extras.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Cluster {
    /// Create a new record in the `creating` state.
    #[must_use]
    pub fn new(provider: &str, spec: &ClusterSpec) -> Self {
        let now = Utc::now();
        let mut tags = spec.tags.clone();
        tags.insert(MANAGED_BY_TAG.to_string(), "adhar".to_string());
        Self {
            id: cluster_id(provider, &spec.name),
            name: spec.name.clone(),
            provider: provider.to_string(),
            region: spec.region.clone(),
            version: spec.version.clone(),
            status: ClusterStatus::Creating,
            endpoint: None,
            created_at: now,
            updated_at: now,
            tags,
            metadata: BTreeMap::new(),
        }
    }

    /// Move to `next`, bumping `updated_at`.
    ///
    /// Illegal transitions are ignored and reported through the return value.
    pub fn transition(&mut self, next: ClusterStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Provider-native identifier, when one was recorded.
    #[must_use]
    pub fn native_id(&self) -> Option<&str> {
        self.metadata.get(NATIVE_ID_KEY).and_then(|v| v.as_str())
    }

    /// Whether the platform created and owns this cluster.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.tags.contains_key(MANAGED_BY_TAG)
    }
}

// ============================================================================
// Desired state
// ============================================================================

/// Desired state for creating or updating a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpec {
    /// Cluster name.
    pub name: String,
    /// Provider that must handle the request.
    pub provider: String,
    /// Region/location.
    pub region: String,
    /// Kubernetes version.
    pub version: String,
    /// Control plane settings.
    pub control_plane: ControlPlaneSpec,
    /// Worker node groups.
    pub node_groups: Vec<NodeGroupSpec>,
    /// Networking settings.
    pub networking: NetworkingSpec,
    /// Security settings.
    pub security: SecuritySpec,
    /// Addons to install after creation.
    pub addons: Vec<AddonSpec>,
    /// Domain configuration.
    pub domain: Option<DomainSpec>,
    /// Tags applied to the cluster.
    pub tags: BTreeMap<String, String>,
}

impl ClusterSpec {
    /// Minimal spec with a single default node group.
    #[must_use]
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            control_plane: ControlPlaneSpec::default(),
            node_groups: vec![NodeGroupSpec::default()],
            networking: NetworkingSpec::default(),
            ..Self::default()
        }
    }

    /// Total number of worker nodes requested across node groups.
    #[must_use]
    pub fn total_nodes(&self) -> u32 {
        self.node_groups.iter().map(|g| g.replicas).sum()
    }
}

/// Control plane settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneSpec {
    /// Number of control plane replicas.
    pub replicas: u32,
    /// Whether to run a highly-available control plane.
    pub high_availability: bool,
    /// Instance type for self-managed control planes.
    pub instance_type: Option<String>,
    /// Extra etcd options.
    pub etcd: BTreeMap<String, String>,
    /// Extra API server options.
    pub api_server: BTreeMap<String, String>,
}

impl Default for ControlPlaneSpec {
    fn default() -> Self {
        Self {
            replicas: 1,
            high_availability: false,
            instance_type: None,
            etcd: BTreeMap::new(),
            api_server: BTreeMap::new(),
        }
    }
}

/// Node taint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key.
    pub key: String,
    /// Taint value.
    #[serde(default)]
    pub value: String,
    /// Taint effect (`NoSchedule`, `PreferNoSchedule`, `NoExecute`).
    pub effect: String,
}

/// Desired state of a node group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeGroupSpec {
    /// Node group name.
    pub name: String,
    /// Number of nodes.
    pub replicas: u32,
    /// Instance type/size.
    pub instance_type: String,
    /// Autoscaling lower bound.
    pub min_size: Option<u32>,
    /// Autoscaling upper bound.
    pub max_size: Option<u32>,
    /// Node taints.
    pub taints: Vec<Taint>,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
}

impl Default for NodeGroupSpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            replicas: 1,
            instance_type: String::new(),
            min_size: None,
            max_size: None,
            taints: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl NodeGroupSpec {
    /// Whether autoscaling bounds were requested.
    #[must_use]
    pub fn autoscaling(&self) -> bool {
        self.min_size.is_some() || self.max_size.is_some()
    }
}

/// Networking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkingSpec {
    /// CNI plugin name.
    pub cni: String,
    /// Pod CIDR.
    pub pod_cidr: Option<String>,
    /// Service CIDR.
    pub service_cidr: Option<String>,
    /// Host port mapped to ingress HTTP.
    pub http_port: Option<u16>,
    /// Host port mapped to ingress HTTPS.
    pub https_port: Option<u16>,
    /// Existing VPC/network to deploy into.
    pub vpc_id: Option<String>,
}

impl Default for NetworkingSpec {
    fn default() -> Self {
        Self {
            cni: "cilium".to_string(),
            pod_cidr: None,
            service_cidr: None,
            http_port: None,
            https_port: None,
            vpc_id: None,
        }
    }
}

/// Security settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySpec {
    /// Enable RBAC.
    pub rbac: bool,
    /// Enforce network policies.
    pub network_policies: bool,
    /// Pod security standard level.
    pub pod_security_standard: Option<String>,
    /// Restrict API server access to these CIDRs.
    pub authorized_networks: Vec<String>,
}

impl Default for SecuritySpec {
    fn default() -> Self {
        Self {
            rbac: true,
            network_policies: false,
            pod_security_standard: None,
            authorized_networks: Vec::new(),
        }
    }
}

/// Helm chart reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Chart repository URL.
    pub repo: String,
    /// Chart name.
    pub name: String,
    /// Chart version.
    #[serde(default)]
    pub version: Option<String>,
}

/// Addon to install into a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Addon (release) name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Chart to install.
    pub chart: ChartRef,
    /// Helm values passed with `--set`.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Domain configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Base domain.
    pub name: String,
    /// Issue TLS certificates for the domain.
    #[serde(default)]
    pub tls: bool,
}

// ============================================================================
// Secondary resources
// ============================================================================

/// A node group as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    /// Node group name.
    pub name: String,
    /// Owning cluster id.
    pub cluster_id: String,
    /// Instance type/size.
    pub instance_type: String,
    /// Current node count.
    pub replicas: u32,
    /// Autoscaling lower bound.
    pub min_size: Option<u32>,
    /// Autoscaling upper bound.
    pub max_size: Option<u32>,
    /// Provider status string.
    pub status: String,
}

/// Desired VPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    /// VPC name.
    pub name: String,
    /// Region.
    pub region: String,
    /// IP range.
    pub cidr: String,
}

/// A VPC/network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vpc {
    /// Provider identifier.
    pub id: String,
    /// VPC name.
    pub name: String,
    /// Region.
    pub region: String,
    /// IP range.
    pub cidr: String,
}

/// Desired load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Load balancer name.
    pub name: String,
    /// Region.
    pub region: String,
    /// Exposed ports.
    pub ports: Vec<u16>,
}

/// A load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    /// Provider identifier.
    pub id: String,
    /// Load balancer name.
    pub name: String,
    /// Public address.
    pub address: Option<String>,
    /// Exposed ports.
    pub ports: Vec<u16>,
}

/// Desired volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Volume name.
    pub name: String,
    /// Region.
    pub region: String,
    /// Size in GiB.
    pub size_gb: u32,
}

/// A block storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Provider identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
    /// Size in GiB.
    pub size_gb: u32,
}

/// An installed addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    /// Release name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Chart and version, as reported by helm.
    pub chart: String,
    /// Release status.
    pub status: String,
}

/// Overall health rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything reports ready.
    Healthy,
    /// Some components are not ready.
    Degraded,
    /// No node is ready.
    Unhealthy,
}

/// Health of a single component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Whether the component is ready.
    pub healthy: bool,
    /// Detail when unhealthy.
    pub message: Option<String>,
}

/// Cluster health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    /// Overall rating.
    pub status: HealthStatus,
    /// Ready nodes.
    pub nodes_ready: usize,
    /// Total nodes.
    pub nodes_total: usize,
    /// Per-component health.
    pub components: Vec<ComponentHealth>,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

/// Cluster capacity and usage snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetrics {
    /// Number of nodes.
    pub node_count: usize,
    /// Number of pods.
    pub pod_count: usize,
    /// Number of namespaces.
    pub namespace_count: usize,
    /// Allocatable CPU in millicores.
    pub cpu_allocatable_millis: u64,
    /// Allocatable memory in bytes.
    pub memory_allocatable_bytes: u64,
    /// When the snapshot was taken.
    pub collected_at: DateTime<Utc>,
}

/// A single line of a cost estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostItem {
    /// What is being billed.
    pub description: String,
    /// Quantity.
    pub quantity: u32,
    /// Hourly cost for the whole line.
    pub hourly: f64,
}

/// Estimated running cost of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// Currency code.
    pub currency: String,
    /// Hourly total.
    pub hourly: f64,
    /// Monthly total (730 hours).
    pub monthly: f64,
    /// Line items.
    pub items: Vec<CostItem>,
}

/// Severity of a diagnostic finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Broken.
    Critical,
}

/// A diagnostic finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Short title.
    pub title: String,
    /// Raw detail (command output, API message).
    pub detail: String,
    /// Severity.
    pub severity: Severity,
}

/// Result of a best-effort cluster investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investigation {
    /// Cluster investigated.
    pub cluster_id: String,
    /// Collected findings.
    pub findings: Vec<Finding>,
    /// When the investigation ran.
    pub collected_at: DateTime<Utc>,
}

/// Provider credentials, keyed by provider-specific field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    /// Empty credentials (ambient auth such as CLI profiles).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether no fields are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single quota line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaItem {
    /// Resource name.
    pub resource: String,
    /// Currently used.
    pub used: u64,
    /// Account limit.
    pub limit: u64,
    /// Additional amount the requested spec needs.
    pub required: u64,
}

impl QuotaItem {
    /// Whether the limit leaves room for the requested amount.
    #[must_use]
    pub fn sufficient(&self) -> bool {
        self.used + self.required <= self.limit
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    /// Whether the provider actually checked anything.
    pub checked: bool,
    /// Quota lines.
    pub items: Vec<QuotaItem>,
}

impl QuotaReport {
    /// Report for providers without a quota API.
    #[must_use]
    pub fn unchecked() -> Self {
        Self::default()
    }

    /// Lines that would be exceeded.
    #[must_use]
    pub fn exceeded(&self) -> Vec<&QuotaItem> {
        self.items.iter().filter(|i| !i.sufficient()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_id_round_trip() {
        let id = cluster_id("kind", "adhar-mgmt");
        assert_eq!(id, "kind-adhar-mgmt");
        assert_eq!(parse_cluster_id("kind", &id), Some("adhar-mgmt"));
        assert_eq!(parse_cluster_id("civo", &id), None);
        assert_eq!(parse_cluster_id("kind", "kind-"), None);
        assert_eq!(parse_cluster_id("kind", "kindfoo"), None);
    }

    #[test]
    fn test_status_transitions() {
        use ClusterStatus::*;
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Error));
        assert!(Updating.can_transition_to(Running));
        assert!(!Running.can_transition_to(Creating));
        assert!(!Error.can_transition_to(Running));
        assert!(Error.can_transition_to(Creating));
        assert!(!Deleting.can_transition_to(Running));
    }

    #[test]
    fn test_cluster_serializes_with_documented_field_names() {
        let spec = ClusterSpec::new("kind", "foo");
        let cluster = Cluster::new("kind", &spec);
        let value = serde_json::to_value(&cluster).unwrap();
        for field in [
            "id",
            "name",
            "provider",
            "region",
            "version",
            "status",
            "createdAt",
            "updatedAt",
            "tags",
            "metadata",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["status"], "creating");
        assert!(cluster.is_managed());
    }

    #[test]
    fn test_unknown_status_deserializes() {
        let status: ClusterStatus = serde_json::from_str("\"exploded\"").unwrap();
        assert_eq!(status, ClusterStatus::Unknown);
    }

    #[test]
    fn test_quota_report_exceeded() {
        let report = QuotaReport {
            checked: true,
            items: vec![
                QuotaItem {
                    resource: "droplets".into(),
                    used: 8,
                    limit: 10,
                    required: 3,
                },
                QuotaItem {
                    resource: "volumes".into(),
                    used: 0,
                    limit: 10,
                    required: 1,
                },
            ],
        };
        let exceeded = report.exceeded();
        assert_eq!(exceeded.len(), 1);
        assert_eq!(exceeded[0].resource, "droplets");
    }
}
