//! Generic cluster health and metrics read through the Kubernetes API.

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use super::traits::ProviderError;
use super::types::{ClusterHealth, ClusterMetrics, ComponentHealth, HealthStatus};

/// Build a client from a raw kubeconfig document.
///
/// # Errors
///
/// Returns [`ProviderError::Config`] if the document is invalid.
pub async fn client_from_kubeconfig(kubeconfig: &str) -> Result<Client, ProviderError> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| ProviderError::Config(format!("invalid kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ProviderError::Config(format!("unusable kubeconfig: {e}")))?;
    Ok(Client::try_from(config)?)
}

/// API server URL of the current context.
#[must_use]
pub fn kubeconfig_server(kubeconfig: &str) -> Option<String> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig).ok()?;
    let context_name = kubeconfig.current_context.as_deref();
    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| Some(c.name.as_str()) == context_name)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone());
    kubeconfig
        .clusters
        .iter()
        .find(|c| cluster_name.as_deref().is_none_or(|n| n == c.name))
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
}

/// Node and `kube-system` deployment health.
///
/// # Errors
///
/// Returns an error if the API server cannot be reached.
pub async fn cluster_health(kubeconfig: &str) -> Result<ClusterHealth, ProviderError> {
    let client = client_from_kubeconfig(kubeconfig).await?;
    let nodes: Api<Node> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client, "kube-system");

    let nodes = nodes.list(&ListParams::default()).await?.items;
    let deployments = deployments.list(&ListParams::default()).await?.items;
    Ok(assess(&nodes, &deployments))
}

/// Capacity and object counts.
///
/// # Errors
///
/// Returns an error if the API server cannot be reached.
pub async fn cluster_metrics(kubeconfig: &str) -> Result<ClusterMetrics, ProviderError> {
    let client = client_from_kubeconfig(kubeconfig).await?;
    let nodes = Api::<Node>::all(client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    let pods = Api::<Pod>::all(client.clone())
        .list(&ListParams::default())
        .await?
        .items;
    let namespaces = Api::<Namespace>::all(client)
        .list(&ListParams::default())
        .await?
        .items;

    let mut cpu = 0;
    let mut memory = 0;
    for node in &nodes {
        if let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) {
            cpu += allocatable.get("cpu").map_or(0, |q| parse_cpu_millis(&q.0));
            memory += allocatable.get("memory").map_or(0, |q| parse_bytes(&q.0));
        }
    }

    Ok(ClusterMetrics {
        node_count: nodes.len(),
        pod_count: pods.len(),
        namespace_count: namespaces.len(),
        cpu_allocatable_millis: cpu,
        memory_allocatable_bytes: memory,
        collected_at: Utc::now(),
    })
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn deployment_health(deployment: &Deployment) -> ComponentHealth {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    let healthy = available >= desired;
    ComponentHealth {
        name,
        healthy,
        message: (!healthy).then(|| format!("{available}/{desired} replicas available")),
    }
}

/// Rate a cluster from its nodes and system deployments.
#[must_use]
pub fn assess(nodes: &[Node], system_deployments: &[Deployment]) -> ClusterHealth {
    let nodes_ready = nodes.iter().filter(|n| node_ready(n)).count();
    let components: Vec<_> = system_deployments.iter().map(deployment_health).collect();

    let status = if nodes_ready == 0 {
        HealthStatus::Unhealthy
    } else if nodes_ready == nodes.len() && components.iter().all(|c| c.healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    ClusterHealth {
        status,
        nodes_ready,
        nodes_total: nodes.len(),
        components,
        checked_at: Utc::now(),
    }
}

/// Parse a CPU quantity (`2`, `500m`, `1.5`) into millicores.
#[must_use]
pub fn parse_cpu_millis(quantity: &str) -> u64 {
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse().unwrap_or(0);
    }
    quantity
        .parse::<f64>()
        .map(|cores| (cores * 1000.0).round())
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map_or(0, |v| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let millis = v as u64;
            millis
        })
}

/// Parse a memory quantity (`16Gi`, `1024Ki`, `1G`, `512`) into bytes.
#[must_use]
pub fn parse_bytes(quantity: &str) -> u64 {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, factor) in SUFFIXES {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<u64>().map_or(0, |v| v.saturating_mul(*factor));
        }
    }
    quantity.parse().unwrap_or(0)
}
