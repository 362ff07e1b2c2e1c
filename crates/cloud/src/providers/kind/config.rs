//! kind cluster configuration rendering.

use serde::Serialize;

use crate::providers::types::ClusterSpec;

/// Host port for ingress HTTP when the `ClusterSpec` sets none.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Host port for ingress HTTPS when the `ClusterSpec` sets none.
pub const DEFAULT_HTTPS_PORT: u16 = 8443;

const INGRESS_READY_PATCH: &str = "kind: InitConfiguration
nodeRegistration:
  kubeletExtraArgs:
    node-labels: \"ingress-ready=true\"
";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindConfig {
    kind: &'static str,
    api_version: &'static str,
    name: String,
    networking: Networking,
    nodes: Vec<Node>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking {
    #[serde(rename = "disableDefaultCNI", skip_serializing_if = "std::ops::Not::not")]
    disable_default_cni: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pod_subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_subnet: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kubeadm_config_patches: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PortMapping {
    container_port: u16,
    host_port: u16,
    protocol: &'static str,
}

/// Render the kind configuration for `spec`.
///
/// The first control-plane node carries the ingress host-port mappings;
/// workers come from the node groups. The default CNI is disabled whenever
/// a CNI other than kind's own is requested.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render(spec: &ClusterSpec, node_image: Option<&str>) -> Result<String, serde_yaml::Error> {
    let image = node_image
        .map(ToString::to_string)
        .or_else(|| (!spec.version.is_empty()).then(|| format!("kindest/node:v{}", spec.version.trim_start_matches('v'))));

    let control_planes = spec.control_plane.replicas.max(1);
    let mut nodes = Vec::new();
    for i in 0..control_planes {
        let first = i == 0;
        nodes.push(Node {
            role: "control-plane",
            image: image.clone(),
            kubeadm_config_patches: if first {
                vec![INGRESS_READY_PATCH.to_string()]
            } else {
                Vec::new()
            },
            extra_port_mappings: if first {
                vec![
                    PortMapping {
                        container_port: 80,
                        host_port: spec.networking.http_port.unwrap_or(DEFAULT_HTTP_PORT),
                        protocol: "TCP",
                    },
                    PortMapping {
                        container_port: 443,
                        host_port: spec.networking.https_port.unwrap_or(DEFAULT_HTTPS_PORT),
                        protocol: "TCP",
                    },
                ]
            } else {
                Vec::new()
            },
        });
    }

    // A single-node cluster schedules workloads on the control plane
    let workers: u32 = spec
        .node_groups
        .iter()
        .map(|g| g.replicas)
        .sum::<u32>()
        .saturating_sub(if spec.node_groups.len() == 1 { 1 } else { 0 });
    for _ in 0..workers {
        nodes.push(Node {
            role: "worker",
            image: image.clone(),
            kubeadm_config_patches: Vec::new(),
            extra_port_mappings: Vec::new(),
        });
    }

    let cni = spec.networking.cni.as_str();
    let config = KindConfig {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        name: spec.name.clone(),
        networking: Networking {
            disable_default_cni: !(cni.is_empty() || cni == "kindnet"),
            pod_subnet: spec.networking.pod_cidr.clone(),
            service_subnet: spec.networking.service_cidr.clone(),
        },
        nodes,
    };
    serde_yaml::to_string(&config)
}
