//! Static rate cards for cost estimation.

use super::types::{ClusterSpec, CostEstimate, CostItem};

/// Hours billed per month.
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Hourly prices for one provider.
#[derive(Debug, Clone, Copy)]
pub struct RateCard {
    /// Managed control plane fee per cluster.
    pub control_plane_hourly: f64,
    /// Instance type used when a node group names none.
    pub default_instance: &'static str,
    /// Hourly price per instance type.
    pub instances: &'static [(&'static str, f64)],
    /// Fallback price for unknown instance types.
    pub unknown_instance_hourly: f64,
}

impl RateCard {
    fn instance_rate(&self, instance_type: &str) -> f64 {
        self.instances
            .iter()
            .find(|(name, _)| *name == instance_type)
            .map_or(self.unknown_instance_hourly, |(_, rate)| *rate)
    }

    /// Estimate `spec` against this card.
    #[must_use]
    pub fn estimate(&self, spec: &ClusterSpec) -> CostEstimate {
        let mut items = Vec::new();
        if self.control_plane_hourly > 0.0 {
            items.push(CostItem {
                description: "Managed control plane".to_string(),
                quantity: 1,
                hourly: self.control_plane_hourly,
            });
        }
        for group in &spec.node_groups {
            let instance = if group.instance_type.is_empty() {
                self.default_instance
            } else {
                group.instance_type.as_str()
            };
            items.push(CostItem {
                description: format!("Node group {} ({instance})", group.name),
                quantity: group.replicas,
                hourly: self.instance_rate(instance) * f64::from(group.replicas),
            });
        }

        let hourly: f64 = items.iter().map(|i| i.hourly).sum();
        CostEstimate {
            currency: "USD".to_string(),
            hourly,
            monthly: hourly * HOURS_PER_MONTH,
            items,
        }
    }
}

/// Amazon EKS.
pub const AWS: RateCard = RateCard {
    control_plane_hourly: 0.10,
    default_instance: "m5.large",
    instances: &[
        ("t3.medium", 0.0416),
        ("t3.large", 0.0832),
        ("m5.large", 0.096),
        ("m5.xlarge", 0.192),
        ("m5.2xlarge", 0.384),
        ("c5.xlarge", 0.17),
    ],
    unknown_instance_hourly: 0.10,
};

/// Google GKE.
pub const GCP: RateCard = RateCard {
    control_plane_hourly: 0.10,
    default_instance: "e2-standard-4",
    instances: &[
        ("e2-medium", 0.0335),
        ("e2-standard-2", 0.067),
        ("e2-standard-4", 0.134),
        ("e2-standard-8", 0.268),
        ("n2-standard-4", 0.194),
    ],
    unknown_instance_hourly: 0.134,
};

/// Azure AKS (free tier control plane).
pub const AZURE: RateCard = RateCard {
    control_plane_hourly: 0.0,
    default_instance: "Standard_D4s_v3",
    instances: &[
        ("Standard_B2s", 0.0416),
        ("Standard_D2s_v3", 0.096),
        ("Standard_D4s_v3", 0.192),
        ("Standard_D8s_v3", 0.384),
    ],
    unknown_instance_hourly: 0.192,
};

/// DigitalOcean DOKS.
pub const DIGITALOCEAN: RateCard = RateCard {
    control_plane_hourly: 0.0,
    default_instance: "s-2vcpu-4gb",
    instances: &[
        ("s-1vcpu-2gb", 0.01786),
        ("s-2vcpu-4gb", 0.03571),
        ("s-4vcpu-8gb", 0.07143),
        ("g-4vcpu-16gb", 0.1875),
    ],
    unknown_instance_hourly: 0.03571,
};

/// Civo Kubernetes.
pub const CIVO: RateCard = RateCard {
    control_plane_hourly: 0.0,
    default_instance: "g4s.kube.medium",
    instances: &[
        ("g4s.kube.small", 0.01493),
        ("g4s.kube.medium", 0.02985),
        ("g4s.kube.large", 0.05970),
        ("g4s.kube.xlarge", 0.11940),
    ],
    unknown_instance_hourly: 0.02985,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::NodeGroupSpec;

    #[test]
    fn test_estimate_sums_groups_and_control_plane() {
        let mut spec = ClusterSpec::new("aws", "prod");
        spec.node_groups = vec![
            NodeGroupSpec {
                name: "general".into(),
                replicas: 3,
                instance_type: "m5.large".into(),
                ..NodeGroupSpec::default()
            },
            NodeGroupSpec {
                name: "odd".into(),
                replicas: 1,
                instance_type: "x9.mega".into(),
                ..NodeGroupSpec::default()
            },
        ];
        let estimate = AWS.estimate(&spec);
        let expected = 0.10 + 3.0 * 0.096 + 0.10;
        assert!((estimate.hourly - expected).abs() < 1e-9);
        assert!((estimate.monthly - expected * HOURS_PER_MONTH).abs() < 1e-6);
        assert_eq!(estimate.items.len(), 3);
    }

    #[test]
    fn test_default_instance_used_when_unset() {
        let spec = ClusterSpec::new("digitalocean", "dev");
        let estimate = DIGITALOCEAN.estimate(&spec);
        assert_eq!(estimate.items.len(), 1);
        assert!(estimate.items[0].description.contains("s-2vcpu-4gb"));
    }
}
