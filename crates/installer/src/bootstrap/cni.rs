//! CNI verification.
//!
//! The CNI is provisioned with the cluster (kind installs Cilium, managed
//! clouds ship their own), so bootstrap only confirms pod networking works.

use anyhow::{Context, Result};
use tracing::info;

use super::BootstrapTimings;
use crate::cluster::PlatformCluster;
use crate::context::RunContext;
use crate::readiness::Poller;

/// Wait for the cluster's CNI to report ready.
///
/// Known CNIs are checked through their agent DaemonSet. For a provider
/// default CNI the CoreDNS Deployment becoming available stands in, since
/// it cannot start without pod networking.
///
/// # Errors
///
/// Fails when the CNI is not ready within the bound.
pub async fn verify(
    cluster: &dyn PlatformCluster,
    ctx: &RunContext,
    cni: &str,
    timings: &BootstrapTimings,
) -> Result<()> {
    let poller = Poller::new(timings.poll_interval, timings.cni_timeout);
    match cni {
        "cilium" | "calico" => {
            let daemonset = if cni == "cilium" { "cilium" } else { "calico-node" };
            poller
                .until_ready(ctx, &format!("{cni} agents"), || {
                    cluster.daemonset_ready("kube-system", daemonset)
                })
                .await
                .with_context(|| format!("{cni} is not running; was the cluster created with it?"))?;
        }
        _ => {
            poller
                .until_ready(ctx, "cluster DNS", || {
                    cluster.deployment_available("kube-system", "coredns")
                })
                .await
                .context("pod networking is not ready")?;
        }
    }
    info!(cni = if cni.is_empty() { "provider default" } else { cni }, "CNI verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;

    fn timings() -> BootstrapTimings {
        super::super::BootstrapOptions::for_tests().timings
    }

    #[tokio::test]
    async fn test_cilium_daemonset_checked() {
        let cluster = FakeCluster::new();
        cluster.set_ready("kube-system", "cilium");
        verify(&cluster, &RunContext::new(), "cilium", &timings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provider_default_uses_coredns() {
        let cluster = FakeCluster::new();
        let err = verify(&cluster, &RunContext::new(), "", &timings())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pod networking"));

        cluster.set_ready("kube-system", "coredns");
        verify(&cluster, &RunContext::new(), "", &timings())
            .await
            .unwrap();
    }
}
