//! In-cluster resolution of the platform domain.
//!
//! Pods resolve `*.<domain>` to the ingress controller through a CoreDNS
//! rewrite rule, so in-cluster clients reach the same hosts as the browser.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use tracing::info;

use crate::bootstrap::manifests::INGRESS_NAMESPACE;
use crate::cluster::PlatformCluster;

const COREDNS_NAMESPACE: &str = "kube-system";
const COREDNS_NAME: &str = "coredns";
const COREFILE_KEY: &str = "Corefile";

/// The rewrite line for `domain`.
#[must_use]
pub fn rewrite_rule(domain: &str) -> String {
    format!(
        "rewrite name regex (.*)\\.{} ingress-nginx-controller.{INGRESS_NAMESPACE}.svc.cluster.local answer auto",
        regex::escape(domain)
    )
}

/// Insert the rewrite rule into the root server block of `corefile`.
///
/// Returns `None` when the rule is already present.
#[must_use]
pub fn patch_corefile(corefile: &str, domain: &str) -> Option<String> {
    let rule = rewrite_rule(domain);
    if corefile.contains(&rule) {
        return None;
    }

    let mut out = String::with_capacity(corefile.len() + rule.len() + 8);
    let mut inserted = false;
    for line in corefile.lines() {
        out.push_str(line);
        out.push('\n');
        if !inserted && line.trim_start().starts_with(".:53") && line.trim_end().ends_with('{') {
            out.push_str("    ");
            out.push_str(&rule);
            out.push('\n');
            inserted = true;
        }
    }
    if !inserted {
        out.push_str(&format!(".:53 {{\n    {rule}\n    forward . /etc/resolv.conf\n}}\n"));
    }
    Some(out)
}

/// Add the rewrite rule to CoreDNS and restart it.
///
/// # Errors
///
/// Fails when the ConfigMap cannot be read or written.
pub async fn configure_coredns(cluster: &dyn PlatformCluster, domain: &str) -> Result<()> {
    let mut data = cluster
        .config_map_data(COREDNS_NAMESPACE, COREDNS_NAME)
        .await?
        .context("CoreDNS ConfigMap not found")?;
    let corefile = data.get(COREFILE_KEY).cloned().unwrap_or_default();

    let Some(patched) = patch_corefile(&corefile, domain) else {
        info!(domain, "CoreDNS already resolves the platform domain");
        return Ok(());
    };
    data.insert(COREFILE_KEY.to_string(), patched);

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(COREDNS_NAME.to_string()),
            namespace: Some(COREDNS_NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    };
    cluster
        .apply_manifest(&serde_yaml::to_string(&config_map)?)
        .await
        .context("Failed to update CoreDNS configuration")?;
    cluster
        .rollout_restart(COREDNS_NAMESPACE, COREDNS_NAME)
        .await
        .context("Failed to restart CoreDNS")?;
    info!(domain, "CoreDNS configured for the platform domain");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use std::collections::BTreeMap;

    const KIND_COREFILE: &str = ".:53 {\n    errors\n    health\n    ready\n    forward . /etc/resolv.conf\n}\n";

    #[test]
    fn test_rule_inserted_once() {
        let patched = patch_corefile(KIND_COREFILE, "adhar.localtest.me").unwrap();
        assert!(patched.starts_with(".:53 {\n    rewrite name regex (.*)\\.adhar\\.localtest\\.me "));
        assert!(patch_corefile(&patched, "adhar.localtest.me").is_none());
    }

    #[tokio::test]
    async fn test_configure_updates_and_restarts() {
        let cluster = FakeCluster::new();
        cluster.set_config_map(
            "kube-system",
            "coredns",
            BTreeMap::from([("Corefile".to_string(), KIND_COREFILE.to_string())]),
        );

        configure_coredns(&cluster, "adhar.localtest.me").await.unwrap();
        assert_eq!(cluster.restarts(), vec!["kube-system/coredns".to_string()]);

        // Second run finds the rule and leaves CoreDNS alone
        configure_coredns(&cluster, "adhar.localtest.me").await.unwrap();
        assert_eq!(cluster.restarts().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_config_map_is_an_error() {
        let err = configure_coredns(&FakeCluster::new(), "adhar.localtest.me")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CoreDNS ConfigMap not found"));
    }
}
