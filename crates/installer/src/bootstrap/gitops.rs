//! Argo CD installation and the GitOps hand-over.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::manifests::{self, ARGOCD_NAMESPACE, BOOTSTRAP_APPLICATION};
use super::{BootstrapOptions, BootstrapTimings};
use crate::cluster::PlatformCluster;
use crate::context::RunContext;
use crate::readiness::{Check, Poller, RetryPolicy};

const ARGOCD_DEPLOYMENTS: [&str; 2] = ["argocd-server", "argocd-repo-server"];
const CONTROLLER_SELECTOR: &str = "app.kubernetes.io/name=argocd-application-controller";

/// Retries for applying the root Application while the Argo CD CRDs and
/// webhooks settle.
const APPLY_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    initial_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(20),
    factor: 2.0,
};

async fn argocd_ready(cluster: &dyn PlatformCluster) -> Result<bool> {
    for deployment in ARGOCD_DEPLOYMENTS {
        if !cluster.deployment_available(ARGOCD_NAMESPACE, deployment).await? {
            debug!(deployment, "Argo CD component not yet available");
            return Ok(false);
        }
    }
    cluster.pods_ready(ARGOCD_NAMESPACE, CONTROLLER_SELECTOR).await
}

/// Install Argo CD unless it is already running, then wait for its server,
/// repo server and application controller.
///
/// # Errors
///
/// Fails when the chart install fails or Argo CD is not ready in time.
pub async fn install_argocd(
    cluster: &dyn PlatformCluster,
    ctx: &RunContext,
    options: &BootstrapOptions,
) -> Result<()> {
    if argocd_ready(cluster).await.unwrap_or(false) {
        info!("Argo CD already installed");
        return Ok(());
    }

    cluster
        .helm_install(&manifests::argocd_addon(options))
        .await
        .context("Failed to install Argo CD")?;

    Poller::new(options.timings.poll_interval, options.timings.argocd_timeout)
        .until_ready(ctx, "Argo CD", || argocd_ready(cluster))
        .await?;
    info!("Argo CD is ready");
    Ok(())
}

/// Create the root Application pointing at the bootstrap repository.
///
/// # Errors
///
/// Fails when the apply keeps failing after retries.
pub async fn create_bootstrap_application(
    cluster: &dyn PlatformCluster,
    ctx: &RunContext,
    repo_url: &str,
) -> Result<()> {
    create_bootstrap_application_with(cluster, ctx, repo_url, &APPLY_RETRY).await
}

async fn create_bootstrap_application_with(
    cluster: &dyn PlatformCluster,
    ctx: &RunContext,
    repo_url: &str,
    retry: &RetryPolicy,
) -> Result<()> {
    let manifest = manifests::bootstrap_application(repo_url, &RetryPolicy::default())?;
    retry
        .run(ctx, "bootstrap Application", || cluster.apply_manifest(&manifest))
        .await
        .context("Failed to create the bootstrap Application")?;
    info!(repo = repo_url, "Bootstrap Application created");
    Ok(())
}

/// Apply the packages and environments ApplicationSets.
///
/// # Errors
///
/// Fails when rendering or applying fails.
pub async fn apply_application_sets(
    cluster: &dyn PlatformCluster,
    packages_url: &str,
    environments_url: &str,
    environment: &str,
) -> Result<()> {
    let manifest = manifests::application_sets(packages_url, environments_url, environment)?;
    cluster
        .apply_manifest(&manifest)
        .await
        .context("Failed to apply ApplicationSets")?;
    info!(environment, "ApplicationSets applied");
    Ok(())
}

/// Wait for the root Application to report Synced and Healthy.
///
/// # Errors
///
/// Fails when the bound passes or the run is cancelled; callers treat the
/// timeout as a warning since Argo CD keeps syncing in the background.
pub async fn wait_for_sync(
    cluster: &dyn PlatformCluster,
    ctx: &RunContext,
    timings: &BootstrapTimings,
) -> Result<()> {
    let last: Mutex<Option<String>> = Mutex::new(None);
    let last_seen = &last;
    let result = Poller::new(timings.sync_interval, timings.sync_timeout)
        .until(ctx, "bootstrap Application sync", move || {
            let status = cluster.application_status(ARGOCD_NAMESPACE, BOOTSTRAP_APPLICATION);
            async move {
                match status.await {
                    Ok(Some(app)) => {
                        let ready = app.is_synced() && app.is_healthy();
                        debug!(sync = %app.sync_status, health = %app.health_status, "Application status");
                        *last_seen.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(format!("{}/{}", app.sync_status, app.health_status));
                        Check::from(ready)
                    }
                    Ok(None) => Check::Pending,
                    Err(e) => {
                        debug!(error = %e, "Application status unavailable");
                        Check::Pending
                    }
                }
            }
        })
        .await;

    match result {
        Ok(()) => {
            info!("Platform applications synced");
            Ok(())
        }
        Err(e) if e.is_timeout() => {
            let last = last.into_inner().unwrap_or_else(PoisonError::into_inner);
            Err(e).with_context(|| {
                format!(
                    "applications still syncing ({}); Argo CD continues in the background",
                    last.as_deref().unwrap_or("no status yet")
                )
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;

    fn timings() -> BootstrapTimings {
        BootstrapOptions::for_tests().timings
    }

    #[tokio::test]
    async fn test_existing_argocd_is_not_reinstalled() {
        let cluster = FakeCluster::new().all_ready();
        install_argocd(&cluster, &RunContext::new(), &BootstrapOptions::for_tests())
            .await
            .unwrap();
        assert!(cluster.helm_releases().is_empty());
    }

    #[tokio::test]
    async fn test_argocd_timeout_is_fatal() {
        let cluster = FakeCluster::new();
        cluster.set_ready("argocd", "argocd-server");
        cluster.set_ready("argocd", "argocd-repo-server");

        let err = install_argocd(&cluster, &RunContext::new(), &BootstrapOptions::for_tests())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Argo CD"));
        assert_eq!(cluster.helm_releases(), vec!["argocd".to_string()]);
    }

    #[tokio::test]
    async fn test_bootstrap_application_apply_is_retried() {
        let cluster = FakeCluster::new();
        cluster.fail_apply_containing("kind: Application");
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
        };

        let err = create_bootstrap_application_with(
            &cluster,
            &RunContext::new(),
            "http://gitea/adhar/bootstrap.git",
            &retry,
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("admission webhook"));
        assert!(cluster.applied().is_empty());
    }

    #[tokio::test]
    async fn test_sync_wait_succeeds_when_healthy() {
        let cluster = FakeCluster::new();
        cluster.set_application("argocd", "bootstrap", "Synced", "Healthy");
        wait_for_sync(&cluster, &RunContext::new(), &timings())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_wait_reports_last_status() {
        let cluster = FakeCluster::new();
        cluster.set_application("argocd", "bootstrap", "Synced", "Degraded");
        let err = wait_for_sync(&cluster, &RunContext::new(), &timings())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("still syncing"));
        assert!(message.contains("Synced/Degraded"));
    }
}
