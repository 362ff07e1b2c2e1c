//! Local platform provisioning.
//!
//! Six phases against a kind cluster:
//!
//! 1. Create the cluster (or reuse a running one) and connect to it
//! 2. Install the `AdharPlatform` CRD
//! 3. Configure CoreDNS for the platform domain and issue the TLS certificate
//! 4. Start the controller manager in the background
//! 5. Upsert the `AdharPlatform` object
//! 6. Wait for the platform to report ready
//!
//! Phase 6 ends when the manager finishes, when the run is cancelled after
//! sync, or when an independent readiness poll sees the platform ready
//! first with exit-on-sync set. Without it the controller keeps running
//! until interrupted. See [`manager`] for the state machine.

pub mod dns;
pub mod manager;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use adhar_cloud::command::CommandRunner;
use adhar_cloud::providers::cluster_id;
use adhar_cloud::{ClusterSpec, ClusterStatus, Provider};
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use tracing::{info, warn};

use crate::bootstrap::manifests::{ARGOCD_NAMESPACE, GITEA_NAMESPACE, INGRESS_NAMESPACE};
use crate::cluster::{ClusterConnector, PlatformCluster};
use crate::config::{CoreServices, GlobalSettings};
use crate::context::RunContext;
use crate::crd::{AdharPlatform, PLATFORM_NAME, PLATFORM_NAMESPACE};
use crate::kubeconfig;
use crate::pipeline::{Phase, Pipeline, PipelineError, PipelineReport};
use crate::readiness::{wait_for_cluster, Poller};
use crate::tls;
use crate::ui::{self, ProgressSink};

pub use manager::{ControllerManager, Exit, ManagerHandle, ManagerState};

/// Builds the controller manager for a connected cluster.
pub type ManagerFactory =
    Arc<dyn Fn(Arc<dyn PlatformCluster>) -> Arc<dyn ControllerManager> + Send + Sync>;

/// Default name of the local cluster.
pub const DEFAULT_CLUSTER_NAME: &str = "adhar";

/// Settings for a local run.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// kind cluster name.
    pub cluster_name: String,
    /// Global platform settings.
    pub settings: GlobalSettings,
    /// Core service toggles and versions.
    pub core_services: CoreServices,
    /// Merge the kubeconfig into `~/.kube/config`.
    pub merge_kubeconfig: bool,
    /// Interval for short readiness polls.
    pub poll_interval: Duration,
    /// Bound for the cluster to report running.
    pub cluster_timeout: Duration,
    /// Bound for the CRD to be established.
    pub crd_timeout: Duration,
    /// Interval of the platform readiness safety net.
    pub readiness_interval: Duration,
    /// Bound for the platform to become ready.
    pub readiness_timeout: Duration,
    /// Time the manager gets to exit after cancellation.
    pub grace_period: Duration,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            settings: GlobalSettings::default(),
            core_services: CoreServices::default(),
            merge_kubeconfig: true,
            poll_interval: Duration::from_secs(2),
            cluster_timeout: Duration::from_secs(600),
            crd_timeout: Duration::from_secs(60),
            readiness_interval: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(1800),
            grace_period: Duration::from_secs(30),
        }
    }
}

/// Result of a successful local run.
#[derive(Debug, Clone)]
pub struct LocalOutcome {
    /// Per-phase results.
    pub report: PipelineReport,
    /// Id of the cluster.
    pub cluster_id: Option<String>,
    /// Kubeconfig written for the cluster.
    pub kubeconfig_path: Option<PathBuf>,
}

#[derive(Default)]
struct Shared {
    cluster_id: Option<String>,
    kubeconfig_path: Option<PathBuf>,
    cluster: Option<Arc<dyn PlatformCluster>>,
    tls_certificate: Option<String>,
    manager: Option<ManagerHandle>,
}

/// The six-phase local pipeline.
pub struct LocalPipeline {
    provider: Arc<dyn Provider>,
    connector: Arc<dyn ClusterConnector>,
    runner: Arc<dyn CommandRunner>,
    manager_factory: ManagerFactory,
    options: LocalOptions,
    shared: Mutex<Shared>,
}

impl LocalPipeline {
    pub fn new(
        provider: Arc<dyn Provider>,
        connector: Arc<dyn ClusterConnector>,
        runner: Arc<dyn CommandRunner>,
        manager_factory: ManagerFactory,
        options: LocalOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            connector,
            runner,
            manager_factory,
            options,
            shared: Mutex::new(Shared::default()),
        })
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cluster(&self) -> Result<Arc<dyn PlatformCluster>> {
        self.shared()
            .cluster
            .clone()
            .context("cluster is not connected")
    }

    /// Desired local cluster.
    #[must_use]
    pub fn cluster_spec(&self) -> ClusterSpec {
        let settings = &self.options.settings;
        let mut spec = ClusterSpec::new(self.provider.name(), self.options.cluster_name.clone());
        spec.networking.http_port = Some(settings.http_port);
        spec.networking.https_port = Some(settings.https_port);
        spec.networking.cni = if self.options.core_services.is_enabled("cilium") {
            "cilium".to_string()
        } else {
            String::new()
        };
        spec
    }

    fn step<F, Fut>(self: &Arc<Self>, name: &str, description: &str, f: F) -> Phase
    where
        F: Fn(Arc<Self>, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        Phase::from_fn(name, description, move |ctx| f(Arc::clone(&this), ctx))
    }

    /// The phases in order.
    #[must_use]
    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        Pipeline::new("local")
            .phase(self.step("create-cluster", "Creating local cluster", |s, ctx| async move {
                s.create_cluster(&ctx).await
            }))
            .phase(self.step("platform-crds", "Installing platform CRDs", |s, ctx| async move {
                s.install_crds(&ctx).await
            }))
            .phase(self.step("dns-tls", "Configuring cluster DNS and TLS", |s, _ctx| async move {
                s.configure_dns_and_tls().await
            }))
            .phase(self.step("controller-manager", "Starting platform controller", |s, ctx| async move {
                s.start_manager(&ctx).await
            }))
            .phase(self.step("platform-resource", "Creating platform resource", |s, _ctx| async move {
                s.upsert_platform().await
            }))
            .phase(self.step("platform-ready", "Waiting for the platform", |s, ctx| async move {
                s.wait_for_platform(&ctx).await
            }))
    }

    /// Run all six phases.
    ///
    /// # Errors
    ///
    /// The first fatal phase failure, or an interrupt.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &RunContext,
        sink: &dyn ProgressSink,
    ) -> Result<LocalOutcome, PipelineError> {
        let result = self.pipeline().run(ctx, sink).await;
        let mut shared = self.shared();
        let leftover = shared.manager.take();
        let report = match result {
            Ok(report) => {
                // A manager left behind by skipped phases stops with the context
                drop(leftover);
                report
            }
            Err(e) => {
                if let Some(mut handle) = leftover {
                    handle.abort();
                }
                return Err(e);
            }
        };
        Ok(LocalOutcome {
            report,
            cluster_id: shared.cluster_id.clone(),
            kubeconfig_path: shared.kubeconfig_path.clone(),
        })
    }

    async fn create_cluster(&self, ctx: &RunContext) -> Result<()> {
        let spec = self.cluster_spec();
        let id = cluster_id(self.provider.name(), &spec.name);

        let existing = match self.provider.get_cluster(&id).await {
            Ok(cluster) => Some(cluster),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e).context("Failed to look up existing cluster"),
        };

        let cluster = match existing {
            Some(cluster) if cluster.status == ClusterStatus::Running => {
                info!(id = %cluster.id, "Reusing running cluster");
                cluster
            }
            _ => {
                let created = self
                    .provider
                    .create_cluster(&spec)
                    .await
                    .with_context(|| format!("Failed to create cluster {}", spec.name))?;
                let poller = Poller::new(self.options.poll_interval, self.options.cluster_timeout);
                wait_for_cluster(self.provider.as_ref(), ctx, &poller, &created.id).await?
            }
        };

        let raw = self
            .provider
            .get_kubeconfig(&cluster.id)
            .await
            .context("Failed to fetch kubeconfig")?;
        let path =
            kubeconfig::write_kubeconfig(&self.options.settings.output_dir(), &cluster.id, &raw).await?;

        if self.options.merge_kubeconfig {
            if let Some(target) = kubeconfig::default_kubeconfig_path() {
                if let Err(e) =
                    kubeconfig::merge_kubeconfig(self.runner.as_ref(), &path, &target, &cluster.id).await
                {
                    warn!(error = %format!("{e:#}"), "Could not merge kubeconfig, use the exported file");
                }
            }
        }

        let connected = self.connector.connect(&path).await?;
        let mut shared = self.shared();
        shared.cluster_id = Some(cluster.id.clone());
        shared.kubeconfig_path = Some(path);
        shared.cluster = Some(connected);
        info!(id = %cluster.id, "Cluster ready");
        Ok(())
    }

    async fn install_crds(&self, ctx: &RunContext) -> Result<()> {
        let cluster = self.cluster()?;
        cluster
            .install_platform_crd()
            .await
            .context("Failed to install AdharPlatform CRD")?;
        Poller::new(self.options.poll_interval, self.options.crd_timeout)
            .until_ready(ctx, "AdharPlatform CRD", || cluster.platform_crd_established())
            .await?;
        Ok(())
    }

    async fn configure_dns_and_tls(&self) -> Result<()> {
        let cluster = self.cluster()?;
        let domain = &self.options.settings.domain;

        if let Err(e) = dns::configure_coredns(cluster.as_ref(), domain).await {
            warn!(error = %format!("{e:#}"), "CoreDNS configuration failed, in-cluster lookups of the platform domain will not resolve");
        }

        let material = tls::ensure_tls_secret(cluster.as_ref(), INGRESS_NAMESPACE, domain).await?;
        self.shared().tls_certificate = Some(material.cert_pem);
        Ok(())
    }

    async fn start_manager(&self, ctx: &RunContext) -> Result<()> {
        let cluster = self.cluster()?;
        let manager = (self.manager_factory)(cluster);
        let handle = ManagerHandle::start(manager, ctx).await?;
        self.shared().manager = Some(handle);
        Ok(())
    }

    async fn upsert_platform(&self) -> Result<()> {
        let cluster = self.cluster()?;
        cluster.ensure_namespace(PLATFORM_NAMESPACE).await?;

        let mut platform = AdharPlatform::for_settings(&self.options.settings, Utc::now());
        let services = &self.options.core_services;
        for service in ["argocd", "gitea", "nginx", "cilium"] {
            if services.is_enabled(service) {
                platform
                    .spec
                    .core_services
                    .insert(service.to_string(), services.version(service).map(ToString::to_string));
            }
        }
        platform.spec.tls_certificate = self.shared().tls_certificate.clone();

        cluster
            .upsert_platform(&platform)
            .await
            .context("Failed to create AdharPlatform")?;
        info!(name = PLATFORM_NAME, namespace = PLATFORM_NAMESPACE, "Platform resource upserted");
        Ok(())
    }

    async fn wait_for_platform(&self, ctx: &RunContext) -> Result<()> {
        let cluster = self.cluster()?;
        let mut handle = self
            .shared()
            .manager
            .take()
            .context("controller manager is not running")?;

        let poller = Poller::new(self.options.readiness_interval, self.options.readiness_timeout);
        let safety_net = async {
            poller
                .until_ready(ctx, "platform readiness", || {
                    platform_ready(cluster.as_ref(), &self.options.core_services)
                })
                .await?;
            if !ctx.exit_on_sync() && !ctx.suppress_output() {
                ui::print_success("Platform is ready, press Ctrl-C to stop the controller");
            }
            Ok(())
        };

        let exit = handle.wait(ctx, self.options.grace_period, safety_net).await?;
        info!(exit = ?exit, "Platform is ready");
        Ok(())
    }
}

/// Whether the platform's core workloads are up and the platform object
/// reports its repositories created.
///
/// # Errors
///
/// Returns an error if the cluster cannot be queried.
pub async fn platform_ready(cluster: &dyn PlatformCluster, services: &CoreServices) -> Result<bool> {
    let mut deployments = vec![
        (ARGOCD_NAMESPACE, "argocd-server"),
        (ARGOCD_NAMESPACE, "argocd-repo-server"),
        (GITEA_NAMESPACE, "gitea"),
    ];
    if services.is_enabled("nginx") {
        deployments.push((INGRESS_NAMESPACE, "ingress-nginx-controller"));
    }
    for (namespace, name) in deployments {
        if !cluster.deployment_available(namespace, name).await? {
            return Ok(false);
        }
    }
    if !cluster.service_has_endpoints(GITEA_NAMESPACE, "gitea-http").await? {
        return Ok(false);
    }
    Ok(cluster
        .platform(PLATFORM_NAMESPACE, PLATFORM_NAME)
        .await?
        .is_some_and(|p| p.repositories_created()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::context::CancelReason;
    use crate::crd::{AdharPlatformStatus, PROVISIONING_STARTED_ANNOTATION};
    use crate::pipeline::PhaseStatus;
    use crate::ui::RecordingSink;
    use adhar_cloud::testing::{FakeProvider, ScriptedRunner};
    use async_trait::async_trait;
    use manager::tests::ScriptedManager;
    use std::collections::BTreeMap;
    use tokio::sync::oneshot;

    /// Marks the platform ready once it exists, then never returns.
    struct ReadyingManager {
        cluster: Arc<dyn PlatformCluster>,
    }

    #[async_trait]
    impl ControllerManager for ReadyingManager {
        async fn run(&self, _ctx: RunContext, started: oneshot::Sender<()>) -> Result<()> {
            let _ = started.send(());
            loop {
                if self.cluster.platform(PLATFORM_NAMESPACE, PLATFORM_NAME).await?.is_some() {
                    self.cluster
                        .patch_platform_status(
                            PLATFORM_NAMESPACE,
                            PLATFORM_NAME,
                            &AdharPlatformStatus {
                                repositories_created: true,
                                ..AdharPlatformStatus::default()
                            },
                        )
                        .await?;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn options(dir: &tempfile::TempDir) -> LocalOptions {
        let mut settings = GlobalSettings::default();
        settings.output_dir = Some(dir.path().to_path_buf());
        LocalOptions {
            settings,
            merge_kubeconfig: false,
            poll_interval: Duration::from_millis(2),
            cluster_timeout: Duration::from_millis(200),
            crd_timeout: Duration::from_millis(200),
            readiness_interval: Duration::from_millis(5),
            readiness_timeout: Duration::from_secs(2),
            grace_period: Duration::from_millis(50),
            ..LocalOptions::default()
        }
    }

    fn fake_cluster() -> Arc<FakeCluster> {
        let cluster = FakeCluster::new().all_ready();
        cluster.set_config_map(
            "kube-system",
            "coredns",
            BTreeMap::from([("Corefile".to_string(), ".:53 {\n    ready\n}\n".to_string())]),
        );
        Arc::new(cluster)
    }

    fn pipeline(
        provider: FakeProvider,
        cluster: &Arc<FakeCluster>,
        factory: ManagerFactory,
        dir: &tempfile::TempDir,
    ) -> Arc<LocalPipeline> {
        LocalPipeline::new(
            Arc::new(provider),
            Arc::new(Arc::clone(cluster)),
            Arc::new(ScriptedRunner::new()),
            factory,
            options(dir),
        )
    }

    #[tokio::test]
    async fn test_safety_net_completes_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let factory: ManagerFactory =
            Arc::new(|cluster| Arc::new(ReadyingManager { cluster }) as Arc<dyn ControllerManager>);
        let pipeline = pipeline(FakeProvider::new("kind"), &cluster, factory, &dir);

        let ctx = RunContext::new().with_exit_on_sync(true);
        let start = std::time::Instant::now();
        let outcome = pipeline.run(&ctx, &RecordingSink::new()).await.unwrap();

        assert_eq!(outcome.report.summary(), "6 of 6 steps completed");
        assert_eq!(ctx.reason(), Some(CancelReason::SyncComplete));
        assert_eq!(outcome.cluster_id.as_deref(), Some("kind-adhar"));
        assert!(outcome.kubeconfig_path.unwrap().exists());
        // The hung manager cost at most the grace period
        assert!(start.elapsed() < Duration::from_secs(2));

        assert!(cluster.crd_installed());
        assert_eq!(cluster.restarts(), vec!["kube-system/coredns".to_string()]);
        let platform = cluster.stored_platform().unwrap();
        assert!(platform
            .metadata
            .annotations
            .unwrap()
            .contains_key(PROVISIONING_STARTED_ANNOTATION));
        assert!(platform.spec.tls_certificate.unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_controller_keeps_running_without_exit_on_sync() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let factory: ManagerFactory =
            Arc::new(|cluster| Arc::new(ReadyingManager { cluster }) as Arc<dyn ControllerManager>);
        let pipeline = pipeline(FakeProvider::new("kind"), &cluster, factory, &dir);

        let ctx = RunContext::new().with_suppressed_output(true);
        let run_ctx = ctx.clone();
        let run = tokio::spawn(async move { pipeline.run(&run_ctx, &RecordingSink::new()).await });

        // Ready well within this window, yet still running
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cluster.stored_platform().unwrap().repositories_created());
        assert!(!run.is_finished());
        assert_eq!(ctx.reason(), None);

        ctx.cancel(CancelReason::Interrupt);
        let outcome = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.report.summary(), "6 of 6 steps completed");
    }

    #[tokio::test]
    async fn test_failure_after_manager_start_stops_the_manager() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        cluster.fail_platform_upsert();
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let task_stopped = Arc::clone(&stopped);
        let factory: ManagerFactory = Arc::new(move |_| {
            Arc::new(ScriptedManager {
                ignore_cancel: true,
                stopped: Arc::clone(&task_stopped),
                ..ScriptedManager::default()
            }) as Arc<dyn ControllerManager>
        });
        let pipeline = pipeline(FakeProvider::new("kind"), &cluster, factory, &dir);

        let ctx = RunContext::new();
        let err = pipeline.run(&ctx, &RecordingSink::new()).await.unwrap_err();
        assert_eq!(err.index(), 4);
        assert!(err.to_string().contains("conversion webhook"));
        assert!(pipeline.shared().manager.is_none());
        assert!(!ctx.is_cancelled());
        // The aborted task dropped the manager; the factory and the test hold the rest
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&stopped), 2);
    }

    #[tokio::test]
    async fn test_running_cluster_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let provider = FakeProvider::new("kind");
        let mut existing = adhar_cloud::Cluster::new("kind", &ClusterSpec::new("kind", "adhar"));
        existing.transition(ClusterStatus::Running);
        provider.insert(existing);
        let factory: ManagerFactory =
            Arc::new(|cluster| Arc::new(ReadyingManager { cluster }) as Arc<dyn ControllerManager>);
        let provider = Arc::new(provider);

        let pipeline = LocalPipeline::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            Arc::new(Arc::clone(&cluster)),
            Arc::new(ScriptedRunner::new()),
            factory,
            options(&dir),
        );
        let ctx = RunContext::new().with_exit_on_sync(true);
        pipeline.run(&ctx, &RecordingSink::new()).await.unwrap();
        assert!(!provider.calls().contains(&"create_cluster".to_string()));
    }

    #[tokio::test]
    async fn test_create_failure_aborts_at_first_phase() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let factory: ManagerFactory =
            Arc::new(|_| Arc::new(ScriptedManager::default()) as Arc<dyn ControllerManager>);
        let pipeline = pipeline(
            FakeProvider::new("kind").with_failing_create("docker daemon not running"),
            &cluster,
            factory,
            &dir,
        );

        let err = pipeline
            .run(&RunContext::new(), &RecordingSink::new())
            .await
            .unwrap_err();
        assert_eq!(err.index(), 0);
        assert!(err.to_string().contains("docker daemon not running"));
        assert!(!cluster.crd_installed());
    }

    #[tokio::test]
    async fn test_manager_start_failure_is_phase_four() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let factory: ManagerFactory = Arc::new(|_| {
            Arc::new(ScriptedManager {
                signal_start: false,
                fail_with: Some("metrics port already bound"),
                ..ScriptedManager::default()
            }) as Arc<dyn ControllerManager>
        });
        let pipeline = pipeline(FakeProvider::new("kind"), &cluster, factory, &dir);

        let err = pipeline
            .run(&RunContext::new(), &RecordingSink::new())
            .await
            .unwrap_err();
        assert_eq!(err.index(), 3);
        assert!(cluster.stored_platform().is_none());
    }

    #[tokio::test]
    async fn test_manager_self_cancellation_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let factory: ManagerFactory = Arc::new(|_| {
            Arc::new(ScriptedManager {
                cancel_on_sync_after: Some(Duration::from_millis(100)),
                ..ScriptedManager::default()
            }) as Arc<dyn ControllerManager>
        });
        let pipeline = pipeline(FakeProvider::new("kind"), &cluster, factory, &dir);

        let ctx = RunContext::new().with_exit_on_sync(true);
        let outcome = pipeline.run(&ctx, &RecordingSink::new()).await.unwrap();
        assert!(ctx.cancelled_by_sync());
        assert!(outcome
            .report
            .phases
            .iter()
            .all(|(_, status)| *status == PhaseStatus::Completed));
    }

    #[tokio::test]
    async fn test_interrupt_while_waiting_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = fake_cluster();
        let factory: ManagerFactory =
            Arc::new(|_| Arc::new(ScriptedManager::default()) as Arc<dyn ControllerManager>);
        let pipeline = pipeline(FakeProvider::new("kind"), &cluster, factory, &dir);

        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel(CancelReason::Interrupt);
        });

        let err = pipeline.run(&ctx, &RecordingSink::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { index: 5, .. }));
    }
}
