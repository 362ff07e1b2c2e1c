//! Cloud environment provisioning.
//!
//! One [`EnvironmentPipeline`] provisions one resolved environment:
//! pre-flight checks, cluster creation, addons and the GitOps bootstrap.
//! [`ProviderManager`] fans out over every configured environment.

pub mod manager;
pub mod preflight;

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use adhar_cloud::command::CommandRunner;
use adhar_cloud::providers::{cluster_id, CostEstimate};
use adhar_cloud::{ClusterSpec, ClusterStatus, Provider};
use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::bootstrap::gitserver;
use crate::bootstrap::{BootstrapOptions, BootstrapTimings, GitServer, GiteaClient, Sequencer};
use crate::cluster::{ClusterConnector, PlatformCluster};
use crate::config::ResolvedEnvironment;
use crate::context::RunContext;
use crate::kubeconfig;
use crate::pipeline::{Phase, Pipeline, PipelineError, PipelineReport};
use crate::readiness::{wait_for_cluster, Poller};
use crate::ui::{ConsoleSink, ProgressSink};

pub use manager::{EnvironmentResult, FanOutReport, ProviderManager};

/// Timing and mode settings shared by every environment.
#[derive(Debug, Clone)]
pub struct ProductionOptions {
    /// Print what would be created instead of creating it.
    pub dry_run: bool,
    /// Interval of cluster status polls.
    pub poll_interval: Duration,
    /// Bound for a cloud cluster to report running.
    pub cluster_timeout: Duration,
    /// Bootstrap wait bounds.
    pub bootstrap: BootstrapTimings,
}

impl Default for ProductionOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            poll_interval: Duration::from_secs(15),
            cluster_timeout: Duration::from_secs(1800),
            bootstrap: BootstrapTimings::default(),
        }
    }
}

/// Read-only description of what provisioning an environment would do.
#[derive(Debug, Clone)]
pub struct Plan {
    pub environment: String,
    pub provider: String,
    pub spec: ClusterSpec,
    pub core_services: Vec<String>,
    pub addons: Vec<String>,
    pub cost: Option<CostEstimate>,
}

impl Plan {
    /// Human-readable summary lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("environment: {}", self.environment),
            format!("provider: {} ({})", self.provider, self.spec.region),
            format!("cluster: {}", cluster_id(&self.provider, &self.spec.name)),
        ];
        if !self.spec.version.is_empty() {
            lines.push(format!("kubernetes: {}", self.spec.version));
        }
        lines.push(format!(
            "control plane: {} replica(s){}",
            self.spec.control_plane.replicas,
            if self.spec.control_plane.high_availability { ", HA" } else { "" }
        ));
        for group in &self.spec.node_groups {
            let size = if group.instance_type.is_empty() {
                "default size"
            } else {
                group.instance_type.as_str()
            };
            lines.push(format!("node group {}: {} x {size}", group.name, group.replicas));
        }
        lines.push(format!("core services: {}", self.core_services.join(", ")));
        if !self.addons.is_empty() {
            lines.push(format!("addons: {}", self.addons.join(", ")));
        }
        if let Some(cost) = &self.cost {
            lines.push(format!("estimated cost: {:.2} {}/month", cost.monthly, cost.currency));
        }
        lines
    }
}

#[derive(Default)]
struct Shared {
    cluster_id: Option<String>,
    kubeconfig_path: Option<PathBuf>,
    cluster: Option<Arc<dyn PlatformCluster>>,
}

/// Outcome of provisioning one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentOutcome {
    pub report: PipelineReport,
    pub cluster_id: Option<String>,
    pub kubeconfig_path: Option<PathBuf>,
}

/// Provisions one resolved environment.
pub struct EnvironmentPipeline {
    env: ResolvedEnvironment,
    provider: Arc<dyn Provider>,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn ClusterConnector>,
    git: Option<Arc<dyn GitServer>>,
    options: ProductionOptions,
    shared: Mutex<Shared>,
}

impl EnvironmentPipeline {
    pub fn new(
        env: ResolvedEnvironment,
        provider: Arc<dyn Provider>,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn ClusterConnector>,
        options: ProductionOptions,
    ) -> Arc<Self> {
        Self::build(env, provider, runner, connector, None, options)
    }

    pub(crate) fn build(
        env: ResolvedEnvironment,
        provider: Arc<dyn Provider>,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn ClusterConnector>,
        git: Option<Arc<dyn GitServer>>,
        options: ProductionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            env,
            provider,
            runner,
            connector,
            git,
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

    /// What would be created, without touching anything.
    pub async fn plan(&self) -> Plan {
        let spec = self.env.cluster_spec();
        let cost = match self.provider.estimate_cost(&spec).await {
            Ok(cost) => Some(cost),
            Err(e) => {
                if !e.is_not_supported() {
                    warn!(error = %e, "Cost estimate unavailable");
                }
                None
            }
        };
        Plan {
            environment: self.env.name.clone(),
            provider: self.provider.name().to_string(),
            core_services: self.env.core_services.enabled_summary(),
            addons: self.env.addons.iter().map(|a| a.name.clone()).collect(),
            spec,
            cost,
        }
    }

    fn step<F, Fut>(self: &Arc<Self>, name: &str, description: &str, f: F) -> Phase
    where
        F: Fn(Arc<Self>, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        Phase::from_fn(name, description, move |ctx| f(Arc::clone(&this), ctx))
    }

    #[must_use]
    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        Pipeline::new(format!("environment {}", self.env.name))
            .phase(self.step("preflight", "Running pre-flight checks", |s, ctx| async move {
                preflight::run(s.provider.as_ref(), &s.env, s.runner.as_ref(), ctx.suppress_output())
                    .await
                    .map(|_| ())
            }))
            .phase(self.step("create-cluster", "Creating cluster", |s, ctx| async move {
                s.create_cluster(&ctx).await
            }))
            .phase(
                self.step("addons", "Installing addons", |s, _ctx| async move {
                    s.install_addons().await
                })
                .non_fatal(),
            )
            .phase(self.step("bootstrap", "Bootstrapping GitOps", |s, ctx| async move {
                s.bootstrap(&ctx).await
            }))
    }

    /// Provision the environment.
    ///
    /// # Errors
    ///
    /// The first fatal phase failure, or an interrupt.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &RunContext,
        sink: &dyn ProgressSink,
    ) -> Result<EnvironmentOutcome, PipelineError> {
        let report = self.pipeline().run(ctx, sink).await?;
        let shared = self.shared();
        Ok(EnvironmentOutcome {
            report,
            cluster_id: shared.cluster_id.clone(),
            kubeconfig_path: shared.kubeconfig_path.clone(),
        })
    }

    async fn create_cluster(&self, ctx: &RunContext) -> Result<()> {
        let spec = self.env.cluster_spec();
        let id = cluster_id(self.provider.name(), &spec.name);

        let cluster = match self.provider.get_cluster(&id).await {
            Ok(existing) if existing.status == ClusterStatus::Running => {
                info!(id = %id, "Cluster already running");
                existing
            }
            Ok(existing) => {
                info!(id = %id, status = %existing.status, "Cluster exists, waiting for it");
                let poller = Poller::new(self.options.poll_interval, self.options.cluster_timeout);
                wait_for_cluster(self.provider.as_ref(), ctx, &poller, &id).await?
            }
            Err(e) if e.is_not_found() => {
                let created = self
                    .provider
                    .create_cluster(&spec)
                    .await
                    .with_context(|| format!("Failed to create cluster {}", spec.name))?;
                let poller = Poller::new(self.options.poll_interval, self.options.cluster_timeout);
                wait_for_cluster(self.provider.as_ref(), ctx, &poller, &created.id).await?
            }
            Err(e) => return Err(e).context("Failed to look up existing cluster"),
        };

        let raw = self
            .provider
            .get_kubeconfig(&cluster.id)
            .await
            .context("Failed to fetch kubeconfig")?;
        let path = kubeconfig::write_kubeconfig(&self.env.global.output_dir(), &cluster.id, &raw).await?;
        let connected = self.connector.connect(&path).await?;

        let mut shared = self.shared();
        shared.cluster_id = Some(cluster.id);
        shared.kubeconfig_path = Some(path);
        shared.cluster = Some(connected);
        Ok(())
    }

    async fn install_addons(&self) -> Result<()> {
        let cluster = self.cluster()?;
        let mut failed = Vec::new();
        for addon in &self.env.addons {
            let spec = addon.to_spec();
            match cluster.helm_install(&spec).await {
                Ok(()) => info!(addon = %spec.name, "Addon installed"),
                Err(e) => {
                    warn!(addon = %spec.name, error = %format!("{e:#}"), "Addon install failed");
                    failed.push(spec.name);
                }
            }
        }
        if !failed.is_empty() {
            bail!(
                "{} of {} addons failed: {}",
                failed.len(),
                self.env.addons.len(),
                failed.join(", ")
            );
        }
        Ok(())
    }

    async fn bootstrap(&self, ctx: &RunContext) -> Result<()> {
        let cluster = self.cluster()?;
        let spec = self.env.cluster_spec();
        let password = gitserver::admin_password(
            cluster.as_ref(),
            self.env.global.git.admin_password.as_deref(),
        )
        .await?;

        let mut options = BootstrapOptions::new(&self.env.global, self.env.name.clone(), false, password)
            .with_core_services(&self.env.core_services)
            .with_cni(spec.networking.cni);
        options.timings = self.options.bootstrap;

        let git: Arc<dyn GitServer> = match &self.git {
            Some(git) => Arc::clone(git),
            None => Arc::new(GiteaClient::from_options(&options)?),
        };

        let nested = ctx.clone().with_suppressed_output(true);
        let report = Sequencer::new(cluster, git, Arc::clone(&self.runner), options)
            .run(&nested, &ConsoleSink::new(true))
            .await?;
        for (phase, message) in report.warnings() {
            warn!(environment = %self.env.name, phase, message, "Bootstrap step finished with a warning");
        }
        Ok(())
    }
}
