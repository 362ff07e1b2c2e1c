//! Best-effort fan-out over configured environments.

use std::sync::Arc;

use adhar_cloud::command::CommandRunner;
use adhar_cloud::ProviderRegistry;
use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info, warn};

use super::{EnvironmentOutcome, EnvironmentPipeline, Plan, ProductionOptions};
use crate::bootstrap::GitServer;
use crate::cluster::ClusterConnector;
use crate::config::PlatformConfig;
use crate::context::RunContext;
use crate::pipeline::PipelineError;
use crate::ui::ProgressSink;

/// What happened to one environment.
#[derive(Debug)]
pub enum EnvironmentResult {
    /// Provisioned (possibly with warnings).
    Provisioned(EnvironmentOutcome),
    /// Dry run.
    Planned(Plan),
    /// Failed; the message carries the full error chain.
    Failed(String),
    /// Skipped because the run was interrupted first.
    NotAttempted,
}

impl EnvironmentResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Provisioned(_) | Self::Planned(_))
    }
}

/// Results of a fan-out, in provisioning order.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub environments: Vec<(String, EnvironmentResult)>,
}

impl FanOutReport {
    /// Every environment of the run, attempted or not.
    #[must_use]
    pub fn total(&self) -> usize {
        self.environments.len()
    }

    #[must_use]
    pub fn attempted(&self) -> usize {
        self.total() - self.skipped().len()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.environments.iter().filter(|(_, r)| r.is_success()).count()
    }

    fn named(&self, pred: impl Fn(&EnvironmentResult) -> bool) -> Vec<&str> {
        self.environments
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Environments skipped after an interrupt.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.named(|r| matches!(r, EnvironmentResult::NotAttempted))
    }

    /// "N of M environments provisioned", noting any that were not attempted.
    #[must_use]
    pub fn summary(&self) -> String {
        let summary = format!(
            "{} of {} environments provisioned",
            self.succeeded(),
            self.total()
        );
        match self.skipped().len() {
            0 => summary,
            skipped => format!("{summary}, {skipped} not attempted"),
        }
    }

    /// Fail unless every environment succeeded.
    ///
    /// # Errors
    ///
    /// Lists the failed and skipped environments.
    pub fn into_result(self) -> Result<Self> {
        if self.succeeded() == self.total() {
            return Ok(self);
        }
        let mut detail = Vec::new();
        let failed = self.named(|r| matches!(r, EnvironmentResult::Failed(_)));
        if !failed.is_empty() {
            detail.push(format!("failed: {}", failed.join(", ")));
        }
        let skipped = self.skipped();
        if !skipped.is_empty() {
            detail.push(format!("not attempted: {}", skipped.join(", ")));
        }
        Err(anyhow!("{} ({})", self.summary(), detail.join("; ")))
    }
}

/// Provisions environments through providers from the registry.
pub struct ProviderManager {
    config: PlatformConfig,
    registry: Arc<ProviderRegistry>,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn ClusterConnector>,
    git: Option<Arc<dyn GitServer>>,
    options: ProductionOptions,
}

impl ProviderManager {
    pub fn new(
        config: PlatformConfig,
        registry: Arc<ProviderRegistry>,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn ClusterConnector>,
        options: ProductionOptions,
    ) -> Self {
        Self {
            config,
            registry,
            runner,
            connector,
            git: None,
            options,
        }
    }

    /// Use `git` for every environment instead of per-cluster Gitea clients.
    #[must_use]
    pub fn with_git_server(mut self, git: Arc<dyn GitServer>) -> Self {
        self.git = Some(git);
        self
    }

    /// Environment names, those on the primary provider first.
    #[must_use]
    pub fn environment_order(&self) -> Vec<String> {
        let primary = self.config.primary_provider();
        let mut names: Vec<(bool, String)> = self
            .config
            .environments
            .iter()
            .map(|(name, env)| {
                let provider = env.provider.clone().or_else(|| {
                    env.template
                        .as_ref()
                        .and_then(|t| self.config.environment_templates.get(t))
                        .and_then(|t| t.provider.clone())
                });
                (provider.as_deref() != primary, name.clone())
            })
            .collect();
        names.sort();
        names.into_iter().map(|(_, name)| name).collect()
    }

    fn pipeline(&self, name: &str) -> Result<Arc<EnvironmentPipeline>> {
        let env = self.config.resolve(name)?;
        let provider = self
            .registry
            .create_provider(&env.provider_type, &env.provider_config)
            .with_context(|| format!("Failed to create {} provider", env.provider_type))?;
        Ok(EnvironmentPipeline::build(
            env,
            provider,
            Arc::clone(&self.runner),
            Arc::clone(&self.connector),
            self.git.clone(),
            self.options.clone(),
        ))
    }

    /// Provision (or plan) a single environment.
    ///
    /// # Errors
    ///
    /// Resolution, provider construction or the failing phase.
    pub async fn provision(
        &self,
        name: &str,
        ctx: &RunContext,
        sink: &dyn ProgressSink,
    ) -> Result<EnvironmentResult> {
        let pipeline = self.pipeline(name)?;
        if self.options.dry_run {
            return Ok(EnvironmentResult::Planned(pipeline.plan().await));
        }
        info!(environment = name, "Provisioning environment");
        let outcome = pipeline.run(ctx, sink).await?;
        Ok(EnvironmentResult::Provisioned(outcome))
    }

    /// Provision every environment. One failure does not stop the others;
    /// an interrupt does.
    pub async fn provision_all(&self, ctx: &RunContext, sink: &dyn ProgressSink) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut stopped = false;
        for name in self.environment_order() {
            if stopped || ctx.is_cancelled() {
                if !stopped {
                    warn!(environment = %name, "Run cancelled, not provisioning remaining environments");
                    stopped = true;
                }
                report.environments.push((name, EnvironmentResult::NotAttempted));
                continue;
            }
            let result = match self.provision(&name, ctx, sink).await {
                Ok(result) => result,
                Err(e) => {
                    error!(environment = %name, error = %format!("{e:#}"), "Environment failed");
                    stopped = e
                        .downcast_ref::<PipelineError>()
                        .is_some_and(|p| matches!(p, PipelineError::Cancelled { .. }));
                    EnvironmentResult::Failed(format!("{e:#}"))
                }
            };
            report.environments.push((name, result));
        }
        info!(summary = %report.summary(), "Fan-out finished");
        report
    }

    /// Provision `only` when given, otherwise every environment.
    ///
    /// # Errors
    ///
    /// The single environment's error, or any failure in the fan-out.
    pub async fn run(
        &self,
        only: Option<&str>,
        ctx: &RunContext,
        sink: &dyn ProgressSink,
    ) -> Result<FanOutReport> {
        if self.config.environments.is_empty() {
            bail!("no environments configured");
        }
        match only {
            Some(name) => {
                let result = self.provision(name, ctx, sink).await?;
                Ok(FanOutReport {
                    environments: vec![(name.to_string(), result)],
                })
            }
            None => self.provision_all(ctx, sink).await.into_result(),
        }
    }
}
