//! The platform controller run by the local pipeline.
//!
//! Waits for the `AdharPlatform` object, runs the bootstrap sequence as a
//! nested run with suppressed output and records the result in the
//! object's status. Setting `repositoriesCreated` is what the local
//! pipeline's readiness check waits for.

use std::sync::Arc;
use std::time::Duration;

use adhar_cloud::command::CommandRunner;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::bootstrap::gitserver;
use crate::bootstrap::{BootstrapOptions, BootstrapTimings, GitServer, GiteaClient, Sequencer};
use crate::cluster::PlatformCluster;
use crate::config::{CoreServices, GlobalSettings};
use crate::context::{CancelReason, RunContext};
use crate::crd::{AdharPlatform, AdharPlatformStatus, PLATFORM_NAME, PLATFORM_NAMESPACE};
use crate::local::ControllerManager;
use crate::readiness::{Check, Poller};
use crate::ui::ConsoleSink;

const PHASE_BOOTSTRAPPING: &str = "Bootstrapping";
const PHASE_READY: &str = "Ready";
const PHASE_FAILED: &str = "Failed";

/// Reconciles the single `AdharPlatform` object of a local cluster.
pub struct PlatformReconciler {
    cluster: Arc<dyn PlatformCluster>,
    runner: Arc<dyn CommandRunner>,
    settings: GlobalSettings,
    core_services: CoreServices,
    environment: String,
    git: Option<Arc<dyn GitServer>>,
    timings: BootstrapTimings,
    poll_interval: Duration,
    platform_timeout: Duration,
}

impl PlatformReconciler {
    pub fn new(
        cluster: Arc<dyn PlatformCluster>,
        runner: Arc<dyn CommandRunner>,
        settings: GlobalSettings,
    ) -> Self {
        Self {
            cluster,
            runner,
            settings,
            core_services: CoreServices::default(),
            environment: "local".to_string(),
            git: None,
            timings: BootstrapTimings::default(),
            poll_interval: Duration::from_secs(2),
            platform_timeout: Duration::from_secs(600),
        }
    }

    #[must_use]
    pub fn with_core_services(mut self, services: CoreServices) -> Self {
        self.core_services = services;
        self
    }

    /// Use `git` instead of a Gitea client built from the settings.
    #[must_use]
    pub fn with_git_server(mut self, git: Arc<dyn GitServer>) -> Self {
        self.git = Some(git);
        self
    }

    #[must_use]
    pub fn with_timings(mut self, timings: BootstrapTimings, poll_interval: Duration) -> Self {
        self.timings = timings;
        self.poll_interval = poll_interval;
        self
    }

    async fn await_platform(&self, ctx: &RunContext) -> Result<Option<AdharPlatform>> {
        let cluster = self.cluster.as_ref();
        let poller = Poller::new(self.poll_interval, self.platform_timeout);
        let result = poller
            .until(ctx, "AdharPlatform object", || async move {
                match cluster.platform(PLATFORM_NAMESPACE, PLATFORM_NAME).await {
                    Ok(Some(_)) => Check::Ready,
                    Ok(None) | Err(_) => Check::Pending,
                }
            })
            .await;
        match result {
            Ok(()) => cluster.platform(PLATFORM_NAMESPACE, PLATFORM_NAME).await,
            Err(e) if e.is_cancelled() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_status(&self, status: AdharPlatformStatus) -> Result<()> {
        self.cluster
            .patch_platform_status(PLATFORM_NAMESPACE, PLATFORM_NAME, &status)
            .await
            .context("Failed to update AdharPlatform status")
    }

    async fn bootstrap(&self, ctx: &RunContext, platform: &AdharPlatform) -> Result<()> {
        let mut settings = self.settings.clone();
        settings.domain.clone_from(&platform.spec.domain);

        let password = gitserver::admin_password(
            self.cluster.as_ref(),
            settings.git.admin_password.as_deref(),
        )
        .await?;
        let mut options = BootstrapOptions::new(&settings, self.environment.clone(), true, password)
            .with_core_services(&self.core_services);
        options.timings = self.timings;

        let git: Arc<dyn GitServer> = match &self.git {
            Some(git) => Arc::clone(git),
            None => Arc::new(GiteaClient::from_options(&options)?),
        };

        let nested = ctx.clone().with_suppressed_output(true);
        let report = Sequencer::new(Arc::clone(&self.cluster), git, Arc::clone(&self.runner), options)
            .run(&nested, &ConsoleSink::new(true))
            .await?;
        for (phase, message) in report.warnings() {
            warn!(phase, message, "Bootstrap step finished with a warning");
        }
        Ok(())
    }

    async fn idle(&self, ctx: &RunContext) {
        if ctx.exit_on_sync() {
            info!("Platform synced, exiting");
            ctx.cancel(CancelReason::SyncComplete);
        } else {
            ctx.cancelled().await;
        }
    }
}

#[async_trait]
impl ControllerManager for PlatformReconciler {
    async fn run(&self, ctx: RunContext, started: oneshot::Sender<()>) -> Result<()> {
        let _ = started.send(());
        info!(run_id = %ctx.run_id(), "Platform controller started");

        let Some(platform) = self.await_platform(&ctx).await? else {
            return Ok(());
        };
        if platform.repositories_created() {
            info!("Platform already reconciled");
            self.idle(&ctx).await;
            return Ok(());
        }

        self.set_status(AdharPlatformStatus {
            phase: Some(PHASE_BOOTSTRAPPING.to_string()),
            ..AdharPlatformStatus::default()
        })
        .await?;

        match self.bootstrap(&ctx, &platform).await {
            Ok(()) => {
                let now = Utc::now();
                self.set_status(AdharPlatformStatus {
                    repositories_created: true,
                    phase: Some(PHASE_READY.to_string()),
                    message: None,
                    ready_at: Some(now.to_rfc3339()),
                })
                .await?;
                match platform.provisioning_started_at() {
                    Some(started_at) => info!(
                        seconds = (now - started_at).num_seconds(),
                        "Platform ready"
                    ),
                    None => info!("Platform ready"),
                }
                self.idle(&ctx).await;
                Ok(())
            }
            Err(_) if ctx.is_cancelled() => Ok(()),
            Err(e) => {
                if let Err(status_err) = self
                    .set_status(AdharPlatformStatus {
                        phase: Some(PHASE_FAILED.to_string()),
                        message: Some(format!("{e:#}")),
                        ..AdharPlatformStatus::default()
                    })
                    .await
                {
                    warn!(error = %status_err, "Could not record bootstrap failure");
                }
                Err(e.context("Platform bootstrap failed"))
            }
        }
    }
}
