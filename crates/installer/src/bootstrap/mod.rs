//! Two-phase platform bootstrap.
//!
//! The platform cannot be declarative until a minimal substrate exists, so
//! the sequencer first installs it imperatively (CNI check, namespaces,
//! Argo CD, Gitea) and then hands over to GitOps (repositories, the root
//! Application, ApplicationSets and a bounded sync wait).
//!
//! Every step checks whether its target already exists before acting, so
//! re-running the whole sequence is safe.

pub mod cni;
pub mod gitops;
pub mod gitserver;
pub mod manifests;
pub mod repos;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adhar_cloud::command::CommandRunner;
use anyhow::Context;
use tracing::info;

use crate::cluster::PlatformCluster;
use crate::config::{AddonConfig, CoreServices, GlobalSettings};
use crate::context::RunContext;
use crate::crd::PLATFORM_NAMESPACE;
use crate::pipeline::{Phase, Pipeline, PipelineError, PipelineReport};
use crate::ui::ProgressSink;

pub use gitserver::{GitServer, GiteaClient};
use manifests::{Package, RepoKind, ARGOCD_NAMESPACE, GITEA_NAMESPACE, INGRESS_NAMESPACE};
use repos::RepoPublisher;

/// Wait bounds for the bootstrap steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapTimings {
    /// Interval of readiness polls.
    pub poll_interval: Duration,
    /// Bound for the CNI check.
    pub cni_timeout: Duration,
    /// Bound for Argo CD to become available.
    pub argocd_timeout: Duration,
    /// Bound for each Gitea readiness step.
    pub gitea_timeout: Duration,
    /// Fixed pause between endpoints appearing and the API probe.
    pub settle_delay: Duration,
    /// Pause before the single API probe retry.
    pub probe_retry_delay: Duration,
    /// Interval of sync status polls.
    pub sync_interval: Duration,
    /// Bound for the root Application to sync.
    pub sync_timeout: Duration,
}

impl Default for BootstrapTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            cni_timeout: Duration::from_secs(180),
            argocd_timeout: Duration::from_secs(300),
            gitea_timeout: Duration::from_secs(300),
            settle_delay: Duration::from_secs(10),
            probe_retry_delay: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(300),
        }
    }
}

/// What to bootstrap and where.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Environment name (directory in the environments repository).
    pub environment: String,
    /// Base domain.
    pub domain: String,
    /// Local cluster (host-port ingress) rather than cloud.
    pub local: bool,
    /// CNI the cluster was provisioned with; empty for the provider default.
    pub cni: String,
    /// Install ingress-nginx before Gitea.
    pub install_ingress: bool,
    /// Externally reachable Gitea URL.
    pub git_url: String,
    /// Accept self-signed certificates when talking to Gitea.
    pub accept_invalid_certs: bool,
    /// Organisation owning the repositories.
    pub organization: String,
    /// Gitea admin user.
    pub admin_user: String,
    /// Gitea admin password.
    pub admin_password: String,
    /// Argo CD chart version override.
    pub argocd_version: Option<String>,
    /// Gitea chart version override.
    pub gitea_version: Option<String>,
    /// ingress-nginx chart version override.
    pub ingress_version: Option<String>,
    /// Namespaces created in the bootstrap phase.
    pub namespaces: Vec<String>,
    /// Charts handed to the packages ApplicationSet.
    pub packages: Vec<Package>,
    /// Scratch directory for repository work trees.
    pub workdir: PathBuf,
    /// Wait bounds.
    pub timings: BootstrapTimings,
}

impl BootstrapOptions {
    /// Options derived from global settings.
    #[must_use]
    pub fn new(
        settings: &GlobalSettings,
        environment: impl Into<String>,
        local: bool,
        admin_password: impl Into<String>,
    ) -> Self {
        let git_url = if local {
            format!("https://gitea.{}:{}", settings.domain, settings.https_port)
        } else {
            format!("https://gitea.{}", settings.domain)
        };
        Self {
            environment: environment.into(),
            domain: settings.domain.clone(),
            local,
            cni: "cilium".to_string(),
            install_ingress: true,
            git_url,
            accept_invalid_certs: true,
            organization: settings.git.organization.clone(),
            admin_user: settings.git.admin_user.clone(),
            admin_password: admin_password.into(),
            argocd_version: None,
            gitea_version: None,
            ingress_version: None,
            namespaces: vec![
                ARGOCD_NAMESPACE.to_string(),
                GITEA_NAMESPACE.to_string(),
                INGRESS_NAMESPACE.to_string(),
                PLATFORM_NAMESPACE.to_string(),
            ],
            packages: manifests::default_packages(),
            workdir: settings.output_dir().join("repos"),
            timings: BootstrapTimings::default(),
        }
    }

    /// Apply core service toggles and versions.
    #[must_use]
    pub fn with_core_services(mut self, services: &CoreServices) -> Self {
        self.argocd_version = services.version("argocd").map(ToString::to_string);
        self.gitea_version = services.version("gitea").map(ToString::to_string);
        self.ingress_version = services.version("nginx").map(ToString::to_string);
        self.install_ingress = services.is_enabled("nginx");
        if !self.install_ingress {
            self.namespaces.retain(|ns| ns != INGRESS_NAMESPACE);
        }
        self
    }

    /// Hand addons to the packages ApplicationSet.
    #[must_use]
    pub fn with_addons(mut self, addons: &[AddonConfig]) -> Self {
        self.packages
            .extend(addons.iter().map(|a| Package::from(&a.to_spec())));
        self
    }

    /// Use `cni` as the CNI to verify.
    #[must_use]
    pub fn with_cni(mut self, cni: impl Into<String>) -> Self {
        self.cni = cni.into();
        self
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let mut options = Self::new(&GlobalSettings::default(), "local", true, "s3cret");
        options.workdir = std::env::temp_dir().join("adhar-bootstrap-tests");
        options.timings = BootstrapTimings {
            poll_interval: Duration::from_millis(5),
            cni_timeout: Duration::from_millis(100),
            argocd_timeout: Duration::from_millis(100),
            gitea_timeout: Duration::from_millis(100),
            settle_delay: Duration::from_millis(1),
            probe_retry_delay: Duration::from_millis(1),
            sync_interval: Duration::from_millis(5),
            sync_timeout: Duration::from_millis(50),
        };
        options
    }
}

/// Runs the eight bootstrap steps against one cluster.
pub struct Sequencer {
    cluster: Arc<dyn PlatformCluster>,
    git: Arc<dyn GitServer>,
    runner: Arc<dyn CommandRunner>,
    options: BootstrapOptions,
}

impl Sequencer {
    /// Sequencer over explicit collaborators.
    pub fn new(
        cluster: Arc<dyn PlatformCluster>,
        git: Arc<dyn GitServer>,
        runner: Arc<dyn CommandRunner>,
        options: BootstrapOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            git,
            runner,
            options,
        })
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &BootstrapOptions {
        &self.options
    }

    fn step<F, Fut>(self: &Arc<Self>, name: &str, description: &str, f: F) -> Phase
    where
        F: Fn(Arc<Self>, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        Phase::from_fn(name, description, move |ctx| f(Arc::clone(&this), ctx))
    }

    /// The eight steps as a pipeline.
    #[must_use]
    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        Pipeline::new("bootstrap")
            .phase(self.step("verify-cni", "Verifying cluster networking", |s, ctx| async move {
                cni::verify(s.cluster.as_ref(), &ctx, &s.options.cni, &s.options.timings).await
            }))
            .phase(self.step("namespaces", "Creating namespaces", |s, _ctx| async move {
                s.create_namespaces().await
            }))
            .phase(self.step("argocd", "Installing Argo CD", |s, ctx| async move {
                gitops::install_argocd(s.cluster.as_ref(), &ctx, &s.options).await
            }))
            .phase(self.step("gitea", "Installing Gitea", |s, ctx| async move {
                gitserver::install(s.cluster.as_ref(), &ctx, &s.options).await
            }))
            .phase(self.step("repositories", "Populating GitOps repositories", |s, _ctx| async move {
                s.populate_repositories().await
            }))
            .phase(self.step("application", "Creating bootstrap Application", |s, ctx| async move {
                let url = s.git.in_cluster_url(&s.options.organization, RepoKind::Bootstrap.repo_name());
                gitops::create_bootstrap_application(s.cluster.as_ref(), &ctx, &url).await
            }))
            .phase(self.step("applicationsets", "Applying platform ApplicationSets", |s, _ctx| async move {
                let org = &s.options.organization;
                gitops::apply_application_sets(
                    s.cluster.as_ref(),
                    &s.git.in_cluster_url(org, RepoKind::Packages.repo_name()),
                    &s.git.in_cluster_url(org, RepoKind::Environments.repo_name()),
                    &s.options.environment,
                )
                .await
            }))
            .phase(
                self.step("sync", "Waiting for GitOps sync", |s, ctx| async move {
                    gitops::wait_for_sync(s.cluster.as_ref(), &ctx, &s.options.timings).await
                })
                .non_fatal(),
            )
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// The first fatal step failure, or an interrupt.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &RunContext,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineReport, PipelineError> {
        info!(
            environment = %self.options.environment,
            domain = %self.options.domain,
            "Bootstrapping platform"
        );
        let report = self.pipeline().run(ctx, sink).await?;
        info!(summary = %report.summary(), "Bootstrap finished");
        Ok(report)
    }

    async fn create_namespaces(&self) -> anyhow::Result<()> {
        for namespace in &self.options.namespaces {
            let created = self
                .cluster
                .ensure_namespace(namespace)
                .await
                .with_context(|| format!("Failed to ensure namespace {namespace}"))?;
            if !created {
                info!(namespace = %namespace, "Namespace already exists");
            }
        }
        Ok(())
    }

    async fn populate_repositories(&self) -> anyhow::Result<()> {
        self.git
            .ensure_organization(&self.options.organization)
            .await
            .context("Failed to create Git organisation")?;

        let mut contents = Vec::new();
        for kind in RepoKind::ALL {
            contents.push((kind, manifests::repo_contents(kind, &self.options)?));
        }

        let publisher = RepoPublisher::new(
            Arc::clone(&self.runner),
            Arc::clone(&self.git),
            &self.options,
        );
        let results = publisher.publish_all(contents).await;

        let failed: Vec<String> = results
            .iter()
            .filter_map(|(kind, r)| r.as_ref().err().map(|e| format!("{kind}: {e:#}")))
            .collect();
        if !failed.is_empty() {
            anyhow::bail!(
                "{} of {} repositories failed: {}",
                failed.len(),
                results.len(),
                failed.join("; ")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::context::CancelReason;
    use crate::pipeline::PhaseStatus;
    use crate::ui::RecordingSink;
    use adhar_cloud::command::CommandOutput;
    use adhar_cloud::testing::ScriptedRunner;
    use gitserver::MockGitServer;

    pub(crate) const VERSION_JSON: &str = r#"{"version":"1.22.3"}"#;

    pub(crate) fn mock_git() -> MockGitServer {
        let mut git = MockGitServer::new();
        git.expect_ensure_organization().returning(|_| Ok(true));
        git.expect_ensure_repository().returning(|_, _| Ok(true));
        git.expect_push_url()
            .returning(|org, name| format!("https://gitea.example/{org}/{name}.git"));
        git.expect_in_cluster_url()
            .returning(|org, name| format!("http://gitea-http.gitea.svc:3000/{org}/{name}.git"));
        git
    }

    pub(crate) fn git_runner() -> ScriptedRunner {
        let runner = ScriptedRunner::new();
        runner.respond("git clone", CommandOutput::ok(""));
        runner.respond("git add", CommandOutput::ok(""));
        runner.respond("git status", CommandOutput::ok("A  README.md\n"));
        runner.respond("git -c", CommandOutput::ok(""));
        runner.respond("git push", CommandOutput::ok(""));
        runner
    }

    fn sequencer(cluster: Arc<FakeCluster>, runner: ScriptedRunner) -> (Arc<Sequencer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut options = BootstrapOptions::for_tests();
        options.workdir = dir.path().to_path_buf();
        let sequencer = Sequencer::new(cluster, Arc::new(mock_git()), Arc::new(runner), options);
        (sequencer, dir)
    }

    #[tokio::test]
    async fn test_full_sequence_succeeds() {
        let cluster = Arc::new(FakeCluster::new().all_ready());
        cluster.script_exec("gitea", "deploy/gitea", vec![Ok(VERSION_JSON)]);
        cluster.set_application("argocd", "bootstrap", "Synced", "Healthy");
        let (sequencer, _dir) = sequencer(Arc::clone(&cluster), git_runner());

        let sink = RecordingSink::new();
        let report = sequencer.run(&RunContext::new(), &sink).await.unwrap();

        assert_eq!(report.summary(), "8 of 8 steps completed");
        assert!(cluster.has_namespace("argocd"));
        assert!(cluster.has_namespace("adhar-system"));
        assert_eq!(cluster.applied_containing("kind: Application\n"), 1);
        assert_eq!(cluster.applied_containing("kind: ApplicationSet"), 1);
    }

    #[tokio::test]
    async fn test_rerun_skips_installed_components() {
        let cluster = Arc::new(FakeCluster::new().all_ready());
        cluster.set_application("argocd", "bootstrap", "Synced", "Healthy");
        let (sequencer, _dir) = sequencer(Arc::clone(&cluster), git_runner());

        sequencer.run(&RunContext::new(), &RecordingSink::new()).await.unwrap();
        sequencer.run(&RunContext::new(), &RecordingSink::new()).await.unwrap();

        // Everything was already available, so nothing was helm-installed
        assert!(cluster.helm_releases().is_empty());
    }

    #[tokio::test]
    async fn test_sync_timeout_is_a_warning() {
        let cluster = Arc::new(FakeCluster::new().all_ready());
        cluster.set_application("argocd", "bootstrap", "OutOfSync", "Progressing");
        let (sequencer, _dir) = sequencer(Arc::clone(&cluster), git_runner());

        let report = sequencer
            .run(&RunContext::new(), &RecordingSink::new())
            .await
            .unwrap();

        assert_eq!(report.completed(), 7);
        let warnings = report.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, "sync");
        assert!(warnings[0].1.contains("still syncing"));
    }

    #[tokio::test]
    async fn test_missing_cni_is_fatal() {
        let cluster = Arc::new(FakeCluster::new());
        let (sequencer, _dir) = sequencer(Arc::clone(&cluster), git_runner());

        let err = sequencer
            .run(&RunContext::new(), &RecordingSink::new())
            .await
            .unwrap_err();
        assert_eq!(err.index(), 0);
        assert!(!cluster.has_namespace("argocd"));
    }

    #[tokio::test]
    async fn test_repository_failure_names_the_repository() {
        let cluster = Arc::new(FakeCluster::new().all_ready());
        let runner = git_runner();
        runner.respond("git push", CommandOutput::failed(1, "remote: permission denied"));
        let (sequencer, _dir) = sequencer(Arc::clone(&cluster), runner);

        let err = sequencer
            .run(&RunContext::new(), &RecordingSink::new())
            .await
            .unwrap_err();
        assert_eq!(err.index(), 4);
        let message = format!("{err}");
        assert!(message.contains("3 of 3 repositories failed"));
        assert!(message.contains("bootstrap:"));
    }

    #[tokio::test]
    async fn test_sync_cancellation_during_wait_is_success() {
        let cluster = Arc::new(FakeCluster::new().all_ready());
        cluster.set_application("argocd", "bootstrap", "OutOfSync", "Progressing");
        let (sequencer, _dir) = {
            let dir = tempfile::tempdir().unwrap();
            let mut options = BootstrapOptions::for_tests();
            options.workdir = dir.path().to_path_buf();
            options.timings.sync_timeout = Duration::from_secs(30);
            let s = Sequencer::new(
                Arc::clone(&cluster) as Arc<dyn PlatformCluster>,
                Arc::new(mock_git()),
                Arc::new(git_runner()),
                options,
            );
            (s, dir)
        };

        let ctx = RunContext::new().with_exit_on_sync(true);
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel(CancelReason::SyncComplete);
        });

        let report = sequencer.run(&ctx, &RecordingSink::new()).await.unwrap();
        assert_eq!(report.phases[7].1, PhaseStatus::Completed);
    }
}
