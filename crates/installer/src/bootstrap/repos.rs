//! Publishing generated content to the GitOps repositories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use adhar_cloud::command::{run_checked, CommandRunner, CommandSpec};
use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::manifests::RepoKind;
use super::{BootstrapOptions, GitServer};

const COMMIT_AUTHOR: &str = "Adhar Platform";
const COMMIT_EMAIL: &str = "platform@adhar.io";

/// What a publish did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A commit was pushed to `branch`.
    Pushed {
        /// Branch that accepted the push.
        branch: &'static str,
    },
    /// The remote already had identical content.
    UpToDate,
}

/// Writes repository contents into local work trees and pushes them.
pub struct RepoPublisher {
    runner: Arc<dyn CommandRunner>,
    git: Arc<dyn GitServer>,
    organization: String,
    workdir: PathBuf,
    accept_invalid_certs: bool,
}

impl RepoPublisher {
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        git: Arc<dyn GitServer>,
        options: &BootstrapOptions,
    ) -> Self {
        Self {
            runner,
            git,
            organization: options.organization.clone(),
            workdir: options.workdir.clone(),
            accept_invalid_certs: options.accept_invalid_certs,
        }
    }

    /// Publish every repository concurrently. Each result is reported
    /// separately so one failure does not hide the others.
    pub async fn publish_all(
        &self,
        contents: Vec<(RepoKind, BTreeMap<String, String>)>,
    ) -> Vec<(RepoKind, Result<PushOutcome>)> {
        join_all(contents.into_iter().map(|(kind, files)| async move {
            let result = self.publish(kind, &files).await;
            if let Err(e) = &result {
                warn!(repository = %kind, error = %e, "Repository publish failed");
            }
            (kind, result)
        }))
        .await
    }

    /// Make the remote repository hold exactly `files`.
    ///
    /// # Errors
    ///
    /// Fails when the repository cannot be created, written or pushed.
    pub async fn publish(
        &self,
        kind: RepoKind,
        files: &BTreeMap<String, String>,
    ) -> Result<PushOutcome> {
        let name = kind.repo_name();
        let created = self
            .git
            .ensure_repository(&self.organization, name)
            .await
            .with_context(|| format!("Failed to create repository {name}"))?;
        debug!(repository = name, created, "Repository ensured");

        let url = self.git.push_url(&self.organization, name);
        let dir = self.workdir.join(name);
        self.checkout(&url, &dir).await?;
        write_tree(&dir, files).await?;

        self.git_in(&dir, ["add", "-A"]).await?;
        let status = self.git_in(&dir, ["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            info!(repository = name, "Repository already up to date");
            return Ok(PushOutcome::UpToDate);
        }

        self.git_in(
            &dir,
            [
                "-c".to_string(),
                format!("user.name={COMMIT_AUTHOR}"),
                "-c".to_string(),
                format!("user.email={COMMIT_EMAIL}"),
                "commit".to_string(),
                "-m".to_string(),
                format!("Update {name} content"),
            ],
        )
        .await?;

        match self.push(&dir, "main").await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                debug!(repository = name, error = %e, "Push to main rejected, trying master");
                self.push(&dir, "master")
                    .await
                    .with_context(|| format!("Failed to push {name}"))
            }
        }
    }

    async fn push(&self, dir: &Path, branch: &'static str) -> Result<PushOutcome> {
        let refspec = format!("HEAD:{branch}");
        self.git_in(dir, ["push", "--force", "origin", refspec.as_str()])
            .await?;
        info!(path = %dir.display(), branch, "Repository pushed");
        Ok(PushOutcome::Pushed { branch })
    }

    async fn checkout(&self, url: &str, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let clone = self
            .git(["clone".to_string(), url.to_string(), dir.display().to_string()]);
        let cloned = run_checked(self.runner.as_ref(), &clone).await;
        tokio::fs::create_dir_all(dir).await?;

        if let Err(e) = cloned {
            // A freshly created repository without commits cannot be cloned
            debug!(error = %e, "Clone failed, initialising an empty work tree");
            self.git_in(dir, ["init", "--initial-branch=main"]).await?;
            self.git_in(dir, ["remote", "add", "origin", url]).await?;
        }
        Ok(())
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("git")
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0");
        if self.accept_invalid_certs {
            spec.env("GIT_SSL_NO_VERIFY", "true")
        } else {
            spec
        }
    }

    async fn git_in<I, S>(&self, dir: &Path, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.git(args).current_dir(dir);
        Ok(run_checked(self.runner.as_ref(), &spec).await?)
    }
}

/// Replace everything in `dir` except `.git` with `files`.
async fn write_tree(dir: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }

    for (relative, content) in files {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::gitserver::MockGitServer;
    use adhar_cloud::command::CommandOutput;
    use adhar_cloud::testing::ScriptedRunner;

    fn git_server() -> Arc<MockGitServer> {
        let mut git = MockGitServer::new();
        git.expect_ensure_repository().returning(|_, _| Ok(false));
        git.expect_push_url()
            .returning(|org, name| format!("https://u:p@gitea.example/{org}/{name}.git"));
        Arc::new(git)
    }

    fn publisher(runner: &ScriptedRunner, dir: &Path) -> RepoPublisher {
        let mut options = BootstrapOptions::for_tests();
        options.workdir = dir.to_path_buf();
        RepoPublisher::new(Arc::new(runner.clone()), git_server(), &options)
    }

    fn files() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("README.md".to_string(), "# bootstrap\n".to_string()),
            ("apps/root.yaml".to_string(), "kind: Application\n".to_string()),
        ])
    }

    fn scripted() -> ScriptedRunner {
        let runner = ScriptedRunner::new();
        runner.respond("git clone", CommandOutput::ok(""));
        runner.respond("git add", CommandOutput::ok(""));
        runner.respond("git status", CommandOutput::ok("A  README.md\n"));
        runner.respond("git -c", CommandOutput::ok(""));
        runner.respond("git push", CommandOutput::ok(""));
        runner
    }

    #[tokio::test]
    async fn test_publish_writes_files_and_pushes_main() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = scripted();
        let stale = tmp.path().join("bootstrap/stale.yaml");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        let outcome = publisher(&runner, tmp.path())
            .publish(RepoKind::Bootstrap, &files())
            .await
            .unwrap();

        assert_eq!(outcome, PushOutcome::Pushed { branch: "main" });
        let dir = tmp.path().join("bootstrap");
        assert!(dir.join("apps/root.yaml").exists());
        assert!(!stale.exists());
        let push = runner
            .calls()
            .into_iter()
            .find(|c| c.display().starts_with("git push"))
            .unwrap();
        assert_eq!(push.current_dir.as_deref(), Some(dir.as_path()));
        assert!(push.env.contains(&("GIT_SSL_NO_VERIFY".to_string(), "true".to_string())));
    }

    #[tokio::test]
    async fn test_unchanged_content_is_not_committed() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = scripted();
        runner.respond("git status", CommandOutput::ok(""));

        let outcome = publisher(&runner, tmp.path())
            .publish(RepoKind::Packages, &files())
            .await
            .unwrap();

        assert_eq!(outcome, PushOutcome::UpToDate);
        assert!(!runner.was_called("git -c"));
        assert!(!runner.was_called("git push"));
    }

    #[tokio::test]
    async fn test_push_falls_back_to_master() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = scripted();
        runner.respond(
            "git push --force origin HEAD:main",
            CommandOutput::failed(1, "protected branch"),
        );

        let outcome = publisher(&runner, tmp.path())
            .publish(RepoKind::Environments, &files())
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Pushed { branch: "master" });
    }

    #[tokio::test]
    async fn test_empty_remote_is_initialised() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = scripted();
        runner.respond("git clone", CommandOutput::failed(128, "remote HEAD refers to nonexistent ref"));
        runner.respond("git init", CommandOutput::ok(""));
        runner.respond("git remote add", CommandOutput::ok(""));

        publisher(&runner, tmp.path())
            .publish(RepoKind::Bootstrap, &files())
            .await
            .unwrap();
        assert!(runner.was_called("git init --initial-branch=main"));
        assert!(runner.was_called("git remote add origin https://u:p@gitea.example/adhar/bootstrap.git"));
    }

    #[tokio::test]
    async fn test_publish_all_reports_each_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = scripted();
        runner.respond("git push", CommandOutput::failed(1, "remote: permission denied"));

        let results = publisher(&runner, tmp.path())
            .publish_all(RepoKind::ALL.into_iter().map(|k| (k, files())).collect())
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_err()));
        let message = format!("{:#}", results[0].1.as_ref().unwrap_err());
        assert!(message.contains("permission denied"));
    }
}
