//! Test doubles: a scripted [`CommandRunner`] and an in-memory [`Provider`].

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::providers::{
    ensure_spec_for, Cluster, ClusterSpec, ClusterStatus, CostEstimate, Credentials, Provider,
    ProviderError, QuotaChecker, QuotaReport,
};

#[derive(Default)]
struct Script {
    responses: Vec<(String, CommandOutput)>,
    programs: HashSet<String>,
    calls: Vec<CommandSpec>,
}

/// Runner that answers from canned responses keyed by command-line prefix.
///
/// The longest matching prefix wins; a later response for the same prefix
/// replaces the earlier one. Unmatched commands exit with status 127.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRunner {
    /// Runner with no responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer commands starting with `prefix`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        let mut script = self.script();
        script.responses.retain(|(p, _)| p != prefix);
        script.responses.push((prefix.to_string(), output));
    }

    /// Report `program` as installed.
    pub fn install_program(&self, program: &str) {
        self.script().programs.insert(program.to_string());
    }

    /// Every command run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.script().calls.clone()
    }

    /// Whether any command line started with `prefix`.
    #[must_use]
    pub fn was_called(&self, prefix: &str) -> bool {
        self.script().calls.iter().any(|c| c.display().starts_with(prefix))
    }

    /// Number of command lines starting with `prefix`.
    #[must_use]
    pub fn call_count(&self, prefix: &str) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|c| c.display().starts_with(prefix))
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProviderError> {
        let line = spec.display();
        let mut script = self.script();
        script.calls.push(spec.clone());
        let response = script
            .responses
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone());
        Ok(response.unwrap_or_else(|| CommandOutput::failed(127, format!("no scripted response for: {line}"))))
    }

    async fn exists(&self, program: &str) -> bool {
        self.script().programs.contains(program)
    }
}

#[derive(Default)]
struct FakeState {
    clusters: BTreeMap<String, Cluster>,
    calls: Vec<String>,
    fail_create: Option<String>,
    fail_auth: Option<String>,
    polls_until_running: u32,
    not_found_polls: u32,
    quota: Option<QuotaReport>,
}

/// In-memory provider with scriptable failures and provisioning delays.
pub struct FakeProvider {
    name: String,
    endpoint: Option<String>,
    kubeconfig: String,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    /// Provider reporting `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: None,
            kubeconfig: format!("apiVersion: v1\nkind: Config\ncurrent-context: {name}\n"),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every `create_cluster` with `message`.
    #[must_use]
    pub fn with_failing_create(self, message: &str) -> Self {
        self.state().fail_create = Some(message.to_string());
        self
    }

    /// Reject credentials with `message`.
    #[must_use]
    pub fn with_failing_auth(self, message: &str) -> Self {
        self.state().fail_auth = Some(message.to_string());
        self
    }

    /// Report `creating` for the first `polls` reads after creation.
    #[must_use]
    pub fn with_polls_until_running(self, polls: u32) -> Self {
        self.state().polls_until_running = polls;
        self
    }

    /// Report `NotFound` for the first `polls` reads.
    #[must_use]
    pub fn with_not_found_polls(self, polls: u32) -> Self {
        self.state().not_found_polls = polls;
        self
    }

    /// Answer quota checks with `report`.
    #[must_use]
    pub fn with_quota(self, report: QuotaReport) -> Self {
        self.state().quota = Some(report);
        self
    }

    /// Advertise `endpoint` for network checks.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    /// Pre-populate a running cluster.
    pub fn insert(&self, cluster: Cluster) {
        self.state().clusters.insert(cluster.id.clone(), cluster);
    }

    /// Operation names invoked so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: &str) {
        self.state().calls.push(call.to_string());
    }
}

#[async_trait]
impl QuotaChecker for FakeProvider {
    async fn check_quotas(&self, _spec: &ClusterSpec) -> Result<QuotaReport, ProviderError> {
        self.record("check_quotas");
        Ok(self.state().quota.clone().unwrap_or_default())
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn api_endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn quotas(&self) -> &dyn QuotaChecker {
        self
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        self.record("authenticate");
        match self.state().fail_auth.clone() {
            Some(message) => Err(ProviderError::Auth(message)),
            None => Ok(()),
        }
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        self.record("validate_permissions");
        Ok(())
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(&self.name, spec)?;
        self.record("create_cluster");
        let mut state = self.state();
        if let Some(message) = state.fail_create.clone() {
            return Err(ProviderError::Api {
                status: 500,
                message,
            });
        }
        let mut cluster = Cluster::new(&self.name, spec);
        if state.polls_until_running == 0 {
            cluster.transition(ClusterStatus::Running);
        }
        state.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        self.record("delete_cluster");
        self.state()
            .clusters
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        self.record("update_cluster");
        let mut state = self.state();
        let cluster = state
            .clusters
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        cluster.tags.extend(spec.tags.clone());
        Ok(cluster.clone())
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        self.record("get_cluster");
        let mut state = self.state();
        if state.not_found_polls > 0 {
            state.not_found_polls -= 1;
            return Err(ProviderError::NotFound(id.to_string()));
        }
        let pending = state.polls_until_running;
        let cluster = state
            .clusters
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if cluster.status == ClusterStatus::Creating {
            if pending <= 1 {
                cluster.transition(ClusterStatus::Running);
            }
            let snapshot = cluster.clone();
            state.polls_until_running = pending.saturating_sub(1);
            return Ok(snapshot);
        }
        Ok(cluster.clone())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        self.record("list_clusters");
        Ok(self.state().clusters.values().cloned().collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        self.record("get_kubeconfig");
        if self.state().clusters.contains_key(id) {
            Ok(self.kubeconfig.clone())
        } else {
            Err(ProviderError::NotFound(id.to_string()))
        }
    }

    async fn estimate_cost(&self, _spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(CostEstimate {
            currency: "USD".to_string(),
            hourly: 0.0,
            monthly: 0.0,
            items: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let runner = ScriptedRunner::new();
        runner.respond("kind", CommandOutput::ok("generic"));
        runner.respond("kind get clusters", CommandOutput::ok("specific"));

        let out = runner
            .run(&CommandSpec::new("kind").args(["get", "clusters"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "specific");
        let out = runner.run(&CommandSpec::new("kind").arg("version")).await.unwrap();
        assert_eq!(out.stdout, "generic");
        let out = runner.run(&CommandSpec::new("helm")).await.unwrap();
        assert_eq!(out.code, Some(127));
        assert_eq!(runner.call_count("kind"), 2);
    }

    #[tokio::test]
    async fn test_fake_provider_becomes_running_after_polls() {
        let provider = FakeProvider::new("fake").with_polls_until_running(2);
        let cluster = provider
            .create_cluster(&ClusterSpec::new("fake", "a"))
            .await
            .unwrap();
        assert_eq!(cluster.status, ClusterStatus::Creating);
        assert_eq!(
            provider.get_cluster(&cluster.id).await.unwrap().status,
            ClusterStatus::Creating
        );
        assert_eq!(
            provider.get_cluster(&cluster.id).await.unwrap().status,
            ClusterStatus::Running
        );
    }
}
