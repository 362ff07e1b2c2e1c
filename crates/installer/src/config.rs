//! Declarative platform configuration.
//!
//! The YAML file has four top-level sections: `globalSettings`,
//! `providers`, `environmentTemplates` and `environments`. An environment
//! references a template and overrides it; [`PlatformConfig::resolve`]
//! merges the two into a [`ResolvedEnvironment`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use adhar_cloud::providers::{AddonSpec, ChartRef, ClusterSpec, DomainSpec, NodeGroupSpec};
use adhar_cloud::ProviderConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Default base domain for local platforms.
pub const DEFAULT_DOMAIN: &str = "adhar.localtest.me";

/// Tag recording which environment a cluster belongs to.
pub const ENVIRONMENT_TAG: &str = "adhar.io/environment";

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env reference pattern")
});

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?\d+\.\d+(\.\d+)?([-+][0-9A-Za-z.-]+)?$").expect("valid version pattern")
});

/// Configuration errors. All are fatal and never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File is not valid YAML for the schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// More than two providers configured.
    #[error("at most two providers may be configured, found {0}")]
    TooManyProviders(usize),

    /// Two providers but none marked primary.
    #[error("with two providers exactly one must be marked primary, none is")]
    NoPrimary,

    /// Two providers both marked primary.
    #[error("with two providers exactly one must be marked primary, both are")]
    MultiplePrimaries,

    /// Environment name not present.
    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    /// Environment references a missing template.
    #[error("environment '{environment}' references unknown template '{template}'")]
    UnknownTemplate {
        /// Environment name.
        environment: String,
        /// Template name.
        template: String,
    },

    /// Environment references a missing provider.
    #[error("environment '{environment}' references unknown provider '{provider}'")]
    UnknownProvider {
        /// Environment name.
        environment: String,
        /// Provider name.
        provider: String,
    },

    /// Required field absent after merging.
    #[error("environment '{environment}' is missing '{field}'")]
    MissingField {
        /// Environment name.
        environment: String,
        /// Field name.
        field: &'static str,
    },

    /// Core service version is malformed.
    #[error("environment '{environment}': {service} version '{version}' is not a valid version")]
    InvalidVersion {
        /// Environment name.
        environment: String,
        /// Service name.
        service: &'static str,
        /// Offending value.
        version: String,
    },

    /// `${VAR}` reference to an unset variable.
    #[error("environment variable {0} referenced in provider settings is not set")]
    MissingEnvVar(String),
}

/// Production or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentType {
    /// Production environment.
    Production,
    /// Anything else.
    #[default]
    NonProduction,
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::NonProduction => write!(f, "non-production"),
        }
    }
}

/// Git server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitSettings {
    /// Organisation owning the platform repositories.
    pub organization: String,
    /// Admin user.
    pub admin_user: String,
    /// Admin password. Generated when absent.
    pub admin_password: Option<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            organization: "adhar".to_string(),
            admin_user: "gitea_admin".to_string(),
            admin_password: None,
        }
    }
}

/// Settings shared by every environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    /// Base domain.
    pub domain: String,
    /// Host port for ingress HTTP on local clusters.
    pub http_port: u16,
    /// Host port for ingress HTTPS on local clusters.
    pub https_port: u16,
    /// Highly-available control planes.
    pub enable_ha_mode: bool,
    /// Git server settings.
    pub git: GitSettings,
    /// Directory for generated kubeconfigs.
    pub output_dir: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            http_port: adhar_cloud::providers::kind::DEFAULT_HTTP_PORT,
            https_port: adhar_cloud::providers::kind::DEFAULT_HTTPS_PORT,
            enable_ha_mode: false,
            git: GitSettings::default(),
            output_dir: None,
        }
    }
}

impl GlobalSettings {
    /// Directory for generated artefacts.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".adhar")
        })
    }
}

/// A configured provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    /// Registry name; defaults to the entry's key.
    #[serde(rename = "type")]
    pub provider_type: Option<String>,
    /// Default region.
    pub region: Option<String>,
    /// Hosts the management cluster.
    #[serde(default)]
    pub primary: bool,
    /// Provider-specific settings (tokens, project ids, ...).
    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

/// A core platform service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Install the service.
    pub enabled: bool,
    /// Chart version.
    pub version: Option<String>,
    /// Helm values.
    pub values: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            version: None,
            values: BTreeMap::new(),
        }
    }
}

/// The core service set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreServices {
    /// GitOps controller.
    pub argocd: Option<ServiceConfig>,
    /// Git server.
    pub gitea: Option<ServiceConfig>,
    /// Ingress controller.
    pub nginx: Option<ServiceConfig>,
    /// CNI.
    pub cilium: Option<ServiceConfig>,
}

impl CoreServices {
    fn merged_over(&self, base: &Self) -> Self {
        Self {
            argocd: self.argocd.clone().or_else(|| base.argocd.clone()),
            gitea: self.gitea.clone().or_else(|| base.gitea.clone()),
            nginx: self.nginx.clone().or_else(|| base.nginx.clone()),
            cilium: self.cilium.clone().or_else(|| base.cilium.clone()),
        }
    }

    fn entries(&self) -> [(&'static str, Option<&ServiceConfig>); 4] {
        [
            ("argocd", self.argocd.as_ref()),
            ("gitea", self.gitea.as_ref()),
            ("nginx", self.nginx.as_ref()),
            ("cilium", self.cilium.as_ref()),
        ]
    }

    /// Whether `service` is enabled (absent services default to enabled).
    #[must_use]
    pub fn is_enabled(&self, service: &str) -> bool {
        self.entries()
            .into_iter()
            .find(|(name, _)| *name == service)
            .and_then(|(_, s)| s)
            .is_none_or(|s| s.enabled)
    }

    /// Enabled services as "name" or "name version".
    #[must_use]
    pub fn enabled_summary(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(name, _)| self.is_enabled(name))
            .map(|(name, _)| match self.version(name) {
                Some(v) => format!("{name} {v}"),
                None => name.to_string(),
            })
            .collect()
    }

    /// Configured version of `service`.
    #[must_use]
    pub fn version(&self, service: &str) -> Option<&str> {
        self.entries()
            .into_iter()
            .find(|(name, _)| *name == service)
            .and_then(|(_, s)| s)
            .and_then(|s| s.version.as_deref())
    }
}

/// An addon chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonConfig {
    /// Release name.
    pub name: String,
    /// Chart name; defaults to the release name.
    pub chart: Option<String>,
    /// Chart repository URL.
    pub repo: String,
    /// Chart version.
    pub version: Option<String>,
    /// Target namespace; defaults to the release name.
    pub namespace: Option<String>,
    /// Helm values.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl AddonConfig {
    /// Provider-level addon request.
    #[must_use]
    pub fn to_spec(&self) -> AddonSpec {
        AddonSpec {
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_else(|| self.name.clone()),
            chart: ChartRef {
                repo: self.repo.clone(),
                name: self.chart.clone().unwrap_or_else(|| self.name.clone()),
                version: self.version.clone(),
            },
            values: self.values.clone(),
        }
    }
}

/// Defaults shared by environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentTemplate {
    /// Environment type.
    #[serde(rename = "type")]
    pub env_type: Option<EnvironmentType>,
    /// Provider key.
    pub provider: Option<String>,
    /// Region.
    pub region: Option<String>,
    /// Cluster key/value settings.
    pub cluster_config: BTreeMap<String, Value>,
    /// Core services.
    pub core_services: CoreServices,
    /// Addons.
    pub addons: Vec<AddonConfig>,
}

/// One deployment target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentConfig {
    /// Template to merge over.
    pub template: Option<String>,
    /// Environment type.
    #[serde(rename = "type")]
    pub env_type: Option<EnvironmentType>,
    /// Provider key.
    pub provider: Option<String>,
    /// Region.
    pub region: Option<String>,
    /// Cluster key/value settings; override the template's per key.
    pub cluster_config: BTreeMap<String, Value>,
    /// Core services; override the template's per service.
    pub core_services: CoreServices,
    /// Addons; replace the template's when non-empty.
    pub addons: Vec<AddonConfig>,
}

/// The whole file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    /// Shared settings.
    pub global_settings: GlobalSettings,
    /// Providers by key.
    pub providers: BTreeMap<String, ProviderEntry>,
    /// Templates by name.
    pub environment_templates: BTreeMap<String, EnvironmentTemplate>,
    /// Environments by name.
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl PlatformConfig {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Key of the provider hosting the management cluster.
    ///
    /// A lone provider is implicitly primary.
    #[must_use]
    pub fn primary_provider(&self) -> Option<&str> {
        if self.providers.len() == 1 {
            return self.providers.keys().next().map(String::as_str);
        }
        let mut primaries = self.providers.iter().filter(|(_, p)| p.primary);
        match (primaries.next(), primaries.next()) {
            (Some((name, _)), None) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Check the provider-count and primary-designation rules.
    ///
    /// # Errors
    ///
    /// Returns the first rule violated.
    pub fn validate_providers(&self) -> Result<(), ConfigError> {
        match self.providers.len() {
            0 | 1 => Ok(()),
            2 => match self.providers.values().filter(|p| p.primary).count() {
                0 => Err(ConfigError::NoPrimary),
                1 => Ok(()),
                _ => Err(ConfigError::MultiplePrimaries),
            },
            n => Err(ConfigError::TooManyProviders(n)),
        }
    }

    /// Every problem in the file, in a stable order.
    #[must_use]
    pub fn problems(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        if let Err(e) = self.validate_providers() {
            problems.push(e);
        }
        for name in self.environments.keys() {
            if let Err(e) = self.merge(name).and_then(|m| m.check()) {
                problems.push(e);
            }
        }
        problems
    }

    /// Validate the whole file.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.problems().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Merge environment `name` over its template and resolve provider
    /// settings, expanding `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] affecting this environment.
    pub fn resolve(&self, name: &str) -> Result<ResolvedEnvironment, ConfigError> {
        self.validate_providers()?;
        let merged = self.merge(name)?;
        merged.check()?;

        let provider_key = merged.provider.clone().unwrap_or_default();
        let (provider_type, mut provider_config) = self.provider_settings(&provider_key)?;
        let region = merged.region.clone().unwrap_or_default();
        if !region.is_empty() {
            provider_config.insert("region".to_string(), Value::String(region.clone()));
        }

        Ok(ResolvedEnvironment {
            name: name.to_string(),
            provider_key,
            provider_type,
            region,
            env_type: merged.env_type,
            cluster_config: merged.cluster_config,
            core_services: merged.core_services,
            addons: merged.addons,
            global: self.global_settings.clone(),
            provider_config,
        })
    }

    /// Registry name and constructor settings of provider entry `key`,
    /// with `${VAR}` references expanded.
    ///
    /// # Errors
    ///
    /// Unknown keys and unset variables.
    pub fn provider_settings(&self, key: &str) -> Result<(String, ProviderConfig), ConfigError> {
        let entry = self
            .providers
            .get(key)
            .ok_or_else(|| ConfigError::UnknownProvider {
                environment: String::new(),
                provider: key.to_string(),
            })?;
        let provider_type = entry.provider_type.clone().unwrap_or_else(|| key.to_string());
        let mut config = ProviderConfig::new();
        for (name, value) in &entry.settings {
            config.insert(name.clone(), expand_env(value)?);
        }
        if let Some(region) = &entry.region {
            config.insert("region".to_string(), Value::String(region.clone()));
        }
        Ok((provider_type, config))
    }

    fn merge(&self, name: &str) -> Result<Merged, ConfigError> {
        let env = self
            .environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))?;

        let template = match &env.template {
            Some(t) => Some(self.environment_templates.get(t).ok_or_else(|| {
                ConfigError::UnknownTemplate {
                    environment: name.to_string(),
                    template: t.clone(),
                }
            })?),
            None => None,
        };
        let base = template.cloned().unwrap_or_default();

        let mut cluster_config = base.cluster_config.clone();
        cluster_config.extend(env.cluster_config.clone());

        let provider = env.provider.clone().or(base.provider.clone());
        if let Some(p) = &provider {
            if !self.providers.contains_key(p) {
                return Err(ConfigError::UnknownProvider {
                    environment: name.to_string(),
                    provider: p.clone(),
                });
            }
        }

        let region = env.region.clone().or(base.region.clone()).or_else(|| {
            provider
                .as_ref()
                .and_then(|p| self.providers.get(p))
                .and_then(|p| p.region.clone())
        });

        Ok(Merged {
            name: name.to_string(),
            env_type: env.env_type.or(base.env_type).unwrap_or_default(),
            provider,
            region,
            cluster_config,
            core_services: env.core_services.merged_over(&base.core_services),
            addons: if env.addons.is_empty() {
                base.addons
            } else {
                env.addons.clone()
            },
        })
    }
}

/// Template and environment merged, before provider resolution.
struct Merged {
    name: String,
    env_type: EnvironmentType,
    provider: Option<String>,
    region: Option<String>,
    cluster_config: BTreeMap<String, Value>,
    core_services: CoreServices,
    addons: Vec<AddonConfig>,
}

impl Merged {
    fn check(&self) -> Result<(), ConfigError> {
        let missing = |field| ConfigError::MissingField {
            environment: self.name.clone(),
            field,
        };
        if self.provider.is_none() {
            return Err(missing("provider"));
        }
        if self.region.as_deref().is_none_or(str::is_empty) {
            return Err(missing("region"));
        }
        if self.cluster_config.is_empty() {
            return Err(missing("clusterConfig"));
        }
        for (service, config) in self.core_services.entries() {
            if let Some(version) = config.and_then(|c| c.version.as_deref()) {
                if !VERSION.is_match(version) {
                    return Err(ConfigError::InvalidVersion {
                        environment: self.name.clone(),
                        service,
                        version: version.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Expand `${VAR}` references inside string values.
fn expand_env(value: &Value) -> Result<Value, ConfigError> {
    Ok(match value {
        Value::String(s) => {
            let mut missing = None;
            let expanded = ENV_REF.replace_all(s, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[1]).unwrap_or_else(|_| {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    String::new()
                })
            });
            if let Some(var) = missing {
                return Err(ConfigError::MissingEnvVar(var));
            }
            Value::String(expanded.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(expand_env).collect::<Result<_, _>>()?),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), expand_env(v)?)))
                .collect::<Result<_, ConfigError>>()?,
        ),
        other => other.clone(),
    })
}

/// A fully merged environment, read-only after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEnvironment {
    /// Environment name.
    pub name: String,
    /// Key of the provider entry.
    pub provider_key: String,
    /// Registry name of the provider.
    pub provider_type: String,
    /// Region.
    pub region: String,
    /// Environment type.
    pub env_type: EnvironmentType,
    /// Merged cluster settings.
    pub cluster_config: BTreeMap<String, Value>,
    /// Merged core services.
    pub core_services: CoreServices,
    /// Addons.
    pub addons: Vec<AddonConfig>,
    /// Global settings snapshot.
    pub global: GlobalSettings,
    /// Configuration handed to the provider constructor.
    pub provider_config: ProviderConfig,
}

impl ResolvedEnvironment {
    fn setting_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| match self.cluster_config.get(*k)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    fn setting_u32(&self, key: &str) -> Option<u32> {
        match self.cluster_config.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn setting_bool(&self, key: &str) -> Option<bool> {
        match self.cluster_config.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Cluster name: `clusterConfig.name`, else the environment name.
    #[must_use]
    pub fn cluster_name(&self) -> String {
        self.setting_str(&["name", "clusterName"])
            .unwrap_or_else(|| self.name.clone())
    }

    /// Desired cluster for the provider.
    #[must_use]
    pub fn cluster_spec(&self) -> ClusterSpec {
        let mut spec = ClusterSpec::new(self.provider_type.clone(), self.cluster_name());
        spec.region.clone_from(&self.region);
        if let Some(version) = self.setting_str(&["version", "kubernetesVersion"]) {
            spec.version = version;
        }

        let min = self.setting_u32("minNodes");
        let max = self.setting_u32("maxNodes");
        let replicas = self
            .setting_u32("nodeCount")
            .or(min)
            .unwrap_or(1);
        spec.node_groups = vec![NodeGroupSpec {
            name: "default".to_string(),
            replicas,
            instance_type: self
                .setting_str(&["nodeSize", "instanceType", "machineType"])
                .unwrap_or_default(),
            min_size: min,
            max_size: max,
            ..NodeGroupSpec::default()
        }];

        let ha = self
            .setting_bool("highAvailability")
            .unwrap_or(self.global.enable_ha_mode || self.env_type == EnvironmentType::Production);
        spec.control_plane.high_availability = ha;
        spec.control_plane.replicas = if ha { 3 } else { 1 };

        spec.networking.cni = if self.core_services.is_enabled("cilium") {
            "cilium".to_string()
        } else {
            String::new()
        };
        spec.domain = Some(DomainSpec {
            name: self.global.domain.clone(),
            tls: self.env_type == EnvironmentType::Production,
        });
        spec.tags
            .insert(ENVIRONMENT_TAG.to_string(), self.name.clone());
        spec
    }
}
