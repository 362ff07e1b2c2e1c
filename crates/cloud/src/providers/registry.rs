//! Provider registry.
//!
//! Maps a provider name to a constructor. Constructors take the raw
//! configuration map so each provider owns its own schema, and must not do
//! any network I/O so they stay cheap to call.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use super::traits::{Provider, ProviderError};
use super::{aws, azure, civo, custom, digitalocean, gcp, kind};

/// Raw provider configuration.
pub type ProviderConfig = HashMap<String, Value>;

/// Builds a provider from its configuration.
pub type ProviderConstructor =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// Name of the always-available local provider.
pub const DEFAULT_PROVIDER: &str = kind::PROVIDER_NAME;

/// Provider registry.
#[derive(Default)]
pub struct ProviderRegistry {
    constructors: RwLock<HashMap<String, ProviderConstructor>>,
    instances: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(kind::PROVIDER_NAME, |c| Ok(Arc::new(kind::Kind::from_config(c)?)));
        registry.register(aws::PROVIDER_NAME, |c| Ok(Arc::new(aws::Aws::from_config(c)?)));
        registry.register(gcp::PROVIDER_NAME, |c| Ok(Arc::new(gcp::Gcp::from_config(c)?)));
        registry.register(azure::PROVIDER_NAME, |c| {
            Ok(Arc::new(azure::Azure::from_config(c)?))
        });
        registry.register(digitalocean::PROVIDER_NAME, |c| {
            Ok(Arc::new(digitalocean::DigitalOcean::from_config(c)?))
        });
        registry.register(civo::PROVIDER_NAME, |c| Ok(Arc::new(civo::Civo::from_config(c)?)));
        registry.register(custom::PROVIDER_NAME, |c| {
            Ok(Arc::new(custom::Custom::from_config(c)?))
        });
        registry
    }

    /// Register a constructor. A later registration for the same name wins
    /// and evicts any instance built by the earlier one.
    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync + 'static,
    {
        let replaced = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(constructor))
            .is_some();
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        debug!(provider = name, replaced, "Registered provider");
    }

    /// Whether a constructor exists for `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Build a fresh provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ProviderNotFound`] for unknown names, or the
    /// constructor's configuration error.
    pub fn create_provider(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::ProviderNotFound(name.to_string()))?;
        constructor(config)
    }

    /// Return the cached provider for `name`, building it on first use.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create_provider`].
    pub fn get_or_create(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        if let Some(existing) = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(existing));
        }

        let provider = self.create_provider(name, config)?;
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(instances.entry(name.to_string()).or_insert(provider)))
    }
}

static GLOBAL: LazyLock<ProviderRegistry> = LazyLock::new(ProviderRegistry::with_builtins);

/// Process-wide registry with the built-in providers.
#[must_use]
pub fn global() -> &'static ProviderRegistry {
    &GLOBAL
}

// ============================================================================
// Config helpers
// ============================================================================

/// Optional string field. Numbers and booleans are stringified.
#[must_use]
pub fn config_string(config: &ProviderConfig, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Required string field.
///
/// # Errors
///
/// Returns [`ProviderError::Config`] when the field is absent or empty.
pub fn required_string(
    config: &ProviderConfig,
    provider: &str,
    key: &str,
) -> Result<String, ProviderError> {
    config_string(config, key)
        .ok_or_else(|| ProviderError::Config(format!("{provider}: '{key}' is required")))
}
