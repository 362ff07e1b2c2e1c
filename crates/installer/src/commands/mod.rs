//! CLI subcommands.

pub mod down;
pub mod get;
pub mod kubeconfig;
pub mod up;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::PlatformConfig;

/// Environment variable consulted when `--config` is not given.
pub const CONFIG_ENV: &str = "ADHAR_CONFIG";

/// Load and parse the platform file at `path`.
pub(crate) fn load_config(path: &Path) -> Result<PlatformConfig> {
    PlatformConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}
