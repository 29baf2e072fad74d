//! Controller configuration via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Pacing configuration for the controller loop, layered from defaults,
/// configuration files, and `STRATUS_`-prefixed environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "STRATUS")]
pub struct ControllerConfig {
    /// Seconds the loop sleeps between reconciliation ticks.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
}

impl ControllerConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, and environment variables in that
    /// order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Interval the loop sleeps between ticks.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Errors raised during configuration loading.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
