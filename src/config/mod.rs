//! Configuration module for GAF-WGAN.
//!
//! This module provides structured configuration loading from environment variables,
//! organized by concern: Model, Training, Monitor, and Observability.

mod model_config;
mod monitor_config;
mod observability_config;
mod training_config;

pub use model_config::ModelEnvConfig;
pub use monitor_config::MonitorEnvConfig;
pub use observability_config::ObservabilityEnvConfig;
pub use training_config::TrainingEnvConfig;

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Source of raw configuration values, keyed by variable name.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Parses `key` if it is set, otherwise returns `default`.
pub(crate) fn parse_var<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .context(format!("Failed to parse {}", key)),
        None => Ok(default),
    }
}

pub(crate) fn string_var(lookup: Lookup<'_>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: ModelEnvConfig,
    pub training: TrainingEnvConfig,
    pub monitor: MonitorEnvConfig,
    pub observability: ObservabilityEnvConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        Ok(Self {
            model: ModelEnvConfig::from_lookup(lookup).context("Failed to load model config")?,
            training: TrainingEnvConfig::from_lookup(lookup)
                .context("Failed to load training config")?,
            monitor: MonitorEnvConfig::from_lookup(lookup)
                .context("Failed to load monitor config")?,
            observability: ObservabilityEnvConfig::from_lookup(lookup)
                .context("Failed to load observability config")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(&|_| None).expect("Should parse with defaults");
        assert_eq!(config.model.n_models, 10);
        assert_eq!(config.training.epochs, 100);
        assert_eq!(config.monitor.risk_window_size, 20);
        assert!(config.observability.enabled);
    }

    #[test]
    fn test_overrides_are_applied() {
        let lookup = lookup_from(&[("N_MODELS", "3"), ("EPOCHS", " 7 "), ("SYMBOL", "QQQ")]);
        let config = Config::from_lookup(&lookup).unwrap();
        assert_eq!(config.model.n_models, 3);
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.symbol, "QQQ");
    }

    #[test]
    fn test_parse_error_names_the_key() {
        let lookup = lookup_from(&[("WINDOW_SIZE", "sixty")]);
        let err = Config::from_lookup(&lookup).unwrap_err();
        assert!(format!("{:#}", err).contains("WINDOW_SIZE"));
    }
}
