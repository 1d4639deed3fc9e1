//! Observability configuration parsing from environment variables.
//!
//! This module handles the push-only metrics outputs.

use super::{Lookup, env_lookup, parse_var};
use anyhow::Result;
use std::path::PathBuf;

/// Observability environment configuration
#[derive(Debug, Clone)]
pub struct ObservabilityEnvConfig {
    pub enabled: bool,
    /// Prometheus text exposition is written here after each phase
    pub textfile_path: Option<PathBuf>,
}

impl Default for ObservabilityEnvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            textfile_path: None,
        }
    }
}

impl ObservabilityEnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        Ok(Self {
            enabled: parse_var(lookup, "OBSERVABILITY_ENABLED", true)?,
            textfile_path: lookup("METRICS_TEXTFILE")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_config_defaults() {
        let config = ObservabilityEnvConfig::from_lookup(&|_| None).unwrap();
        assert!(config.enabled);
        assert!(config.textfile_path.is_none());
    }

    #[test]
    fn test_invalid_bool_is_an_error() {
        let lookup = |key: &str| (key == "OBSERVABILITY_ENABLED").then(|| "maybe".to_string());
        assert!(ObservabilityEnvConfig::from_lookup(&lookup).is_err());
    }
}
