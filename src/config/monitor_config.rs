//! Monitoring thresholds parsing from environment variables.

use super::{Lookup, env_lookup, parse_var};
use crate::application::evaluation::crash_analyzer::CRASH_THRESHOLD;
use crate::application::monitoring::model_monitor::MonitorThresholds;
use crate::application::monitoring::risk_monitor::RiskThresholds;
use anyhow::Result;

/// Monitor environment configuration
#[derive(Debug, Clone)]
pub struct MonitorEnvConfig {
    // Model health
    pub max_rmse: f64,
    pub max_prediction_shift: f64,
    pub max_uncertainty: f64,

    // Market risk
    pub volatility_threshold: f64,
    pub drawdown_threshold: f64,
    pub var_threshold: f64,
    pub risk_window_size: usize,

    // Crash analysis
    pub crash_threshold: f64,
    pub crash_lookback: usize,
}

impl MonitorEnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let model = MonitorThresholds::default();
        let risk = RiskThresholds::default();

        Ok(Self {
            max_rmse: parse_var(lookup, "MONITOR_MAX_RMSE", model.base_rmse)?,
            max_prediction_shift: parse_var(lookup, "MONITOR_MAX_PREDICTION_SHIFT", model.prediction_shift)?,
            max_uncertainty: parse_var(lookup, "MONITOR_MAX_UNCERTAINTY", model.uncertainty)?,
            volatility_threshold: parse_var(lookup, "RISK_VOLATILITY_THRESHOLD", risk.volatility)?,
            drawdown_threshold: parse_var(lookup, "RISK_DRAWDOWN_THRESHOLD", risk.drawdown)?,
            var_threshold: parse_var(lookup, "RISK_VAR_THRESHOLD", risk.var)?,
            risk_window_size: parse_var(lookup, "RISK_WINDOW_SIZE", risk.window_size)?,
            crash_threshold: parse_var(lookup, "CRASH_THRESHOLD", CRASH_THRESHOLD)?,
            crash_lookback: parse_var(lookup, "CRASH_LOOKBACK", 20)?,
        })
    }

    pub fn monitor_thresholds(&self) -> MonitorThresholds {
        MonitorThresholds {
            base_rmse: self.max_rmse,
            prediction_shift: self.max_prediction_shift,
            uncertainty: self.max_uncertainty,
        }
    }

    pub fn risk_thresholds(&self) -> RiskThresholds {
        RiskThresholds {
            volatility: self.volatility_threshold,
            drawdown: self.drawdown_threshold,
            var: self.var_threshold,
            window_size: self.risk_window_size,
        }
    }
}
