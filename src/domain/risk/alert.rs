use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertType {
    HighVolatility,
    SevereDrawdown,
    VarBreach,
    ModelDegradation,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertType::HighVolatility => write!(f, "HIGH_VOLATILITY"),
            AlertType::SevereDrawdown => write!(f, "SEVERE_DRAWDOWN"),
            AlertType::VarBreach => write!(f, "VAR_BREACH"),
            AlertType::ModelDegradation => write!(f, "MODEL_DEGRADATION"),
        }
    }
}

/// Rolling market risk snapshot computed from recent prices.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Annualised std of simple returns
    pub volatility: f64,
    /// Last price relative to the rolling maximum, minus one (<= 0)
    pub drawdown: f64,
    /// Annualised 5th percentile of returns
    pub var_95: f64,
    pub current_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub timestamp: DateTime<Utc>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub metrics: RiskMetrics,
}

impl RiskAlert {
    pub fn new(
        timestamp: DateTime<Utc>,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        metrics: RiskMetrics,
    ) -> Self {
        Self {
            timestamp,
            alert_type,
            severity,
            message: message.into(),
            metrics,
        }
    }
}

impl fmt::Display for RiskAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.alert_type, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_display() {
        let alert = RiskAlert::new(
            Utc::now(),
            AlertType::SevereDrawdown,
            Severity::Critical,
            "Drawdown (-12.00%) below threshold (-10.00%)",
            RiskMetrics::default(),
        );
        let text = alert.to_string();
        assert!(text.starts_with("[CRITICAL] SEVERE_DRAWDOWN"));
        assert!(text.contains("-12.00%"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
