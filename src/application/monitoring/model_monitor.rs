use crate::domain::errors::ShapeMismatch;
use crate::domain::ml::model_metrics::ModelMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Thresholds for model health checks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorThresholds {
    /// Maximum acceptable RMSE; also bounds the absolute prediction bias
    pub base_rmse: f64,

    /// Maximum std across models of their mean prediction
    pub prediction_shift: f64,

    /// Maximum mean per-model prediction std
    pub uncertainty: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            base_rmse: 0.02,
            prediction_shift: 0.5,
            uncertainty: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthIssue {
    HighError { rmse: f64 },
    PredictionBias { bias: f64 },
    EnsembleDisagreement { value: f64 },
    PredictionUncertainty { value: f64 },
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::HighError { rmse } => write!(f, "High prediction error: {:.4}", rmse),
            HealthIssue::PredictionBias { bias } => {
                write!(f, "Significant prediction bias: {:.4}", bias)
            }
            HealthIssue::EnsembleDisagreement { value } => {
                write!(f, "High ensemble disagreement: {:.4}", value)
            }
            HealthIssue::PredictionUncertainty { value } => {
                write!(f, "High prediction uncertainty: {:.4}", value)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
}

/// One monitoring pass over a batch of predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringUpdate {
    pub timestamp: DateTime<Utc>,
    pub metrics: ModelMetrics,
    pub issues: Vec<HealthIssue>,
    pub status: HealthStatus,
    pub needs_retraining: bool,
}

/// Tracks prediction quality over time and flags degraded models.
#[derive(Debug, Clone, Default)]
pub struct ModelMonitor {
    thresholds: MonitorThresholds,
    history: Vec<MonitoringUpdate>,
}

impl ModelMonitor {
    /// More issues than this triggers a retraining recommendation.
    pub const RETRAIN_ISSUE_COUNT: usize = 2;

    pub fn new(thresholds: MonitorThresholds) -> Self {
        Self {
            thresholds,
            history: Vec::new(),
        }
    }

    pub fn thresholds(&self) -> &MonitorThresholds {
        &self.thresholds
    }

    pub fn history(&self) -> &[MonitoringUpdate] {
        &self.history
    }

    /// Sign-based hit rate, suited to return series.
    pub fn calculate_model_metrics(
        &self,
        predictions: &[f64],
        actuals: &[f64],
        per_model: Option<&[Vec<f64>]>,
    ) -> Result<ModelMetrics, ShapeMismatch> {
        ModelMetrics::calculate(predictions, actuals, None, per_model)
    }

    pub fn check_model_health(&self, metrics: &ModelMetrics) -> Vec<HealthIssue> {
        let mut issues = Vec::new();
        let t = &self.thresholds;

        if metrics.rmse > t.base_rmse {
            issues.push(HealthIssue::HighError { rmse: metrics.rmse });
        }
        if metrics.prediction_bias.abs() > t.base_rmse {
            issues.push(HealthIssue::PredictionBias {
                bias: metrics.prediction_bias,
            });
        }
        if let Some(value) = metrics.ensemble_disagreement.filter(|v| *v > t.prediction_shift) {
            issues.push(HealthIssue::EnsembleDisagreement { value });
        }
        if let Some(value) = metrics.ensemble_uncertainty.filter(|v| *v > t.uncertainty) {
            issues.push(HealthIssue::PredictionUncertainty { value });
        }
        issues
    }

    /// Computes metrics, checks health and appends the result to the history.
    pub fn update_monitoring(
        &mut self,
        predictions: &[f64],
        actuals: &[f64],
        per_model: Option<&[Vec<f64>]>,
        timestamp: DateTime<Utc>,
    ) -> Result<MonitoringUpdate, ShapeMismatch> {
        let metrics = self.calculate_model_metrics(predictions, actuals, per_model)?;
        let issues = self.check_model_health(&metrics);
        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };
        let needs_retraining = issues.len() > Self::RETRAIN_ISSUE_COUNT;

        if issues.is_empty() {
            info!("ModelMonitor: healthy (rmse {:.4}, hit rate {:.2})", metrics.rmse, metrics.hit_rate);
        } else {
            for issue in &issues {
                warn!("ModelMonitor: {}", issue);
            }
        }
        if needs_retraining {
            warn!("ModelMonitor: {} issues detected, retraining recommended", issues.len());
        }

        let update = MonitoringUpdate {
            timestamp,
            metrics,
            issues,
            status,
            needs_retraining,
        };
        self.history.push(update.clone());
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accurate_predictions_are_healthy() {
        let mut monitor = ModelMonitor::default();
        let update = monitor
            .update_monitoring(&[0.01, -0.02, 0.015], &[0.012, -0.018, 0.014], None, Utc::now())
            .unwrap();
        assert_eq!(update.status, HealthStatus::Healthy);
        assert!(!update.needs_retraining);
        assert_eq!(update.metrics.hit_rate, 1.0);
        assert_eq!(monitor.history().len(), 1);
    }

    #[test]
    fn test_poor_ensemble_needs_retraining() {
        let mut monitor = ModelMonitor::default();
        let per_model = vec![vec![0.0, 0.1], vec![3.0, 7.0]];
        let update = monitor
            .update_monitoring(&[1.0, 2.0], &[0.0, 0.0], Some(per_model.as_slice()), Utc::now())
            .unwrap();
        assert_eq!(update.status, HealthStatus::Warning);
        // error, bias and disagreement; uncertainty stays under 2.0
        assert_eq!(update.issues.len(), 3);
        assert!(update.needs_retraining);
    }

    #[test]
    fn test_issue_messages() {
        let issue = HealthIssue::HighError { rmse: 0.05 };
        assert_eq!(issue.to_string(), "High prediction error: 0.0500");
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let monitor = ModelMonitor::default();
        assert!(monitor.calculate_model_metrics(&[1.0], &[1.0, 2.0], None).is_err());
    }
}
