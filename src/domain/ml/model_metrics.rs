use crate::domain::errors::ShapeMismatch;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Prediction quality of a model or ensemble over a labelled set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub rmse: f64,
    /// Mean of `prediction - actual`
    pub prediction_bias: f64,
    /// Fraction of samples whose predicted direction matches the realised one
    pub hit_rate: f64,
    /// Std across models of each model's mean prediction
    pub ensemble_disagreement: Option<f64>,
    /// Mean across models of each model's prediction std
    pub ensemble_uncertainty: Option<f64>,
    pub samples: usize,
}

impl ModelMetrics {
    /// Computes metrics for `predictions` against `actuals`.
    ///
    /// With `anchors` (the last observed price per sample) the hit rate compares
    /// predicted and realised moves away from the anchor; without them it compares
    /// the signs of the raw values, which suits return series.
    /// `per_model` holds one prediction vector per base model.
    pub fn calculate(
        predictions: &[f64],
        actuals: &[f64],
        anchors: Option<&[f64]>,
        per_model: Option<&[Vec<f64>]>,
    ) -> Result<Self, ShapeMismatch> {
        let n = predictions.len();
        if actuals.len() != n {
            return Err(ShapeMismatch::new("metrics actuals", &[n], &[actuals.len()]));
        }
        if let Some(anchors) = anchors {
            if anchors.len() != n {
                return Err(ShapeMismatch::new("metrics anchors", &[n], &[anchors.len()]));
            }
        }
        if n == 0 {
            return Ok(Self::default());
        }

        let errors: Vec<f64> = predictions.iter().zip(actuals).map(|(p, a)| p - a).collect();
        let rmse = errors.iter().map(|e| e * e).mean().sqrt();
        let prediction_bias = errors.iter().mean();

        let hits = match anchors {
            Some(anchors) => predictions
                .iter()
                .zip(actuals)
                .zip(anchors)
                .filter(|((p, a), anchor)| (*p - *anchor).signum() == (*a - *anchor).signum())
                .count(),
            None => predictions
                .iter()
                .zip(actuals)
                .filter(|(p, a)| p.signum() == a.signum())
                .count(),
        };

        let (ensemble_disagreement, ensemble_uncertainty) = match per_model {
            Some(models) if !models.is_empty() => {
                let means: Vec<f64> = models.iter().map(|m| m.iter().mean()).collect();
                let stds: Vec<f64> = models.iter().map(|m| m.iter().population_std_dev()).collect();
                (Some(means.iter().population_std_dev()), Some(stds.iter().mean()))
            }
            _ => (None, None),
        };

        Ok(Self {
            rmse,
            prediction_bias,
            hit_rate: hits as f64 / n as f64,
            ensemble_disagreement,
            ensemble_uncertainty,
            samples: n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let values = [1.0, -2.0, 3.0];
        let metrics = ModelMetrics::calculate(&values, &values, None, None).unwrap();
        assert_eq!(metrics.rmse, 0.0);
        assert_eq!(metrics.prediction_bias, 0.0);
        assert_eq!(metrics.hit_rate, 1.0);
        assert!(metrics.ensemble_disagreement.is_none());
    }

    #[test]
    fn test_bias_and_rmse() {
        let metrics = ModelMetrics::calculate(&[2.0, 4.0], &[1.0, 3.0], None, None).unwrap();
        assert!((metrics.rmse - 1.0).abs() < 1e-12);
        assert!((metrics.prediction_bias - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_hit_rate_against_anchor() {
        // Sample 0: predicted up, went up. Sample 1: predicted up, went down.
        let metrics =
            ModelMetrics::calculate(&[101.0, 102.0], &[103.0, 98.0], Some([100.0, 100.0].as_slice()), None)
                .unwrap();
        assert_eq!(metrics.hit_rate, 0.5);
    }

    #[test]
    fn test_ensemble_spread() {
        let per_model = vec![vec![1.0, 3.0], vec![3.0, 5.0]];
        let metrics =
            ModelMetrics::calculate(&[2.0, 4.0], &[2.0, 4.0], None, Some(per_model.as_slice())).unwrap();
        // Means 2 and 4 -> population std 1; each model's std is 1.
        assert!((metrics.ensemble_disagreement.unwrap() - 1.0).abs() < 1e-12);
        assert!((metrics.ensemble_uncertainty.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(ModelMetrics::calculate(&[1.0], &[1.0, 2.0], None, None).is_err());
    }
}
