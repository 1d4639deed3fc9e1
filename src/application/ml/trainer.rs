use super::wgan::GafWgan;
use crate::domain::errors::{ShapeMismatch, TrainingError};
use crate::domain::ports::BatchSource;
use crate::infrastructure::observability::Metrics;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked between training iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-epoch training summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub d_loss: f64,
    /// Mean over the iterations that stepped the generator
    pub g_loss: f64,
    pub gradient_penalty: f64,
    /// Generator MSE on the validation source, normalized frame
    pub val_mse: Option<f64>,
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub model_index: usize,
    pub epochs: Vec<EpochReport>,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochReport> {
        self.epochs.last()
    }
}

/// Runs epochs of WGAN-GP steps over a [`BatchSource`].
#[derive(Clone, Default)]
pub struct GafWganTrainer {
    model_index: usize,
    metrics: Option<Metrics>,
}

impl GafWganTrainer {
    pub fn new(model_index: usize) -> Self {
        Self {
            model_index,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn model_index(&self) -> usize {
        self.model_index
    }

    /// Trains `model` for `epochs` epochs.
    ///
    /// Steps already applied stay applied when an error or a cancellation stops
    /// the run.
    pub fn train(
        &self,
        model: &mut GafWgan,
        train: &dyn BatchSource,
        validation: Option<&dyn BatchSource>,
        epochs: usize,
        cancel: &CancelToken,
    ) -> Result<TrainingReport, TrainingError> {
        let expected = train.shape();
        let mut report = TrainingReport {
            model_index: self.model_index,
            epochs: Vec::with_capacity(epochs),
        };

        for epoch in 0..epochs {
            model.set_epoch(epoch);
            let mut d_losses = Vec::new();
            let mut g_losses = Vec::new();
            let mut penalties = Vec::new();

            for batch in train.batches(epoch) {
                if cancel.is_cancelled() {
                    warn!(model = self.model_index, epoch, "Training cancelled");
                    return Err(TrainingError::Cancelled { epoch });
                }
                if batch.shape() != expected {
                    return Err(ShapeMismatch::new(
                        "training batch",
                        &expected.dims(),
                        &batch.shape().dims(),
                    )
                    .into());
                }

                let losses = model.train_step(&batch).inspect_err(|e| {
                    if let (Some(metrics), TrainingError::Diverged { phase, .. }) = (&self.metrics, e) {
                        metrics.inc_divergence(self.model_index, &phase.to_string());
                    }
                })?;
                d_losses.push(losses.d_loss);
                penalties.push(losses.gradient_penalty);
                if let Some(g) = losses.g_loss {
                    g_losses.push(g);
                }
                debug!(
                    model = self.model_index,
                    iteration = model.iteration(),
                    d_loss = losses.d_loss,
                    w_estimate = losses.wasserstein_estimate,
                    "WGAN-GP step"
                );
            }

            if d_losses.is_empty() {
                return Err(TrainingError::EmptyDataset);
            }

            let val_mse = match validation {
                Some(source) => Some(validation_mse(model, source)?),
                None => None,
            };

            let epoch_report = EpochReport {
                epoch,
                d_loss: d_losses.iter().mean(),
                g_loss: if g_losses.is_empty() { 0.0 } else { g_losses.iter().mean() },
                gradient_penalty: penalties.iter().mean(),
                val_mse,
                batches: d_losses.len(),
            };

            info!(
                model = self.model_index,
                epoch,
                d_loss = epoch_report.d_loss,
                g_loss = epoch_report.g_loss,
                val_mse = ?epoch_report.val_mse,
                "Epoch complete"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_epoch(
                    self.model_index,
                    epoch_report.d_loss,
                    epoch_report.g_loss,
                    epoch_report.gradient_penalty,
                    epoch_report.val_mse,
                );
            }
            report.epochs.push(epoch_report);
        }

        Ok(report)
    }
}

/// Sample-weighted generator MSE over every batch of `source` (epoch 0 order).
pub fn validation_mse(model: &GafWgan, source: &dyn BatchSource) -> Result<f64, ShapeMismatch> {
    let mut total = 0.0;
    let mut count = 0usize;
    for batch in source.batches(0) {
        total += model.batch_mse(&batch)? * batch.len() as f64;
        count += batch.len();
    }
    Ok(if count == 0 { f64::NAN } else { total / count as f64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ml::gaf::WindowScale;
    use crate::domain::ml::model_config::{DiscriminatorConfig, EnsembleConfig, GeneratorConfig};
    use crate::domain::ml::dataset::GafDataset;
    use crate::domain::ml::sample::{BatchShape, SequenceSample};
    use ndarray::{Array1, Array3};

    fn config() -> EnsembleConfig {
        EnsembleConfig {
            n_models: 1,
            window_size: 5,
            sequence_length: 2,
            generator: GeneratorConfig {
                hidden_channels: 2,
                kernel_size: 3,
                dense_units: vec![6],
                latent_dim: 2,
            },
            discriminator: DiscriminatorConfig {
                sequence_len: 4,
                channels: 3,
                hidden_units: 5,
                ..DiscriminatorConfig::default()
            },
            ..EnsembleConfig::default()
        }
    }

    fn shape() -> BatchShape {
        BatchShape {
            seq_len: 2,
            frame_size: 5,
            history_len: 3,
        }
    }

    fn dataset(len: usize) -> GafDataset {
        let samples = (0..len)
            .map(|i| SequenceSample {
                frames: Array3::from_shape_fn((2, 5, 5), |(t, a, b)| {
                    ((i + t) as f64 * 0.2 + (a * b) as f64 * 0.1).cos()
                }),
                history: Array1::from(vec![-0.4, 0.0, 0.3 + 0.01 * i as f64]),
                target: 0.5,
                scale: WindowScale { min: 10.0, max: 20.0 },
                anchor: 16.5,
                target_price: 17.5,
                target_index: i,
            })
            .collect();
        GafDataset::new(samples, shape()).with_batch_size(2)
    }

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reports_every_epoch() {
        let mut model = GafWgan::from_config(&config(), shape(), 1);
        let train = dataset(4);
        let validation = dataset(2).with_shuffle(false);
        let report = GafWganTrainer::new(3)
            .train(&mut model, &train, Some(&validation as &dyn BatchSource), 2, &CancelToken::new())
            .unwrap();
        assert_eq!(report.model_index, 3);
        assert_eq!(report.epochs.len(), 2);
        for epoch in &report.epochs {
            assert_eq!(epoch.batches, 2);
            assert!(epoch.d_loss.is_finite());
            assert!(epoch.val_mse.is_some_and(f64::is_finite));
        }
        assert_eq!(model.iteration(), 4);
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let mut model = GafWgan::from_config(&config(), shape(), 2);
        let result = GafWganTrainer::new(0).train(&mut model, &dataset(0), None, 1, &CancelToken::new());
        assert_eq!(result.unwrap_err(), TrainingError::EmptyDataset);
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let mut model = GafWgan::from_config(&config(), shape(), 3);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = GafWganTrainer::new(0).train(&mut model, &dataset(4), None, 3, &cancel);
        assert_eq!(result.unwrap_err(), TrainingError::Cancelled { epoch: 0 });
        assert_eq!(model.iteration(), 0);
    }

    #[test]
    fn test_metrics_receive_epoch_gauges() {
        let metrics = Metrics::new().unwrap();
        let mut model = GafWgan::from_config(&config(), shape(), 4);
        GafWganTrainer::new(7)
            .with_metrics(Some(metrics.clone()))
            .train(&mut model, &dataset(2), None, 1, &CancelToken::new())
            .unwrap();
        assert!(metrics.render().contains("gafwgan_discriminator_loss{model=\"7\"}"));
    }
}
