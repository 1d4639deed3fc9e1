//! Ensemble of independently trained GAF-WGAN models stacked by a meta-learner.
//!
//! Training is two-phase: every base model first, then the meta-learner on the
//! frozen generators' validation outputs. Prediction is only available once both
//! phases have succeeded.

use super::meta_learner::MetaLearner;
use super::trainer::{CancelToken, GafWganTrainer, TrainingReport};
use super::wgan::{GafWgan, ModelSnapshot};
use crate::domain::errors::{EnsembleError, ShapeMismatch, TrainingError};
use crate::domain::ml::model_config::EnsembleConfig;
use crate::domain::ml::model_metrics::ModelMetrics;
use crate::domain::ml::sample::{BatchShape, SequenceBatch};
use crate::domain::ports::BatchSource;
use crate::infrastructure::autograd::Var;
use crate::infrastructure::nn::{Adam, AdamConfig, Graph, Module};
use crate::infrastructure::observability::Metrics;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnsemblePhase {
    Untrained,
    BaseTrained,
    Ready,
}

impl EnsemblePhase {
    fn gauge_value(self) -> f64 {
        match self {
            EnsemblePhase::Untrained => 0.0,
            EnsemblePhase::BaseTrained => 1.0,
            EnsemblePhase::Ready => 2.0,
        }
    }
}

impl fmt::Display for EnsemblePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsemblePhase::Untrained => write!(f, "untrained"),
            EnsemblePhase::BaseTrained => write!(f, "base_trained"),
            EnsemblePhase::Ready => write!(f, "ready"),
        }
    }
}

/// Output of [`GafWganEnsemble::predict`] for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    /// Meta-learner output in each sample's window frame
    pub normalized: Vec<f64>,
    /// Meta-learner output in price units
    pub prices: Vec<f64>,
    /// `[model][sample]` base predictions in price units
    pub per_model_prices: Vec<Vec<f64>>,
    /// Per-sample population std of the base price predictions
    pub disagreement: Vec<f64>,
}

impl EnsemblePrediction {
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn mean_disagreement(&self) -> f64 {
        if self.disagreement.is_empty() {
            return 0.0;
        }
        self.disagreement.iter().mean()
    }
}

/// Per-epoch meta-learner losses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaReport {
    pub losses: Vec<f64>,
}

/// Per-sample std across models. `per_model` is `[model][sample]`.
pub fn disagreement(per_model: &[Vec<f64>]) -> Vec<f64> {
    let samples = per_model.first().map_or(0, Vec::len);
    (0..samples)
        .map(|s| per_model.iter().map(|m| m[s]).population_std_dev())
        .map(|std| if std.is_nan() { 0.0 } else { std })
        .collect()
}

fn model_seed(base: u64, index: usize) -> u64 {
    base.wrapping_mul(1_000_003).wrapping_add(index as u64)
}

fn meta_adam(config: &EnsembleConfig) -> Adam {
    let optimizer = config.meta.optimizer;
    Adam::new(AdamConfig {
        learning_rate: optimizer.learning_rate,
        beta1: optimizer.beta1,
        beta2: optimizer.beta2,
        ..AdamConfig::default()
    })
}

pub struct GafWganEnsemble {
    config: EnsembleConfig,
    shape: BatchShape,
    models: Vec<GafWgan>,
    meta: MetaLearner,
    meta_optimizer: Adam,
    meta_rng: StdRng,
    phase: EnsemblePhase,
    latest_metrics: Option<ModelMetrics>,
    metrics: Option<Metrics>,
    cancel: CancelToken,
}

impl GafWganEnsemble {
    /// Fresh, untrained ensemble. `shape` must agree with the config.
    pub fn new(config: EnsembleConfig, shape: BatchShape) -> Result<Self, EnsembleError> {
        Self::check_shape(&config, shape)?;
        let models = (0..config.n_models)
            .map(|i| GafWgan::from_config(&config, shape, model_seed(config.seed, i)))
            .collect();
        let mut init = StdRng::seed_from_u64(model_seed(config.seed, config.n_models));
        let meta = MetaLearner::new(config.n_models, &config.meta, &mut init);
        Ok(Self::assemble(config, shape, models, meta, EnsemblePhase::Untrained))
    }

    /// Rebuilds an ensemble from stored parameters, e.g. a checkpoint.
    pub fn from_parts(
        config: EnsembleConfig,
        shape: BatchShape,
        snapshots: Vec<ModelSnapshot>,
        meta: MetaLearner,
        phase: EnsemblePhase,
    ) -> Result<Self, EnsembleError> {
        Self::check_shape(&config, shape)?;
        if snapshots.len() != config.n_models || meta.n_models() != config.n_models {
            return Err(EnsembleError::InvalidConfig {
                reason: format!(
                    "expected {} models, got {} snapshots and a meta-learner over {}",
                    config.n_models,
                    snapshots.len(),
                    meta.n_models()
                ),
            });
        }
        let models = snapshots
            .into_iter()
            .enumerate()
            .map(|(i, s)| GafWgan::from_snapshot(s, config.wgan.clone(), model_seed(config.seed, i)))
            .collect();
        Ok(Self::assemble(config, shape, models, meta, phase))
    }

    fn assemble(
        config: EnsembleConfig,
        shape: BatchShape,
        models: Vec<GafWgan>,
        meta: MetaLearner,
        phase: EnsemblePhase,
    ) -> Self {
        Self {
            meta_optimizer: meta_adam(&config),
            meta_rng: StdRng::seed_from_u64(config.seed.wrapping_add(u64::MAX / 2)),
            config,
            shape,
            models,
            meta,
            phase,
            latest_metrics: None,
            metrics: None,
            cancel: CancelToken::new(),
        }
    }

    fn check_shape(config: &EnsembleConfig, shape: BatchShape) -> Result<(), EnsembleError> {
        config.validate()?;
        let expected = BatchShape {
            seq_len: config.sequence_length,
            frame_size: config.window_size,
            history_len: config.history_len(),
        };
        if shape != expected {
            return Err(ShapeMismatch::new("ensemble batch shape", &expected.dims(), &shape.dims()).into());
        }
        Ok(())
    }

    fn check_batch(&self, shape: BatchShape) -> Result<(), ShapeMismatch> {
        if shape != self.shape {
            return Err(ShapeMismatch::new("ensemble batch", &self.shape.dims(), &shape.dims()));
        }
        Ok(())
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        metrics.ensemble_phase.set(self.phase.gauge_value());
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn phase(&self) -> EnsemblePhase {
        self.phase
    }

    pub fn models(&self) -> &[GafWgan] {
        &self.models
    }

    pub fn meta_learner(&self) -> &MetaLearner {
        &self.meta
    }

    pub fn latest_metrics(&self) -> Option<&ModelMetrics> {
        self.latest_metrics.as_ref()
    }

    /// Restores metrics recorded before a checkpoint was taken.
    pub fn with_latest_metrics(mut self, metrics: Option<ModelMetrics>) -> Self {
        self.latest_metrics = metrics;
        self
    }

    fn set_phase(&mut self, phase: EnsemblePhase) {
        self.phase = phase;
        if let Some(metrics) = &self.metrics {
            metrics.ensemble_phase.set(phase.gauge_value());
        }
    }

    /// Trains every base model on `data`.
    ///
    /// All models are attempted even when some fail; a failure leaves the ensemble
    /// `Untrained` and reports every failing index.
    pub fn train_base_models(
        &mut self,
        data: &dyn BatchSource,
        validation: Option<&dyn BatchSource>,
        epochs: usize,
    ) -> Result<Vec<TrainingReport>, EnsembleError> {
        self.check_batch(data.shape())?;
        if let Some(validation) = validation {
            self.check_batch(validation.shape())?;
        }
        info!(
            "Training {} base models for {} epochs on {} samples (parallel: {})",
            self.models.len(),
            epochs,
            data.num_samples(),
            self.config.parallel
        );

        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let train_one = |index: usize, model: &mut GafWgan| -> Result<TrainingReport, TrainingError> {
            GafWganTrainer::new(index)
                .with_metrics(metrics.clone())
                .train(model, data, validation, epochs, &cancel)
        };

        let results: Vec<Result<TrainingReport, TrainingError>> = if self.config.parallel {
            self.models
                .par_iter_mut()
                .enumerate()
                .map(|(i, model)| train_one(i, model))
                .collect()
        } else {
            self.models
                .iter_mut()
                .enumerate()
                .map(|(i, model)| train_one(i, model))
                .collect()
        };

        let mut reports = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(model = index, "Base model failed: {}", e);
                    failures.push((index, e));
                }
            }
        }

        if !failures.is_empty() {
            self.set_phase(EnsemblePhase::Untrained);
            return Err(EnsembleError::BaseModelsFailed { failures });
        }
        self.set_phase(EnsemblePhase::BaseTrained);
        info!("All {} base models trained", self.models.len());
        Ok(reports)
    }

    /// Normalized base predictions, `[model][sample]`. Works in any phase.
    pub fn base_predictions(&self, batch: &SequenceBatch) -> Result<Vec<Vec<f64>>, EnsembleError> {
        self.check_batch(batch.shape())?;
        let outputs: Result<Vec<Vec<f64>>, ShapeMismatch> = if self.config.parallel {
            self.models
                .par_iter()
                .map(|m| m.predict_normalized(batch))
                .collect()
        } else {
            self.models.iter().map(|m| m.predict_normalized(batch)).collect()
        };
        Ok(outputs?)
    }

    /// Base predictions in price units, `[model][sample]`.
    pub fn base_price_predictions(&self, batch: &SequenceBatch) -> Result<Vec<Vec<f64>>, EnsembleError> {
        Ok(self
            .base_predictions(batch)?
            .iter()
            .map(|normalized| batch.denormalize(normalized))
            .collect())
    }

    fn stacked(&self, batch: &SequenceBatch) -> Result<Array2<f64>, EnsembleError> {
        let per_model = self.base_predictions(batch)?;
        Ok(Array2::from_shape_fn((batch.len(), per_model.len()), |(s, m)| per_model[m][s]))
    }

    /// Trains the meta-learner on the frozen generators' outputs over `validation`.
    pub fn train_meta_learner(
        &mut self,
        validation: &dyn BatchSource,
        epochs: usize,
    ) -> Result<MetaReport, EnsembleError> {
        if self.phase == EnsemblePhase::Untrained {
            return Err(EnsembleError::BaseModelsNotTrained);
        }
        if epochs == 0 {
            return Err(EnsembleError::InvalidConfig {
                reason: "meta-learner needs at least one epoch".to_string(),
            });
        }
        self.check_batch(validation.shape())?;

        // Generator outputs do not change during meta training.
        let mut cached = Vec::new();
        for batch in validation.batches(0) {
            let stacked = self.stacked(&batch)?;
            cached.push((stacked, batch));
        }
        if cached.is_empty() {
            return Err(EnsembleError::EmptyDataset);
        }

        // Not ready again until the new weights have been trained and evaluated.
        self.set_phase(EnsemblePhase::BaseTrained);
        let mut report = MetaReport::default();
        for epoch in 0..epochs {
            let mut losses = Vec::with_capacity(cached.len());
            for (stacked, batch) in &cached {
                let graph = Graph::tracked();
                let output = self.meta.forward(&graph, stacked, Some(&mut self.meta_rng))?;
                let targets = Var::constant(batch.targets.clone().into_dyn());
                let loss = output.sub(&targets).square().mean();
                let value = loss.item();
                if !value.is_finite() {
                    return Err(EnsembleError::MetaDiverged { epoch, value });
                }
                let grads = graph.gradients(&loss);
                if !grads.all_finite() {
                    return Err(EnsembleError::MetaDiverged { epoch, value: f64::NAN });
                }
                self.meta_optimizer.step(self.meta.params_mut(), &grads);
                losses.push(value);
            }
            let mean = losses.iter().mean();
            info!(epoch, meta_loss = mean, "Meta-learner epoch complete");
            if let Some(metrics) = &self.metrics {
                metrics.meta_loss.set(mean);
            }
            report.losses.push(mean);
        }

        let batches: Vec<SequenceBatch> = cached.into_iter().map(|(_, batch)| batch).collect();
        self.evaluate_batches(batches)?;
        self.set_phase(EnsemblePhase::Ready);
        Ok(report)
    }

    /// Deterministic ensemble prediction. Requires the `Ready` phase.
    pub fn predict(&self, batch: &SequenceBatch) -> Result<EnsemblePrediction, EnsembleError> {
        if self.phase != EnsemblePhase::Ready {
            return Err(EnsembleError::NotReady);
        }
        self.combine(batch)
    }

    fn combine(&self, batch: &SequenceBatch) -> Result<EnsemblePrediction, EnsembleError> {
        let per_model = self.base_predictions(batch)?;
        let stacked = Array2::from_shape_fn((batch.len(), per_model.len()), |(s, m)| per_model[m][s]);
        let normalized = self.meta.predict(&stacked)?;
        let prices = batch.denormalize(&normalized);
        let per_model_prices: Vec<Vec<f64>> =
            per_model.iter().map(|n| batch.denormalize(n)).collect();

        Ok(EnsemblePrediction {
            disagreement: disagreement(&per_model_prices),
            normalized,
            prices,
            per_model_prices,
        })
    }

    /// Predicts every batch of `source` and records [`ModelMetrics`] in price units.
    pub fn evaluate(&mut self, source: &dyn BatchSource) -> Result<ModelMetrics, EnsembleError> {
        if self.phase != EnsemblePhase::Ready {
            return Err(EnsembleError::NotReady);
        }
        self.check_batch(source.shape())?;
        self.evaluate_batches(source.batches(0).collect())
    }

    fn evaluate_batches(&mut self, batches: Vec<SequenceBatch>) -> Result<ModelMetrics, EnsembleError> {
        let mut predictions = Vec::new();
        let mut actuals = Vec::new();
        let mut anchors = Vec::new();
        let mut per_model = vec![Vec::new(); self.models.len()];

        for batch in &batches {
            let prediction = self.combine(batch)?;
            predictions.extend(prediction.prices);
            actuals.extend_from_slice(&batch.target_prices);
            anchors.extend_from_slice(&batch.anchors);
            for (all, model) in per_model.iter_mut().zip(prediction.per_model_prices) {
                all.extend(model);
            }
        }

        let metrics = ModelMetrics::calculate(
            &predictions,
            &actuals,
            Some(anchors.as_slice()),
            Some(per_model.as_slice()),
        )?;
        info!(
            rmse = metrics.rmse,
            hit_rate = metrics.hit_rate,
            disagreement = ?metrics.ensemble_disagreement,
            samples = metrics.samples,
            "Ensemble evaluated"
        );
        if let Some(gauges) = &self.metrics {
            gauges.ensemble_rmse.set(metrics.rmse);
            gauges
                .ensemble_disagreement
                .set(metrics.ensemble_disagreement.unwrap_or(0.0));
        }
        self.latest_metrics = Some(metrics.clone());
        Ok(metrics)
    }
}
