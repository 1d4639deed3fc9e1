//! One generator/discriminator pair trained with WGAN-GP.
//!
//! Per batch the critic always steps; the generator steps on every
//! `critic_iterations`-th call (the first call included):
//!
//! ```text
//! d_loss = mean(D(fake)) - mean(D(real)) + lambda * mean((|grad D(x_hat)|_2 - 1)^2)
//! g_loss = -mean(D(fake))
//! ```
//!
//! Critic sequences live in the last window's `[-1, 1]` frame: real is
//! `history ++ target`, fake is `history ++ prediction`.

use super::discriminator::Discriminator;
use super::generator::Generator;
use crate::domain::errors::{ShapeMismatch, TrainingError, TrainingPhase};
use crate::domain::ml::model_config::{EnsembleConfig, WganConfig};
use crate::domain::ml::sample::{BatchShape, SequenceBatch};
use crate::infrastructure::autograd::Var;
use crate::infrastructure::nn::{Adam, AdamConfig, Graph, Module};
use ndarray::{Array1, Array2, Array3, ArrayD, Axis, IxDyn, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const NORM_EPS: f64 = 1e-12;

/// Losses of one `train_step`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    pub d_loss: f64,
    /// `None` when the generator did not step this iteration
    pub g_loss: Option<f64>,
    pub gradient_penalty: f64,
    /// `mean(D(real)) - mean(D(fake))`
    pub wasserstein_estimate: f64,
}

/// Learned parameters of one model, as stored in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub generator: Generator,
    pub discriminator: Discriminator,
}

/// `[B, H]` history and `[B, 1]` targets -> `[B, 1, H + 1]`.
pub fn real_sequences(history: &Array2<f64>, targets: &Array2<f64>) -> Array3<f64> {
    let (batch, h) = history.dim();
    let mut seq = Array3::zeros((batch, 1, h + 1));
    seq.slice_mut(s![.., 0, ..h]).assign(history);
    seq.slice_mut(s![.., 0, h]).assign(&targets.column(0));
    seq
}

/// `[B, H]` history and a `[B, 1]` prediction -> `[B, 1, H + 1]`, differentiable in the
/// prediction.
pub fn fake_sequences(history: &Array2<f64>, prediction: &Var) -> Var {
    let (batch, h) = history.dim();
    let len = h + 1;
    let shape = [batch, 1, len];

    let mut base = ArrayD::zeros(IxDyn(&shape));
    let mut last = ArrayD::zeros(IxDyn(&shape));
    for b in 0..batch {
        for j in 0..h {
            base[[b, 0, j]] = history[[b, j]];
        }
        last[[b, 0, h]] = 1.0;
    }

    prediction
        .reshape(&[batch, 1, 1])
        .broadcast_to(&shape)
        .mul(&Var::constant(last))
        .add(&Var::constant(base))
}

fn sample_latent(rng: &mut StdRng, batch: usize, dim: usize) -> Array2<f64> {
    Array2::from_shape_fn((batch, dim), |_| rng.sample::<f64, _>(StandardNormal))
}

fn adam_config(config: &WganConfig) -> AdamConfig {
    AdamConfig {
        learning_rate: config.optimizer.learning_rate,
        beta1: config.optimizer.beta1,
        beta2: config.optimizer.beta2,
        ..AdamConfig::wgan_gp()
    }
}

/// A generator/discriminator pair with its own optimizers and RNG.
#[derive(Debug, Clone)]
pub struct GafWgan {
    generator: Generator,
    discriminator: Discriminator,
    g_optimizer: Adam,
    d_optimizer: Adam,
    config: WganConfig,
    rng: StdRng,
    iteration: u64,
    epoch: usize,
}

impl GafWgan {
    pub fn new(
        generator: Generator,
        discriminator: Discriminator,
        config: WganConfig,
        seed: u64,
    ) -> Self {
        let adam = adam_config(&config);
        Self {
            generator,
            discriminator,
            g_optimizer: Adam::new(adam),
            d_optimizer: Adam::new(adam),
            config,
            rng: StdRng::seed_from_u64(seed),
            iteration: 0,
            epoch: 0,
        }
    }

    /// Fresh, seeded model for an ensemble member.
    pub fn from_config(config: &EnsembleConfig, shape: BatchShape, seed: u64) -> Self {
        let mut init = StdRng::seed_from_u64(seed);
        let generator = Generator::new(config.generator.clone(), shape, &mut init);
        let discriminator = Discriminator::new(config.discriminator.clone(), &mut init);
        Self::new(generator, discriminator, config.wgan.clone(), seed.wrapping_add(1))
    }

    pub fn from_snapshot(snapshot: ModelSnapshot, config: WganConfig, seed: u64) -> Self {
        Self::new(snapshot.generator, snapshot.discriminator, config, seed)
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            generator: self.generator.clone(),
            discriminator: self.discriminator.clone(),
        }
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Epoch reported in divergence errors.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    fn diverged(&self, phase: TrainingPhase, value: f64) -> TrainingError {
        TrainingError::Diverged {
            phase,
            epoch: self.epoch,
            iteration: self.iteration,
            value,
        }
    }

    fn check_history(&self, batch: &SequenceBatch) -> Result<(), ShapeMismatch> {
        let h = self.discriminator.sequence_len() - 1;
        if batch.history.ncols() != h || batch.targets.dim() != (batch.len(), 1) {
            return Err(ShapeMismatch::new(
                "critic history",
                &[batch.len(), h],
                batch.history.shape(),
            ));
        }
        Ok(())
    }

    /// `mean((|grad_x D(x_hat)|_2 - 1)^2)` with `x_hat = alpha * real + (1 - alpha) * fake`,
    /// one `alpha` per sample. The result stays differentiable in the critic parameters.
    pub fn gradient_penalty(
        &self,
        graph: &Graph,
        real: &ArrayD<f64>,
        fake: &ArrayD<f64>,
        alpha: &Array1<f64>,
    ) -> Result<Var, ShapeMismatch> {
        if real.shape() != fake.shape() || real.ndim() != 3 || alpha.len() != real.shape()[0] {
            return Err(ShapeMismatch::new("gradient penalty", real.shape(), fake.shape()));
        }
        let (batch, len) = (real.shape()[0], real.shape()[2]);
        let weights = alpha
            .view()
            .into_shape((batch, 1, 1))
            .map_err(|_| ShapeMismatch::new("gradient penalty alpha", &[batch], alpha.shape()))?
            .into_dyn();
        let mixed = &weights * real + &weights.mapv(|a| 1.0 - a) * fake;

        let x_hat = Var::leaf(mixed);
        let scores = self.discriminator.forward(graph, &x_hat)?;
        let grads = scores.sum_all().grad(&[&x_hat], true);
        let Some(grad) = grads.into_iter().next() else {
            return Err(ShapeMismatch::new("gradient penalty", &[batch, 1, len], &[]));
        };

        let norms = grad
            .reshape(&[batch, len])
            .square()
            .sum_to(&[batch, 1])
            .add_scalar(NORM_EPS)
            .sqrt();
        Ok(norms.add_scalar(-1.0).square().mean())
    }

    /// One discriminator update and, on schedule, one generator update.
    ///
    /// A non-finite loss aborts before the corresponding optimizer step.
    pub fn train_step(&mut self, batch: &SequenceBatch) -> Result<StepLosses, TrainingError> {
        self.check_history(batch)?;
        let b = batch.len();
        let z = sample_latent(&mut self.rng, b, self.generator.latent_dim());
        let alpha = Array1::from_shape_fn(b, |_| self.rng.random::<f64>());
        let real = Var::constant(real_sequences(&batch.history, &batch.targets).into_dyn());

        // Critic step: generator parameters are bound as constants.
        let prediction = self.generator.forward(&Graph::frozen(), &batch.frames, &z)?;
        let fake = fake_sequences(&batch.history, &prediction);

        let d_graph = Graph::tracked();
        let real_score = self.discriminator.forward(&d_graph, &real)?.mean();
        let fake_score = self.discriminator.forward(&d_graph, &fake)?.mean();
        let gp = self.gradient_penalty(&d_graph, real.value(), fake.value(), &alpha)?;
        let gp_value = gp.item();
        if !gp_value.is_finite() {
            return Err(self.diverged(TrainingPhase::GradientPenalty, gp_value));
        }
        let d_loss = fake_score
            .sub(&real_score)
            .add(&gp.scale(self.config.gradient_penalty_weight));
        let d_value = d_loss.item();
        if !d_value.is_finite() {
            return Err(self.diverged(TrainingPhase::Discriminator, d_value));
        }
        let d_grads = d_graph.gradients(&d_loss);
        if !d_grads.all_finite() {
            return Err(self.diverged(TrainingPhase::Discriminator, f64::NAN));
        }
        self.d_optimizer
            .step(self.discriminator.params_mut(), &d_grads);
        let wasserstein_estimate = real_score.item() - fake_score.item();

        // Generator step on a fresh graph with the same latent; the critic is frozen.
        let g_loss = if self.iteration % self.config.critic_iterations == 0 {
            let g_graph = Graph::tracked();
            let prediction = self.generator.forward(&g_graph, &batch.frames, &z)?;
            let fake = fake_sequences(&batch.history, &prediction);
            let g_loss = self
                .discriminator
                .forward(&Graph::frozen(), &fake)?
                .mean()
                .neg();
            let g_value = g_loss.item();
            if !g_value.is_finite() {
                return Err(self.diverged(TrainingPhase::Generator, g_value));
            }
            let g_grads = g_graph.gradients(&g_loss);
            if !g_grads.all_finite() {
                return Err(self.diverged(TrainingPhase::Generator, f64::NAN));
            }
            self.g_optimizer.step(self.generator.params_mut(), &g_grads);
            Some(g_value)
        } else {
            None
        };

        self.iteration += 1;
        Ok(StepLosses {
            d_loss: d_value,
            g_loss,
            gradient_penalty: gp_value,
            wasserstein_estimate,
        })
    }

    /// Deterministic generator output in the normalized frame, one value per sample.
    pub fn predict_normalized(&self, batch: &SequenceBatch) -> Result<Vec<f64>, ShapeMismatch> {
        let z = self.generator.zero_latent(batch.len());
        let out = self.generator.forward(&Graph::frozen(), &batch.frames, &z)?;
        Ok(out.value().index_axis(Axis(1), 0).iter().copied().collect())
    }

    /// Mean squared error of [`Self::predict_normalized`] against the batch targets.
    pub fn batch_mse(&self, batch: &SequenceBatch) -> Result<f64, ShapeMismatch> {
        let predictions = self.predict_normalized(batch)?;
        let n = predictions.len().max(1) as f64;
        Ok(predictions
            .iter()
            .zip(batch.targets.column(0))
            .map(|(p, t)| (p - t).powi(2))
            .sum::<f64>()
            / n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ml::gaf::WindowScale;
    use crate::domain::ml::model_config::{DiscriminatorConfig, GeneratorConfig};
    use crate::domain::ml::sample::SequenceSample;
    use ndarray::Array4;

    fn config() -> EnsembleConfig {
        EnsembleConfig {
            n_models: 1,
            window_size: 6,
            sequence_length: 2,
            generator: GeneratorConfig {
                hidden_channels: 2,
                kernel_size: 3,
                dense_units: vec![8, 4],
                latent_dim: 3,
            },
            discriminator: DiscriminatorConfig {
                sequence_len: 5,
                channels: 4,
                hidden_units: 6,
                ..DiscriminatorConfig::default()
            },
            ..EnsembleConfig::default()
        }
    }

    fn shape() -> BatchShape {
        BatchShape {
            seq_len: 2,
            frame_size: 6,
            history_len: 4,
        }
    }

    fn batch(size: usize) -> SequenceBatch {
        let samples: Vec<SequenceSample> = (0..size)
            .map(|i| SequenceSample {
                frames: Array4::from_shape_fn((1, 2, 6, 6), |(_, t, a, b)| {
                    ((i + t + a * b) as f64 * 0.3).cos()
                })
                .index_axis_move(Axis(0), 0),
                history: Array1::from_shape_fn(4, |j| -0.5 + 0.25 * j as f64 + 0.01 * i as f64),
                target: 0.6,
                scale: WindowScale { min: 90.0, max: 110.0 },
                anchor: 105.0,
                target_price: 106.0,
                target_index: i,
            })
            .collect();
        SequenceBatch::stack(&samples).unwrap()
    }

    #[test]
    fn test_real_and_fake_sequences_share_history() {
        let b = batch(2);
        let real = real_sequences(&b.history, &b.targets);
        let prediction = Var::constant(ArrayD::from_elem(IxDyn(&[2, 1]), -0.3));
        let fake = fake_sequences(&b.history, &prediction);
        assert_eq!(real.shape(), &[2, 1, 5]);
        assert_eq!(fake.shape(), &[2, 1, 5]);
        for i in 0..2 {
            for j in 0..4 {
                assert_eq!(real[[i, 0, j]], fake.value()[[i, 0, j]]);
            }
            assert_eq!(real[[i, 0, 4]], 0.6);
            assert_eq!(fake.value()[[i, 0, 4]], -0.3);
        }
    }

    #[test]
    fn test_fake_sequence_gradient_reaches_prediction_only_at_last_step() {
        let history = Array2::from_elem((1, 4), 0.1);
        let prediction = Var::leaf(ArrayD::from_elem(IxDyn(&[1, 1]), 0.2));
        let fake = fake_sequences(&history, &prediction);
        let grads = fake.sum_all().grad(&[&prediction], false);
        assert_eq!(grads[0].value()[[0, 0]], 1.0);
    }

    #[test]
    fn test_gradient_penalty_is_finite_and_non_negative() {
        let model = GafWgan::from_config(&config(), shape(), 5);
        let b = batch(3);
        let real = real_sequences(&b.history, &b.targets).into_dyn();
        let fake = real.mapv(|v| v * 0.5 - 0.1);
        let graph = Graph::tracked();
        let gp = model
            .gradient_penalty(&graph, &real, &fake, &Array1::from(vec![0.2, 0.5, 0.9]))
            .unwrap();
        assert!(gp.item().is_finite());
        assert!(gp.item() >= 0.0);

        // The penalty is differentiable in the critic parameters.
        let grads = graph.gradients(&gp);
        assert!(!grads.is_empty());
        assert!(grads.all_finite());
    }

    #[test]
    fn test_gradient_penalty_value_matches_numeric_input_gradient() {
        let model = GafWgan::from_config(&config(), shape(), 9);
        let b = batch(3);
        let real = real_sequences(&b.history, &b.targets).into_dyn();
        let fake = real.mapv(|v| v * 0.5 - 0.1);
        let alpha = Array1::from(vec![0.3, 0.6, 0.8]);
        let gp = model
            .gradient_penalty(&Graph::frozen(), &real, &fake, &alpha)
            .unwrap()
            .item();

        let score = |x: &ArrayD<f64>, sample: usize| {
            let out = model
                .discriminator()
                .forward(&Graph::frozen(), &Var::constant(x.clone()))
                .unwrap();
            out.value()[[sample, 0]]
        };
        let h = 1e-6;
        let len = real.shape()[2];
        let mut expected = 0.0;
        for i in 0..3 {
            let mut mixed = real.clone();
            for k in 0..len {
                mixed[[i, 0, k]] = alpha[i] * real[[i, 0, k]] + (1.0 - alpha[i]) * fake[[i, 0, k]];
            }
            let mut squared = 0.0;
            for j in 0..len {
                let mut plus = mixed.clone();
                plus[[i, 0, j]] += h;
                let mut minus = mixed.clone();
                minus[[i, 0, j]] -= h;
                let g = (score(&plus, i) - score(&minus, i)) / (2.0 * h);
                squared += g * g;
            }
            expected += ((squared + NORM_EPS).sqrt() - 1.0).powi(2) / 3.0;
        }
        assert!((gp - expected).abs() < 1e-6, "{} vs {}", gp, expected);
    }

    #[test]
    fn test_gradient_penalty_critic_gradients_match_finite_differences() {
        let model = GafWgan::from_config(&config(), shape(), 11);
        let b = batch(3);
        let real = real_sequences(&b.history, &b.targets).into_dyn();
        let fake = real.mapv(|v| v * 0.5 - 0.1);
        let alpha = Array1::from(vec![0.25, 0.5, 0.75]);

        let graph = Graph::tracked();
        let gp = model.gradient_penalty(&graph, &real, &fake, &alpha).unwrap();
        let grads = graph.gradients(&gp);

        let penalty = |m: &GafWgan| {
            m.gradient_penalty(&Graph::frozen(), &real, &fake, &alpha)
                .unwrap()
                .item()
        };
        let h = 1e-6;
        let n_params = model.discriminator().params().len();
        for k in 0..n_params {
            let param = model.discriminator().params()[k];
            for idx in [0, param.len() / 2, param.len() - 1] {
                let analytic = grads
                    .get(param)
                    .and_then(|g| g.iter().nth(idx).copied())
                    .unwrap_or(0.0);

                let mut plus = model.clone();
                if let Some(v) = plus.discriminator.params_mut()[k].value_mut().iter_mut().nth(idx) {
                    *v += h;
                }
                let mut minus = model.clone();
                if let Some(v) = minus.discriminator.params_mut()[k].value_mut().iter_mut().nth(idx) {
                    *v -= h;
                }
                let numeric = (penalty(&plus) - penalty(&minus)) / (2.0 * h);
                assert!(
                    (analytic - numeric).abs() <= 1e-5 * (1.0 + numeric.abs()),
                    "param {} [{}]: {} vs {}",
                    k,
                    idx,
                    analytic,
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_predict_normalized_yields_one_value_per_sample() {
        let model = GafWgan::from_config(&config(), shape(), 10);
        let b = batch(3);
        let predictions = model.predict_normalized(&b).unwrap();
        assert_eq!(predictions.len(), 3);
        assert!(predictions.iter().all(|p| p.is_finite()));

        let expected = predictions.iter().map(|p| (p - 0.6).powi(2)).sum::<f64>() / 3.0;
        assert!((model.batch_mse(&b).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_generator_update_schedule() {
        let mut model = GafWgan::from_config(&config(), shape(), 6);
        let b = batch(2);
        let steps: Vec<StepLosses> = (0..6).map(|_| model.train_step(&b).unwrap()).collect();
        let updated: Vec<bool> = steps.iter().map(|s| s.g_loss.is_some()).collect();
        assert_eq!(updated, vec![true, false, false, false, false, true]);
        assert_eq!(model.iteration(), 6);
        assert!(steps.iter().all(|s| s.d_loss.is_finite() && s.gradient_penalty >= 0.0));
    }

    #[test]
    fn test_critic_step_leaves_generator_untouched() {
        let mut model = GafWgan::from_config(&config(), shape(), 7);
        let b = batch(2);
        model.train_step(&b).unwrap(); // iteration 0 also steps the generator
        let before = model.predict_normalized(&b).unwrap();
        let d_before: Vec<f64> = model.discriminator().params()[0].value().iter().copied().collect();
        model.train_step(&b).unwrap();
        assert_eq!(model.predict_normalized(&b).unwrap(), before);
        let d_after: Vec<f64> = model.discriminator().params()[0].value().iter().copied().collect();
        assert_ne!(d_before, d_after);
    }

    #[test]
    fn test_history_mismatch_is_a_shape_error() {
        let mut model = GafWgan::from_config(&config(), shape(), 8);
        let mut b = batch(2);
        b.history = Array2::zeros((2, 3));
        assert!(matches!(model.train_step(&b), Err(TrainingError::Shape(_))));
        assert_eq!(model.iteration(), 0);
    }
}
