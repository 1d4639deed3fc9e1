use crate::domain::errors::ShapeMismatch;
use crate::domain::ml::model_config::MetaLearnerConfig;
use crate::infrastructure::autograd::Var;
use crate::infrastructure::nn::{Graph, Linear, Module, Param, dropout};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Stacking head over the base models' normalized predictions.
///
/// `Linear(n, 100) -> ReLU -> Dropout -> Linear(100, 100) -> ReLU -> Dropout -> Linear(100, 1)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaLearner {
    n_models: usize,
    dropout: f64,
    hidden1: Linear,
    hidden2: Linear,
    output: Linear,
}

impl MetaLearner {
    pub fn new<R: Rng + ?Sized>(n_models: usize, config: &MetaLearnerConfig, rng: &mut R) -> Self {
        let hidden = config.hidden_units;
        Self {
            n_models,
            dropout: config.dropout,
            hidden1: Linear::new(n_models, hidden, rng),
            hidden2: Linear::new(hidden, hidden, rng),
            output: Linear::new(hidden, 1, rng),
        }
    }

    pub fn n_models(&self) -> usize {
        self.n_models
    }

    /// `stacked: [B, n_models]` -> `[B, 1]`. Dropout is applied only when `rng` is given.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        graph: &Graph,
        stacked: &Array2<f64>,
        mut rng: Option<&mut R>,
    ) -> Result<Var, ShapeMismatch> {
        if stacked.ncols() != self.n_models || stacked.nrows() == 0 {
            return Err(ShapeMismatch::new(
                "meta-learner input",
                &[stacked.nrows().max(1), self.n_models],
                stacked.shape(),
            ));
        }
        let x = Var::constant(stacked.clone().into_dyn());

        let mut h = self.hidden1.forward(graph, &x).relu();
        if let Some(rng) = rng.as_deref_mut() {
            h = dropout(&h, self.dropout, rng);
        }
        let mut h = self.hidden2.forward(graph, &h).relu();
        if let Some(rng) = rng.as_deref_mut() {
            h = dropout(&h, self.dropout, rng);
        }
        Ok(self.output.forward(graph, &h))
    }

    /// Deterministic inference, one value per row.
    pub fn predict(&self, stacked: &Array2<f64>) -> Result<Vec<f64>, ShapeMismatch> {
        let out = self.forward::<rand::rngs::StdRng>(&Graph::frozen(), stacked, None)?;
        Ok(out.value().iter().copied().collect())
    }
}

impl Module for MetaLearner {
    fn params(&self) -> Vec<&Param> {
        let mut params = self.hidden1.params();
        params.extend(self.hidden2.params());
        params.extend(self.output.params());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.hidden1.params_mut();
        params.extend(self.hidden2.params_mut());
        params.extend(self.output.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn learner() -> MetaLearner {
        let mut rng = StdRng::seed_from_u64(9);
        MetaLearner::new(3, &MetaLearnerConfig::default(), &mut rng)
    }

    fn stacked() -> Array2<f64> {
        Array2::from_shape_fn((4, 3), |(i, j)| 0.1 * i as f64 - 0.2 * j as f64)
    }

    #[test]
    fn test_predict_is_deterministic() {
        let meta = learner();
        let a = meta.predict(&stacked()).unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(a, meta.predict(&stacked()).unwrap());
    }

    #[test]
    fn test_dropout_changes_training_output() {
        let meta = learner();
        let mut rng = StdRng::seed_from_u64(1);
        let train = meta.forward(&Graph::frozen(), &stacked(), Some(&mut rng)).unwrap();
        let eval = meta.predict(&stacked()).unwrap();
        let train: Vec<f64> = train.value().iter().copied().collect();
        assert_ne!(train, eval);
    }

    #[test]
    fn test_rejects_wrong_model_count() {
        let err = learner().predict(&Array2::zeros((2, 5))).unwrap_err();
        assert_eq!(err.expected, vec![2, 3]);
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(learner().num_parameters(), 3 * 100 + 100 + 100 * 100 + 100 + 100 + 1);
    }
}
