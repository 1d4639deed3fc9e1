use crate::domain::errors::ShapeMismatch;
use crate::domain::ml::model_config::DiscriminatorConfig;
use crate::infrastructure::autograd::Var;
use crate::infrastructure::nn::{Conv1d, Graph, LayerNorm, Linear, Module, Param};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Wasserstein critic over a 1-D price sequence `[B, 1, L]`.
///
/// Two conv blocks (Conv1d, per-sample LayerNorm, LeakyReLU) and three dense
/// layers. The score is unbounded; there is no sigmoid.
///
/// Normalization is per sample so that the critic's gradient with respect to one
/// input never depends on the rest of the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discriminator {
    config: DiscriminatorConfig,
    conv1: Conv1d,
    norm1: LayerNorm,
    conv2: Conv1d,
    norm2: LayerNorm,
    dense1: Linear,
    dense2: Linear,
    output: Linear,
}

impl Discriminator {
    pub fn new<R: Rng + ?Sized>(config: DiscriminatorConfig, rng: &mut R) -> Self {
        let c = config.channels;
        let l = config.sequence_len;
        let k = config.kernel_size;
        let hidden = config.hidden_units;
        Self {
            conv1: Conv1d::new(1, c, k, rng),
            norm1: LayerNorm::new(c * l),
            conv2: Conv1d::new(c, c, k, rng),
            norm2: LayerNorm::new(c * l),
            dense1: Linear::new(c * l, hidden, rng),
            dense2: Linear::new(hidden, hidden, rng),
            output: Linear::new(hidden, 1, rng),
            config,
        }
    }

    pub fn sequence_len(&self) -> usize {
        self.config.sequence_len
    }

    fn block(&self, graph: &Graph, x: &Var, conv: &Conv1d, norm: &LayerNorm) -> Var {
        let (batch, len) = (x.shape()[0], x.shape()[2]);
        let channels = conv.out_channels();
        let y = conv.forward(graph, x).reshape(&[batch, channels * len]);
        norm.forward(graph, &y)
            .leaky_relu(self.config.leaky_slope)
            .reshape(&[batch, channels, len])
    }

    /// `seq: [B, 1, L]` -> `[B, 1]`
    pub fn forward(&self, graph: &Graph, seq: &Var) -> Result<Var, ShapeMismatch> {
        let shape = seq.shape();
        let expected = [shape.first().copied().unwrap_or(0), 1, self.config.sequence_len];
        if shape != &expected[..] || expected[0] == 0 {
            return Err(ShapeMismatch::new("discriminator input", &expected, shape));
        }
        let batch = expected[0];
        let slope = self.config.leaky_slope;

        let x = self.block(graph, seq, &self.conv1, &self.norm1);
        let x = self.block(graph, &x, &self.conv2, &self.norm2);
        let x = x.reshape(&[batch, self.config.channels * self.config.sequence_len]);
        let x = self.dense1.forward(graph, &x).leaky_relu(slope);
        let x = self.dense2.forward(graph, &x).leaky_relu(slope);
        Ok(self.output.forward(graph, &x))
    }
}

impl Module for Discriminator {
    fn params(&self) -> Vec<&Param> {
        let mut params = self.conv1.params();
        params.extend(self.norm1.params());
        params.extend(self.conv2.params());
        params.extend(self.norm2.params());
        params.extend(self.dense1.params());
        params.extend(self.dense2.params());
        params.extend(self.output.params());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.conv1.params_mut();
        params.extend(self.norm1.params_mut());
        params.extend(self.conv2.params_mut());
        params.extend(self.norm2.params_mut());
        params.extend(self.dense1.params_mut());
        params.extend(self.dense2.params_mut());
        params.extend(self.output.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, Axis, IxDyn, Slice};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn critic() -> Discriminator {
        let mut rng = StdRng::seed_from_u64(21);
        Discriminator::new(DiscriminatorConfig::default(), &mut rng)
    }

    fn sequences(batch: usize) -> Var {
        Var::constant(ArrayD::from_shape_fn(IxDyn(&[batch, 1, 11]), |d| {
            ((d[0] * 11 + d[2]) as f64 * 0.21).sin()
        }))
    }

    #[test]
    fn test_scores_are_finite_and_unbounded_shape() {
        let scores = critic().forward(&Graph::frozen(), &sequences(4)).unwrap();
        assert_eq!(scores.shape(), &[4, 1]);
        assert!(scores.is_finite());
    }

    #[test]
    fn test_score_is_per_sample() {
        let d = critic();
        let batch = d.forward(&Graph::frozen(), &sequences(3)).unwrap();
        let single = d
            .forward(
                &Graph::frozen(),
                &Var::constant(
                    sequences(3)
                        .value()
                        .slice_axis(Axis(0), Slice::from(0..1))
                        .to_owned()
                        .into_dyn(),
                ),
            )
            .unwrap();
        assert!((batch.value()[[0, 0]] - single.value()[[0, 0]]).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let bad = Var::constant(ArrayD::zeros(IxDyn(&[2, 1, 7])));
        assert!(critic().forward(&Graph::frozen(), &bad).is_err());
    }
}
