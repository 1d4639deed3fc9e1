//! ConvLSTM generator: a stack of GAF frames in, one normalized price out.

use crate::domain::errors::ShapeMismatch;
use crate::domain::ml::model_config::GeneratorConfig;
use crate::domain::ml::sample::BatchShape;
use crate::infrastructure::autograd::Var;
use crate::infrastructure::nn::{Conv2d, Graph, Linear, Module, Param};
use ndarray::{Array2, Array4, ArrayD, Axis, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Input and hidden convolutions of one LSTM gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GateConvs {
    input: Conv2d,
    hidden: Conv2d,
}

impl GateConvs {
    fn new<R: Rng + ?Sized>(in_channels: usize, hidden: usize, kernel: usize, rng: &mut R) -> Self {
        Self {
            input: Conv2d::new(in_channels, hidden, kernel, rng),
            hidden: Conv2d::new(hidden, hidden, kernel, rng),
        }
    }

    /// Pre-activation in row layout `[B*H*W, hidden]`.
    fn preactivation(&self, graph: &Graph, x_patches: &Var, h_patches: &Var) -> Var {
        self.input
            .project(graph, x_patches)
            .add(&self.hidden.project(graph, h_patches))
    }
}

/// A convolutional LSTM cell with "same" padding.
///
/// States are kept in row layout `[B*H*W, C]` between steps; the hidden state is
/// turned back into an image only to be convolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvLstmCell {
    input_gate: GateConvs,
    forget_gate: GateConvs,
    cell_gate: GateConvs,
    output_gate: GateConvs,
    hidden_channels: usize,
}

/// Hidden and cell state of a [`ConvLstmCell`], both `[B*H*W, C]`.
#[derive(Debug, Clone)]
pub struct CellState {
    pub hidden: Var,
    pub cell: Var,
}

impl CellState {
    pub fn zeros(pixels: usize, channels: usize) -> Self {
        let zeros = || Var::constant(ArrayD::zeros(IxDyn(&[pixels, channels])));
        Self {
            hidden: zeros(),
            cell: zeros(),
        }
    }
}

/// Row layout `[B*H*W, C]` -> image layout `[B, C, H, W]`.
fn rows_to_image(rows: &Var, batch: usize, size: usize) -> Var {
    let channels = rows.shape()[1];
    rows.reshape(&[batch, size, size, channels])
        .permute(&[0, 3, 1, 2])
}

impl ConvLstmCell {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            input_gate: GateConvs::new(in_channels, hidden_channels, kernel_size, rng),
            forget_gate: GateConvs::new(in_channels, hidden_channels, kernel_size, rng),
            cell_gate: GateConvs::new(in_channels, hidden_channels, kernel_size, rng),
            output_gate: GateConvs::new(in_channels, hidden_channels, kernel_size, rng),
            hidden_channels,
        }
    }

    pub fn hidden_channels(&self) -> usize {
        self.hidden_channels
    }

    /// One time step. `x: [B, C_in, N, N]`.
    pub fn step(&self, graph: &Graph, x: &Var, state: &CellState) -> CellState {
        let (batch, size) = (x.shape()[0], x.shape()[2]);
        let x_patches = self.input_gate.input.patches(x);
        let h_image = rows_to_image(&state.hidden, batch, size);
        let h_patches = self.input_gate.hidden.patches(&h_image);

        let i = self
            .input_gate
            .preactivation(graph, &x_patches, &h_patches)
            .sigmoid();
        let f = self
            .forget_gate
            .preactivation(graph, &x_patches, &h_patches)
            .sigmoid();
        let g = self
            .cell_gate
            .preactivation(graph, &x_patches, &h_patches)
            .tanh();
        let o = self
            .output_gate
            .preactivation(graph, &x_patches, &h_patches)
            .sigmoid();

        let cell = f.mul(&state.cell).add(&i.mul(&g));
        let hidden = o.mul(&cell.tanh());
        CellState { hidden, cell }
    }

    fn gates(&self) -> [&GateConvs; 4] {
        [
            &self.input_gate,
            &self.forget_gate,
            &self.cell_gate,
            &self.output_gate,
        ]
    }
}

impl Module for ConvLstmCell {
    fn params(&self) -> Vec<&Param> {
        self.gates()
            .into_iter()
            .flat_map(|g| g.input.params().into_iter().chain(g.hidden.params()))
            .collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        [
            &mut self.input_gate,
            &mut self.forget_gate,
            &mut self.cell_gate,
            &mut self.output_gate,
        ]
        .into_iter()
        .flat_map(|g| {
            let mut params = g.input.params_mut();
            params.extend(g.hidden.params_mut());
            params
        })
        .collect()
    }
}

/// Two stacked ConvLSTM cells followed by a dense regression head.
///
/// A latent vector enters through a bias-free projection added to the first dense
/// pre-activation. Training samples it from `N(0, 1)`; inference passes zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generator {
    config: GeneratorConfig,
    seq_len: usize,
    frame_size: usize,
    lower: ConvLstmCell,
    upper: ConvLstmCell,
    latent_projection: Linear,
    dense: Vec<Linear>,
    output: Linear,
}

impl Generator {
    pub fn new<R: Rng + ?Sized>(config: GeneratorConfig, shape: BatchShape, rng: &mut R) -> Self {
        let hidden = config.hidden_channels;
        let k = config.kernel_size;
        let lower = ConvLstmCell::new(1, hidden, k, rng);
        let upper = ConvLstmCell::new(hidden, hidden, k, rng);

        let flat = hidden * shape.frame_size * shape.frame_size;
        let mut dense = Vec::with_capacity(config.dense_units.len());
        let mut width = flat;
        for &units in &config.dense_units {
            dense.push(Linear::new(width, units, rng));
            width = units;
        }
        let first_units = config.dense_units.first().copied().unwrap_or(width);
        let latent_projection = Linear::without_bias(config.latent_dim, first_units, rng);
        let output = Linear::new(width, 1, rng);

        Self {
            config,
            seq_len: shape.seq_len,
            frame_size: shape.frame_size,
            lower,
            upper,
            latent_projection,
            dense,
            output,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn latent_dim(&self) -> usize {
        self.config.latent_dim
    }

    /// Deterministic latent used at inference.
    pub fn zero_latent(&self, batch: usize) -> Array2<f64> {
        Array2::zeros((batch, self.config.latent_dim))
    }

    /// `frames: [B, T, N, N]`, `latent: [B, latent_dim]` -> `[B, 1]`.
    pub fn forward(
        &self,
        graph: &Graph,
        frames: &Array4<f64>,
        latent: &Array2<f64>,
    ) -> Result<Var, ShapeMismatch> {
        let (batch, t, h, w) = frames.dim();
        let expected = [batch, self.seq_len, self.frame_size, self.frame_size];
        if [batch, t, h, w] != expected || batch == 0 {
            return Err(ShapeMismatch::new("generator frames", &expected, frames.shape()));
        }
        if latent.dim() != (batch, self.config.latent_dim) {
            return Err(ShapeMismatch::new(
                "generator latent",
                &[batch, self.config.latent_dim],
                latent.shape(),
            ));
        }

        let pixels = batch * self.frame_size * self.frame_size;
        let hidden = self.config.hidden_channels;
        let mut lower_state = CellState::zeros(pixels, hidden);
        let mut upper_state = CellState::zeros(pixels, hidden);

        for step in 0..self.seq_len {
            let frame = frames
                .index_axis(Axis(1), step)
                .insert_axis(Axis(1))
                .to_owned()
                .into_dyn();
            let x = Var::constant(frame);
            lower_state = self.lower.step(graph, &x, &lower_state);
            let lower_image = rows_to_image(&lower_state.hidden, batch, self.frame_size);
            upper_state = self.upper.step(graph, &lower_image, &upper_state);
        }

        // Flatten in (C, H, W) order.
        let features = rows_to_image(&upper_state.hidden, batch, self.frame_size)
            .reshape(&[batch, hidden * self.frame_size * self.frame_size]);

        let z = Var::constant(latent.clone().into_dyn());
        let mut x = features;
        for (index, layer) in self.dense.iter().enumerate() {
            let mut pre = layer.forward(graph, &x);
            if index == 0 {
                pre = pre.add(&self.latent_projection.forward(graph, &z));
            }
            x = pre.relu();
        }
        Ok(self.output.forward(graph, &x))
    }
}

impl Module for Generator {
    fn params(&self) -> Vec<&Param> {
        let mut params = self.lower.params();
        params.extend(self.upper.params());
        params.extend(self.latent_projection.params());
        for layer in &self.dense {
            params.extend(layer.params());
        }
        params.extend(self.output.params());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.lower.params_mut();
        params.extend(self.upper.params_mut());
        params.extend(self.latent_projection.params_mut());
        for layer in &mut self.dense {
            params.extend(layer.params_mut());
        }
        params.extend(self.output.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn small() -> (GeneratorConfig, BatchShape) {
        (
            GeneratorConfig {
                hidden_channels: 2,
                kernel_size: 3,
                dense_units: vec![8, 4],
                latent_dim: 3,
            },
            BatchShape {
                seq_len: 2,
                frame_size: 5,
                history_len: 4,
            },
        )
    }

    fn frames(batch: usize) -> Array4<f64> {
        Array4::from_shape_fn((batch, 2, 5, 5), |(b, t, i, j)| {
            ((b + t + i * j) as f64 * 0.37).cos()
        })
    }

    #[test]
    fn test_forward_shape_and_finite() {
        let (config, shape) = small();
        let mut rng = StdRng::seed_from_u64(11);
        let generator = Generator::new(config, shape, &mut rng);
        let out = generator
            .forward(&Graph::frozen(), &frames(3), &generator.zero_latent(3))
            .unwrap();
        assert_eq!(out.shape(), &[3, 1]);
        assert!(out.is_finite());
    }

    #[test]
    fn test_zero_latent_is_deterministic() {
        let (config, shape) = small();
        let mut rng = StdRng::seed_from_u64(12);
        let generator = Generator::new(config, shape, &mut rng);
        let a = generator
            .forward(&Graph::frozen(), &frames(2), &generator.zero_latent(2))
            .unwrap();
        let b = generator
            .forward(&Graph::frozen(), &frames(2), &generator.zero_latent(2))
            .unwrap();
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let (config, shape) = small();
        let mut rng = StdRng::seed_from_u64(13);
        let generator = Generator::new(config, shape, &mut rng);
        let bad = Array4::zeros((2, 2, 4, 4));
        let err = generator
            .forward(&Graph::frozen(), &bad, &generator.zero_latent(2))
            .unwrap_err();
        assert_eq!(err.expected, vec![2, 2, 5, 5]);
    }

    #[test]
    fn test_every_parameter_receives_gradient() {
        let (config, shape) = small();
        let mut rng = StdRng::seed_from_u64(14);
        let generator = Generator::new(config, shape, &mut rng);
        let graph = Graph::tracked();
        let latent = Array2::from_elem((2, 3), 0.5);
        let loss = generator.forward(&graph, &frames(2), &latent).unwrap().square().mean();
        let grads = graph.gradients(&loss);
        assert_eq!(grads.len(), generator.params().len());
        assert!(grads.all_finite());
    }
}
