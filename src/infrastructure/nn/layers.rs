use super::param::{Graph, Module, Param};
use crate::infrastructure::autograd::Var;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// PyTorch's default `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` bound.
fn init_bound(fan_in: usize) -> f64 {
    1.0 / (fan_in.max(1) as f64).sqrt()
}

fn add_bias(graph: &Graph, y: Var, bias: &Param) -> Var {
    let b = graph.param(bias).broadcast_to(y.shape());
    y.add(&b)
}

/// Fully connected layer, `y = x W + b` with `W: [in, out]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    weight: Param,
    bias: Option<Param>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = init_bound(in_features);
        Self {
            weight: Param::uniform(&[in_features, out_features], bound, rng),
            bias: Some(Param::uniform(&[1, out_features], bound, rng)),
        }
    }

    pub fn without_bias<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Param::uniform(&[in_features, out_features], init_bound(in_features), rng),
            bias: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// `x: [B, in]` -> `[B, out]`
    pub fn forward(&self, graph: &Graph, x: &Var) -> Var {
        let y = x.matmul(&graph.param(&self.weight));
        match &self.bias {
            Some(bias) => add_bias(graph, y, bias),
            None => y,
        }
    }
}

impl Module for Linear {
    fn params(&self) -> Vec<&Param> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

/// Stride-1, "same"-padded 1-D convolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv1d {
    /// `[C_in * K, C_out]`
    weight: Param,
    bias: Param,
    kernel_size: usize,
}

impl Conv1d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Self {
        assert!(kernel_size % 2 == 1, "Conv1d: kernel size must be odd for same padding");
        let fan_in = in_channels * kernel_size;
        let bound = init_bound(fan_in);
        Self {
            weight: Param::uniform(&[fan_in, out_channels], bound, rng),
            bias: Param::uniform(&[1, out_channels], bound, rng),
            kernel_size,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[0] / self.kernel_size
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    /// `x: [B, C_in, L]` -> `[B, C_out, L]`
    pub fn forward(&self, graph: &Graph, x: &Var) -> Var {
        let (batch, len) = (x.shape()[0], x.shape()[2]);
        let cols = x.unfold1d(self.kernel_size);
        let y = add_bias(graph, cols.matmul(&graph.param(&self.weight)), &self.bias);
        y.reshape(&[batch, len, self.out_channels()])
            .permute(&[0, 2, 1])
    }
}

impl Module for Conv1d {
    fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Stride-1, "same"-padded 2-D convolution with a square kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    /// `[C_in * K * K, C_out]`
    weight: Param,
    bias: Param,
    kernel_size: usize,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Self {
        assert!(kernel_size % 2 == 1, "Conv2d: kernel size must be odd for same padding");
        let fan_in = in_channels * kernel_size * kernel_size;
        let bound = init_bound(fan_in);
        Self {
            weight: Param::uniform(&[fan_in, out_channels], bound, rng),
            bias: Param::uniform(&[1, out_channels], bound, rng),
            kernel_size,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// `x: [B, C_in, H, W]` -> `[B*H*W, C_in*K*K]`. Several convolutions over the
    /// same input can share one patch matrix.
    pub fn patches(&self, x: &Var) -> Var {
        x.unfold2d(self.kernel_size)
    }

    /// Patch matrix -> `[B*H*W, C_out]`, pixels in row-major `(b, h, w)` order.
    pub fn project(&self, graph: &Graph, patches: &Var) -> Var {
        add_bias(graph, patches.matmul(&graph.param(&self.weight)), &self.bias)
    }

    /// `x: [B, C_in, H, W]` -> `[B, C_out, H, W]`
    pub fn forward(&self, graph: &Graph, x: &Var) -> Var {
        let (batch, height, width) = (x.shape()[0], x.shape()[2], x.shape()[3]);
        let y = self.project(graph, &self.patches(x));
        y.reshape(&[batch, height, width, self.out_channels()])
            .permute(&[0, 3, 1, 2])
    }
}

impl Module for Conv2d {
    fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Per-sample normalization over the feature axis of `[B, F]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    gamma: Param,
    beta: Param,
    eps: f64,
}

impl LayerNorm {
    pub fn new(features: usize) -> Self {
        Self {
            gamma: Param::new(ArrayD::ones(IxDyn(&[1, features]))),
            beta: Param::zeros(&[1, features]),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, graph: &Graph, x: &Var) -> Var {
        let (batch, features) = (x.shape()[0], x.shape()[1]);
        let full = [batch, features];
        let inv_n = 1.0 / features as f64;

        let mean = x.sum_to(&[batch, 1]).scale(inv_n).broadcast_to(&full);
        let centered = x.sub(&mean);
        let std = centered
            .square()
            .sum_to(&[batch, 1])
            .scale(inv_n)
            .add_scalar(self.eps)
            .sqrt()
            .broadcast_to(&full);
        let normalized = centered.div(&std);

        normalized
            .mul(&graph.param(&self.gamma).broadcast_to(&full))
            .add(&graph.param(&self.beta).broadcast_to(&full))
    }
}

impl Module for LayerNorm {
    fn params(&self) -> Vec<&Param> {
        vec![&self.gamma, &self.beta]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

/// Inverted dropout: zeroes each element with probability `p` and rescales the rest.
pub fn dropout<R: Rng + ?Sized>(x: &Var, p: f64, rng: &mut R) -> Var {
    if p <= 0.0 {
        return x.clone();
    }
    let keep = 1.0 / (1.0 - p);
    let mask = ArrayD::from_shape_fn(IxDyn(x.shape()), |_| {
        if rng.random::<f64>() < p { 0.0 } else { keep }
    });
    x.mul(&Var::constant(mask))
}
