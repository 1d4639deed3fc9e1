use super::kernels;
use ndarray::{ArrayD, ArrayView2, Axis, Ix2, IxDyn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// A node in a computation graph.
///
/// Cloning a `Var` is cheap and shares the node. Graphs are single-threaded;
/// parameters cross threads as plain arrays and are rebound per graph.
#[derive(Clone)]
pub struct Var(Rc<Node>);

struct Node {
    id: usize,
    value: ArrayD<f64>,
    requires_grad: bool,
    op: Op,
}

enum Op {
    Leaf,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Div(Var, Var),
    Neg(Var),
    Scale(Var, f64),
    AddScalar(Var),
    Square(Var),
    Sqrt(Var),
    Sigmoid(Var),
    Tanh(Var),
    Relu(Var),
    LeakyRelu(Var, f64),
    MatMul(Var, Var),
    Permute(Var, Vec<usize>),
    Reshape(Var),
    BroadcastTo(Var),
    SumTo(Var),
    Unfold1d(Var, usize),
    Fold1d(Var, usize),
    Unfold2d(Var, usize),
    Fold2d(Var, usize),
}

impl Op {
    fn parents(&self) -> Vec<&Var> {
        match self {
            Op::Leaf => Vec::new(),
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::Div(a, b) | Op::MatMul(a, b) => {
                vec![a, b]
            }
            Op::Neg(a)
            | Op::Scale(a, _)
            | Op::AddScalar(a)
            | Op::Square(a)
            | Op::Sqrt(a)
            | Op::Sigmoid(a)
            | Op::Tanh(a)
            | Op::Relu(a)
            | Op::LeakyRelu(a, _)
            | Op::Permute(a, _)
            | Op::Reshape(a)
            | Op::BroadcastTo(a)
            | Op::SumTo(a)
            | Op::Unfold1d(a, _)
            | Op::Fold1d(a, _)
            | Op::Unfold2d(a, _)
            | Op::Fold2d(a, _) => vec![a],
        }
    }

    fn into_parents(self) -> Vec<Var> {
        match self {
            Op::Leaf => Vec::new(),
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::Div(a, b) | Op::MatMul(a, b) => {
                vec![a, b]
            }
            Op::Neg(a)
            | Op::Scale(a, _)
            | Op::AddScalar(a)
            | Op::Square(a)
            | Op::Sqrt(a)
            | Op::Sigmoid(a)
            | Op::Tanh(a)
            | Op::Relu(a)
            | Op::LeakyRelu(a, _)
            | Op::Permute(a, _)
            | Op::Reshape(a)
            | Op::BroadcastTo(a)
            | Op::SumTo(a)
            | Op::Unfold1d(a, _)
            | Op::Fold1d(a, _)
            | Op::Unfold2d(a, _)
            | Op::Fold2d(a, _) => vec![a],
        }
    }
}

// Unrolled graphs can be thousands of nodes deep; release them iteratively.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = std::mem::replace(&mut self.op, Op::Leaf).into_parents();
        while let Some(Var(rc)) = pending.pop() {
            if let Ok(mut node) = Rc::try_unwrap(rc) {
                pending.extend(std::mem::replace(&mut node.op, Op::Leaf).into_parents());
            }
        }
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.0.id)
            .field("shape", &self.shape())
            .field("requires_grad", &self.0.requires_grad)
            .finish()
    }
}

fn as_matrix<'a>(op: &str, a: &'a ArrayD<f64>) -> ArrayView2<'a, f64> {
    a.view()
        .into_dimensionality::<Ix2>()
        .unwrap_or_else(|_| panic!("{op}: expected a 2-D operand, got shape {:?}", a.shape()))
}

fn assert_same_shape(op: &str, a: &Var, b: &Var) {
    assert!(
        a.shape() == b.shape(),
        "{op}: shape mismatch {:?} vs {:?}",
        a.shape(),
        b.shape()
    );
}

fn stable_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Var {
    fn make(value: ArrayD<f64>, requires_grad: bool, op: Op) -> Self {
        Var(Rc::new(Node {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            value,
            requires_grad,
            op,
        }))
    }

    fn from_op(value: ArrayD<f64>, op: Op) -> Self {
        if op.parents().iter().any(|p| p.requires_grad()) {
            Self::make(value, true, op)
        } else {
            // Nothing upstream is tracked: keep the value, drop the history.
            Self::make(value, false, Op::Leaf)
        }
    }

    /// A value that never receives gradients.
    pub fn constant(value: ArrayD<f64>) -> Self {
        Self::make(value, false, Op::Leaf)
    }

    /// A leaf that gradients flow into.
    pub fn leaf(value: ArrayD<f64>) -> Self {
        Self::make(value, true, Op::Leaf)
    }

    pub fn scalar(value: f64) -> Self {
        Self::constant(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn value(&self) -> &ArrayD<f64> {
        &self.0.value
    }

    pub fn shape(&self) -> &[usize] {
        self.0.value.shape()
    }

    pub fn len(&self) -> usize {
        self.0.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.value.is_empty()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    /// Same value, no history.
    pub fn detach(&self) -> Var {
        Var::constant(self.0.value.clone())
    }

    /// The single element of a one-element tensor.
    ///
    /// # Panics
    /// If the tensor holds more than one element.
    pub fn item(&self) -> f64 {
        assert_eq!(self.len(), 1, "item: tensor of shape {:?}", self.shape());
        self.0.value.iter().next().copied().unwrap_or(f64::NAN)
    }

    pub fn is_finite(&self) -> bool {
        self.0.value.iter().all(|v| v.is_finite())
    }

    // ----- elementwise -----

    pub fn add(&self, other: &Var) -> Var {
        assert_same_shape("add", self, other);
        Var::from_op(self.value() + other.value(), Op::Add(self.clone(), other.clone()))
    }

    pub fn sub(&self, other: &Var) -> Var {
        assert_same_shape("sub", self, other);
        Var::from_op(self.value() - other.value(), Op::Sub(self.clone(), other.clone()))
    }

    pub fn mul(&self, other: &Var) -> Var {
        assert_same_shape("mul", self, other);
        Var::from_op(self.value() * other.value(), Op::Mul(self.clone(), other.clone()))
    }

    pub fn div(&self, other: &Var) -> Var {
        assert_same_shape("div", self, other);
        Var::from_op(self.value() / other.value(), Op::Div(self.clone(), other.clone()))
    }

    pub fn neg(&self) -> Var {
        Var::from_op(self.value().mapv(|x| -x), Op::Neg(self.clone()))
    }

    pub fn scale(&self, factor: f64) -> Var {
        Var::from_op(self.value().mapv(|x| x * factor), Op::Scale(self.clone(), factor))
    }

    pub fn add_scalar(&self, offset: f64) -> Var {
        Var::from_op(self.value().mapv(|x| x + offset), Op::AddScalar(self.clone()))
    }

    pub fn square(&self) -> Var {
        Var::from_op(self.value().mapv(|x| x * x), Op::Square(self.clone()))
    }

    pub fn sqrt(&self) -> Var {
        Var::from_op(self.value().mapv(f64::sqrt), Op::Sqrt(self.clone()))
    }

    pub fn sigmoid(&self) -> Var {
        Var::from_op(self.value().mapv(stable_sigmoid), Op::Sigmoid(self.clone()))
    }

    pub fn tanh(&self) -> Var {
        Var::from_op(self.value().mapv(f64::tanh), Op::Tanh(self.clone()))
    }

    pub fn relu(&self) -> Var {
        Var::from_op(self.value().mapv(|x| x.max(0.0)), Op::Relu(self.clone()))
    }

    pub fn leaky_relu(&self, slope: f64) -> Var {
        Var::from_op(
            self.value().mapv(|x| if x > 0.0 { x } else { slope * x }),
            Op::LeakyRelu(self.clone(), slope),
        )
    }

    // ----- structural -----

    /// 2-D matrix product.
    pub fn matmul(&self, other: &Var) -> Var {
        let a = as_matrix("matmul", self.value());
        let b = as_matrix("matmul", other.value());
        assert_eq!(
            a.ncols(),
            b.nrows(),
            "matmul: inner dimensions differ ({:?} x {:?})",
            a.shape(),
            b.shape()
        );
        Var::from_op(a.dot(&b).into_dyn(), Op::MatMul(self.clone(), other.clone()))
    }

    pub fn t(&self) -> Var {
        self.permute(&[1, 0])
    }

    pub fn permute(&self, axes: &[usize]) -> Var {
        assert_eq!(axes.len(), self.shape().len(), "permute: axes {axes:?} vs shape {:?}", self.shape());
        let value = self
            .value()
            .view()
            .permuted_axes(axes.to_vec())
            .as_standard_layout()
            .into_owned();
        Var::from_op(value, Op::Permute(self.clone(), axes.to_vec()))
    }

    pub fn reshape(&self, shape: &[usize]) -> Var {
        let flat: Vec<f64> = self.value().iter().copied().collect();
        let value = ArrayD::from_shape_vec(IxDyn(shape), flat).unwrap_or_else(|_| {
            panic!("reshape: cannot view {:?} as {shape:?}", self.shape())
        });
        Var::from_op(value, Op::Reshape(self.clone()))
    }

    /// Broadcasts size-1 axes up to `shape`. Rank must already match.
    pub fn broadcast_to(&self, shape: &[usize]) -> Var {
        assert_eq!(
            self.shape().len(),
            shape.len(),
            "broadcast_to: rank mismatch {:?} -> {shape:?}",
            self.shape()
        );
        let value = self
            .value()
            .broadcast(IxDyn(shape))
            .unwrap_or_else(|| panic!("broadcast_to: cannot broadcast {:?} to {shape:?}", self.shape()))
            .to_owned();
        Var::from_op(value, Op::BroadcastTo(self.clone()))
    }

    /// Sums over the axes where `shape` has size 1, keeping rank.
    pub fn sum_to(&self, shape: &[usize]) -> Var {
        assert_eq!(
            self.shape().len(),
            shape.len(),
            "sum_to: rank mismatch {:?} -> {shape:?}",
            self.shape()
        );
        let mut value = self.value().clone();
        for (axis, (&target, &current)) in shape.iter().zip(self.shape()).enumerate() {
            if target == current {
                continue;
            }
            assert_eq!(target, 1, "sum_to: cannot reduce {:?} to {shape:?}", self.shape());
            value = value.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
        Var::from_op(value, Op::SumTo(self.clone()))
    }

    /// Sum of every element as a rank-0 tensor.
    pub fn sum_all(&self) -> Var {
        let ones = vec![1; self.shape().len()];
        self.sum_to(&ones).reshape(&[])
    }

    pub fn mean(&self) -> Var {
        let n = self.len().max(1) as f64;
        self.sum_all().scale(1.0 / n)
    }

    /// `[B, C, L]` -> `[B*L, C*K]` patches for a same-padded conv.
    pub fn unfold1d(&self, kernel: usize) -> Var {
        Var::from_op(kernels::unfold1d(self.value(), kernel), Op::Unfold1d(self.clone(), kernel))
    }

    pub fn fold1d(&self, shape: &[usize], kernel: usize) -> Var {
        Var::from_op(kernels::fold1d(self.value(), shape, kernel), Op::Fold1d(self.clone(), kernel))
    }

    /// `[B, C, H, W]` -> `[B*H*W, C*K*K]` patches for a same-padded conv.
    pub fn unfold2d(&self, kernel: usize) -> Var {
        Var::from_op(kernels::unfold2d(self.value(), kernel), Op::Unfold2d(self.clone(), kernel))
    }

    pub fn fold2d(&self, shape: &[usize], kernel: usize) -> Var {
        Var::from_op(kernels::fold2d(self.value(), shape, kernel), Op::Fold2d(self.clone(), kernel))
    }

    // ----- differentiation -----

    /// Gradients of `self` with respect to `inputs`.
    ///
    /// With `create_graph`, the returned gradients keep their history and can be
    /// differentiated again. Inputs that do not influence `self` get zeros.
    pub fn grad(&self, inputs: &[&Var], create_graph: bool) -> Vec<Var> {
        let grads = self.backprop(create_graph);
        inputs
            .iter()
            .map(|input| {
                grads
                    .get(&input.id())
                    .cloned()
                    .unwrap_or_else(|| Var::constant(ArrayD::zeros(IxDyn(input.shape()))))
            })
            .collect()
    }

    /// Gradients of `self` with respect to every tracked leaf.
    pub fn backward(&self) -> Gradients {
        let grads = self
            .backprop(false)
            .into_iter()
            .map(|(id, grad)| {
                let value = match Rc::try_unwrap(grad.0) {
                    Ok(mut node) => std::mem::take(&mut node.value),
                    Err(shared) => shared.value.clone(),
                };
                (id, value)
            })
            .collect();
        Gradients(grads)
    }

    fn backprop(&self, create_graph: bool) -> HashMap<usize, Var> {
        let mut grads: HashMap<usize, Var> = HashMap::new();
        if !self.requires_grad() {
            return grads;
        }
        grads.insert(self.id(), Var::constant(ArrayD::ones(IxDyn(self.shape()))));

        for node in self.topological_order().into_iter().rev() {
            let is_leaf = matches!(node.0.op, Op::Leaf);
            let upstream = if is_leaf {
                continue;
            } else {
                match grads.remove(&node.id()) {
                    Some(g) => g,
                    None => continue,
                }
            };
            for (parent, grad) in node.local_grads(&upstream) {
                let grad = if create_graph { grad } else { grad.detach() };
                let merged = match grads.remove(&parent.id()) {
                    Some(existing) => existing.add(&grad),
                    None => grad,
                };
                grads.insert(parent.id(), merged);
            }
        }
        grads
    }

    /// Tracked nodes reachable from `self`, parents before children.
    fn topological_order(&self) -> Vec<Var> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.clone(), false)];

        while let Some((var, expanded)) = stack.pop() {
            if expanded {
                order.push(var);
                continue;
            }
            if !visited.insert(var.id()) {
                continue;
            }
            stack.push((var.clone(), true));
            for parent in var.0.op.parents() {
                if parent.requires_grad() && !visited.contains(&parent.id()) {
                    stack.push((parent.clone(), false));
                }
            }
        }
        order
    }

    /// Vector-Jacobian products for each tracked parent, given the upstream gradient `g`.
    fn local_grads(&self, g: &Var) -> Vec<(Var, Var)> {
        fn one(a: &Var, f: impl FnOnce() -> Var) -> Vec<(Var, Var)> {
            if a.requires_grad() {
                vec![(a.clone(), f())]
            } else {
                Vec::new()
            }
        }
        fn two(
            a: &Var,
            fa: impl FnOnce() -> Var,
            b: &Var,
            fb: impl FnOnce() -> Var,
        ) -> Vec<(Var, Var)> {
            let mut grads = one(a, fa);
            grads.extend(one(b, fb));
            grads
        }
        let mask = |a: &Var, below: f64| {
            Var::constant(a.value().mapv(|x| if x > 0.0 { 1.0 } else { below }))
        };

        match &self.0.op {
            Op::Leaf => Vec::new(),
            Op::Add(a, b) => two(a, || g.clone(), b, || g.clone()),
            Op::Sub(a, b) => two(a, || g.clone(), b, || g.neg()),
            Op::Mul(a, b) => two(a, || g.mul(b), b, || g.mul(a)),
            Op::Div(a, b) => two(a, || g.div(b), b, || g.mul(self).div(b).neg()),
            Op::Neg(a) => one(a, || g.neg()),
            Op::Scale(a, factor) => one(a, || g.scale(*factor)),
            Op::AddScalar(a) => one(a, || g.clone()),
            Op::Square(a) => one(a, || g.mul(a).scale(2.0)),
            Op::Sqrt(a) => one(a, || g.div(&self.scale(2.0))),
            Op::Sigmoid(a) => one(a, || g.mul(&self.mul(&self.neg().add_scalar(1.0)))),
            Op::Tanh(a) => one(a, || g.mul(&self.square().neg().add_scalar(1.0))),
            Op::Relu(a) => one(a, || g.mul(&mask(a, 0.0))),
            Op::LeakyRelu(a, slope) => one(a, || g.mul(&mask(a, *slope))),
            Op::MatMul(a, b) => two(a, || g.matmul(&b.t()), b, || a.t().matmul(g)),
            Op::Permute(a, axes) => one(a, || {
                let mut inverse = vec![0; axes.len()];
                for (i, &axis) in axes.iter().enumerate() {
                    inverse[axis] = i;
                }
                g.permute(&inverse)
            }),
            Op::Reshape(a) => one(a, || g.reshape(a.shape())),
            Op::BroadcastTo(a) => one(a, || g.sum_to(a.shape())),
            Op::SumTo(a) => one(a, || g.broadcast_to(a.shape())),
            Op::Unfold1d(a, kernel) => one(a, || g.fold1d(a.shape(), *kernel)),
            Op::Fold1d(a, kernel) => one(a, || g.unfold1d(*kernel)),
            Op::Unfold2d(a, kernel) => one(a, || g.fold2d(a.shape(), *kernel)),
            Op::Fold2d(a, kernel) => one(a, || g.unfold2d(*kernel)),
        }
    }
}

/// Gradient values keyed by the leaf they belong to.
#[derive(Debug, Default)]
pub struct Gradients(HashMap<usize, ArrayD<f64>>);

impl Gradients {
    pub fn get(&self, var: &Var) -> Option<&ArrayD<f64>> {
        self.0.get(&var.id())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn arr(shape: &[usize], values: &[f64]) -> ArrayD<f64> {
        ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap()
    }

    /// Central finite difference of a scalar function at `x`.
    fn numeric_grad(f: impl Fn(&Var) -> Var, x: &ArrayD<f64>) -> ArrayD<f64> {
        let eps = 1e-6;
        let mut grad = ArrayD::zeros(x.raw_dim());
        for i in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus.as_slice_mut().unwrap()[i] += eps;
            minus.as_slice_mut().unwrap()[i] -= eps;
            let fp = f(&Var::constant(plus)).item();
            let fm = f(&Var::constant(minus)).item();
            grad.as_slice_mut().unwrap()[i] = (fp - fm) / (2.0 * eps);
        }
        grad
    }

    fn assert_close(a: &ArrayD<f64>, b: &ArrayD<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_constant_graph_is_not_tracked() {
        let a = Var::constant(arr(&[2], &[1.0, 2.0]));
        let b = a.mul(&a).sigmoid();
        assert!(!b.requires_grad());
        assert!(b.backward().is_empty());
    }

    #[test]
    fn test_elementwise_chain_matches_finite_difference() {
        let f = |x: &Var| {
            let y = x.tanh().mul(&x.sigmoid()).add(&x.square().scale(0.5));
            y.div(&x.square().add_scalar(1.0).sqrt()).leaky_relu(0.2).sum_all()
        };
        let x0 = arr(&[4], &[-1.5, -0.2, 0.3, 2.0]);
        let x = Var::leaf(x0.clone());
        let grads = f(&x).backward();
        assert_close(grads.get(&x).unwrap(), &numeric_grad(f, &x0), 1e-5);
    }

    #[test]
    fn test_matmul_and_broadcast_gradients() {
        let w0 = arr(&[3, 2], &[0.1, -0.4, 0.7, 0.2, -0.3, 0.5]);
        let x = Var::constant(arr(&[2, 3], &[1.0, 2.0, -1.0, 0.5, 0.0, 3.0]));
        let b = Var::constant(arr(&[1, 2], &[0.05, -0.05]));
        let f = |w: &Var| {
            let y = x.matmul(w);
            y.add(&b.broadcast_to(y.shape())).relu().mean()
        };
        let w = Var::leaf(w0.clone());
        let grads = f(&w).backward();
        assert_close(grads.get(&w).unwrap(), &numeric_grad(f, &w0), 1e-5);
    }

    #[test]
    fn test_conv_patches_gradients() {
        let x0 = ArrayD::from_shape_fn(IxDyn(&[1, 2, 3, 3]), |d| {
            ((d[1] * 9 + d[2] * 3 + d[3]) as f64 * 0.37).sin()
        });
        let kernel = Var::constant(ArrayD::from_shape_fn(IxDyn(&[18, 2]), |d| {
            ((d[0] + d[1]) as f64 * 0.11).cos()
        }));
        let f = |x: &Var| {
            let y = x.unfold2d(3).matmul(&kernel);
            y.reshape(&[1, 3, 3, 2]).permute(&[0, 3, 1, 2]).tanh().sum_all()
        };
        let x = Var::leaf(x0.clone());
        let grads = f(&x).backward();
        assert_close(grads.get(&x).unwrap(), &numeric_grad(f, &x0), 1e-5);
    }

    #[test]
    fn test_second_order_gradient_through_create_graph() {
        // f(x) = sum(x^3); df/dx = 3x^2; d/dx sum((df/dx)^2) = 36 x^3
        let x0 = arr(&[3], &[0.5, -1.0, 2.0]);
        let x = Var::leaf(x0.clone());
        let f = x.square().mul(&x).sum_all();
        let dfdx = f.grad(&[&x], true).remove(0);
        assert!(dfdx.requires_grad());
        assert_close(dfdx.value(), &x0.mapv(|v| 3.0 * v * v), 1e-12);

        let penalty = dfdx.square().sum_all();
        let second = penalty.backward();
        assert_close(second.get(&x).unwrap(), &x0.mapv(|v| 36.0 * v.powi(3)), 1e-9);
    }

    #[test]
    fn test_shared_subexpression_accumulates() {
        let x = Var::leaf(arr(&[2], &[1.0, 3.0]));
        let y = x.add(&x).add(&x.scale(3.0)).sum_all();
        let grads = y.backward();
        assert_close(grads.get(&x).unwrap(), &arr(&[2], &[5.0, 5.0]), 1e-12);
    }

    #[test]
    fn test_unreached_input_gets_zero_gradient() {
        let x = Var::leaf(arr(&[2], &[1.0, 2.0]));
        let unrelated = Var::leaf(arr(&[3], &[0.0, 0.0, 0.0]));
        let g = x.square().sum_all().grad(&[&unrelated], false).remove(0);
        assert_eq!(g.shape(), &[3]);
        assert!(g.value().iter().all(|v| *v == 0.0));
    }
}
