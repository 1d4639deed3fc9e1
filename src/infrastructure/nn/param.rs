use crate::infrastructure::autograd::Var;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a parameter tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(u64);

impl ParamId {
    pub fn fresh() -> Self {
        Self(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A learnable tensor. Stored as a plain array so models are `Send` and
/// serializable; bound into a [`Graph`] for each forward pass.
#[derive(Debug, Serialize, Deserialize)]
pub struct Param {
    #[serde(skip, default = "ParamId::fresh")]
    id: ParamId,
    value: ArrayD<f64>,
}

impl Clone for Param {
    fn clone(&self) -> Self {
        Self {
            id: ParamId::fresh(),
            value: self.value.clone(),
        }
    }
}

impl Param {
    pub fn new(value: ArrayD<f64>) -> Self {
        Self {
            id: ParamId::fresh(),
            value,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    /// `U(-bound, bound)` initialisation.
    pub fn uniform<R: Rng + ?Sized>(shape: &[usize], bound: f64, rng: &mut R) -> Self {
        Self::new(ArrayD::from_shape_fn(IxDyn(shape), |_| {
            rng.random_range(-bound..bound)
        }))
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn value(&self) -> &ArrayD<f64> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Anything that owns parameters in a fixed order.
pub trait Module {
    fn params(&self) -> Vec<&Param>;

    fn params_mut(&mut self) -> Vec<&mut Param>;

    fn num_parameters(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }
}

/// Binds parameters into one computation graph.
///
/// A tracked graph turns each parameter into a gradient leaf; a frozen graph binds
/// constants, so nothing downstream of those parameters is ever recorded.
/// A parameter bound twice (e.g. a recurrent cell unrolled over time) maps to the
/// same leaf so its gradient accumulates.
pub struct Graph {
    tracking: bool,
    bound: RefCell<HashMap<ParamId, Var>>,
}

impl Graph {
    pub fn tracked() -> Self {
        Self {
            tracking: true,
            bound: RefCell::new(HashMap::new()),
        }
    }

    pub fn frozen() -> Self {
        Self {
            tracking: false,
            bound: RefCell::new(HashMap::new()),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn param(&self, param: &Param) -> Var {
        if let Some(var) = self.bound.borrow().get(&param.id) {
            return var.clone();
        }
        let var = if self.tracking {
            Var::leaf(param.value.clone())
        } else {
            Var::constant(param.value.clone())
        };
        self.bound.borrow_mut().insert(param.id, var.clone());
        var
    }

    /// Backpropagates `loss` and collects gradients for the parameters bound here.
    pub fn gradients(&self, loss: &Var) -> ParamGrads {
        let grads = loss.backward();
        let by_param = self
            .bound
            .borrow()
            .iter()
            .filter_map(|(id, var)| grads.get(var).map(|g| (*id, g.clone())))
            .collect();
        ParamGrads(by_param)
    }
}

/// Gradient arrays keyed by parameter.
#[derive(Debug, Default)]
pub struct ParamGrads(HashMap<ParamId, ArrayD<f64>>);

impl ParamGrads {
    pub fn get(&self, param: &Param) -> Option<&ArrayD<f64>> {
        self.0.get(&param.id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all_finite(&self) -> bool {
        self.0.values().all(|g| g.iter().all(|v| v.is_finite()))
    }
}
