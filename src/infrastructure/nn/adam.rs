//! Adam optimizer.
//!
//! ```text
//! m = beta1 * m + (1 - beta1) * g
//! v = beta2 * v + (1 - beta2) * g^2
//! w -= lr * (m / (1 - beta1^t)) / (sqrt(v / (1 - beta2^t)) + eps)
//! ```

use super::param::{Param, ParamGrads};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Settings used for both WGAN-GP players.
    pub fn wgan_gp() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.5,
            beta2: 0.9,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f64>,
    v: ArrayD<f64>,
}

/// Adam state for one parameter set. Moments are matched to parameters by position,
/// so the same `Module::params_mut` order must be passed on every step.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    timestep: u64,
    moments: Vec<Moments>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            timestep: 0,
            moments: Vec::new(),
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn step(&mut self, params: Vec<&mut Param>, grads: &ParamGrads) {
        if self.moments.len() != params.len() {
            self.moments = params
                .iter()
                .map(|p| Moments {
                    m: ArrayD::zeros(IxDyn(p.shape())),
                    v: ArrayD::zeros(IxDyn(p.shape())),
                })
                .collect();
        }

        self.timestep += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.timestep as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.timestep as i32);

        for (param, slot) in params.into_iter().zip(self.moments.iter_mut()) {
            let Some(grad) = grads.get(param) else {
                continue;
            };
            Zip::from(param.value_mut())
                .and(&mut slot.m)
                .and(&mut slot.v)
                .and(grad)
                .for_each(|w, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias_correction1;
                    let v_hat = *v / bias_correction2;
                    *w -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::nn::param::Graph;

    #[test]
    fn test_adam_minimises_quadratic() {
        let mut p = Param::new(ArrayD::from_elem(IxDyn(&[3]), 4.0));
        let mut adam = Adam::new(AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        });

        for _ in 0..300 {
            let graph = Graph::tracked();
            let loss = graph.param(&p).square().sum_all();
            let grads = graph.gradients(&loss);
            adam.step(vec![&mut p], &grads);
        }

        assert_eq!(adam.timestep(), 300);
        assert!(p.value().iter().all(|v| v.abs() < 0.1));
    }

    #[test]
    fn test_missing_gradient_leaves_param_untouched() {
        let mut p = Param::new(ArrayD::from_elem(IxDyn(&[2]), 1.0));
        let mut adam = Adam::new(AdamConfig::wgan_gp());
        adam.step(vec![&mut p], &ParamGrads::default());
        assert!(p.value().iter().all(|v| *v == 1.0));
    }
}
