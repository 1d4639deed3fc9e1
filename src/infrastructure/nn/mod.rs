//! Layers, parameters and optimizers on top of the autograd engine.

pub mod adam;
pub mod layers;
pub mod param;

pub use adam::{Adam, AdamConfig};
pub use layers::{dropout, Conv1d, Conv2d, LayerNorm, Linear};
pub use param::{Graph, Module, Param, ParamGrads, ParamId};
