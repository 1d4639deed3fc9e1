// Reverse-mode automatic differentiation over ndarray
pub mod autograd;

// Layers, parameters and optimizers built on autograd
pub mod nn;

// CSV price loading
pub mod market_data;

pub mod observability;

// Ensemble checkpoints
pub mod persistence;
