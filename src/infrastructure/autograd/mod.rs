//! Reverse-mode automatic differentiation over `ndarray` arrays.
//!
//! Every backward rule is written with the same differentiable operations as the
//! forward pass. A gradient taken with `create_graph = true` is therefore an
//! ordinary [`Var`] that can be differentiated again, which is what the WGAN-GP
//! gradient penalty relies on.
//!
//! Shape errors inside the engine are programmer errors and panic with a message,
//! the same way `ndarray` arithmetic does. Callers validate user-facing shapes
//! before building a graph.

mod kernels;
mod var;

pub use var::{Gradients, Var};
