//! Module defining the core `Module` trait for all neural network layers.

use crate::tensor::Tensor;

/// Common interface of every layer.
///
/// In the graph-based architecture a `Module` is a component that adds a
/// specific pattern of operations and parameters to the graph.
pub trait Module {
    /// Performs a "symbolic" forward pass, building the corresponding part of the graph.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters owned by this module, in declaration order.
    fn parameters(&self) -> Vec<Tensor>;

    /// Non-trainable state (running statistics) owned by this module.
    fn buffers(&self) -> Vec<Tensor> {
        Vec::new()
    }
}
