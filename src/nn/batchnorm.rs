//! Batch normalization over the channel axis of NCHW tensors.
//!
//! The layer owns the affine parameters (`weight`, `bias`) and the running
//! statistics (`running_mean`, `running_var`). Which statistics are used is a
//! property of the execution, not of the graph: the backend normalizes with
//! batch statistics in training mode and with running statistics in eval mode.

use crate::nn::Module;
use crate::tensor::{GraphContext, Init, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Default epsilon.
pub const DEFAULT_EPS: f32 = 1e-5;

/// Default momentum for updating running statistics.
pub const DEFAULT_MOMENTUM: f32 = 0.1;

/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`, per channel.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    /// Learned scale, `[C]`.
    pub gamma: Tensor,
    /// Learned shift, `[C]`.
    pub beta: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
    pub name: String,
}

impl BatchNorm2d {
    /// Registers `{name}.weight`, `{name}.bias`, `{name}.running_mean` and
    /// `{name}.running_var`.
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, num_features: usize) -> Self {
        let shape = vec![num_features];
        let gamma = Tensor::new_parameter(ctx, &format!("{}.weight", name), shape.clone(), Init::Ones);
        let beta = Tensor::new_parameter(ctx, &format!("{}.bias", name), shape.clone(), Init::Zeros);
        let running_mean =
            Tensor::new_buffer(ctx, &format!("{}.running_mean", name), shape.clone(), Init::Zeros);
        let running_var = Tensor::new_buffer(ctx, &format!("{}.running_var", name), shape, Init::Ones);

        Self {
            gamma,
            beta,
            running_mean,
            running_var,
            num_features,
            eps: DEFAULT_EPS,
            momentum: DEFAULT_MOMENTUM,
            name: name.to_string(),
        }
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        x.batch_norm2d(
            &self.gamma,
            &self.beta,
            &self.running_mean,
            &self.running_var,
            self.eps,
            self.momentum,
        )
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    fn buffers(&self) -> Vec<Tensor> {
        vec![self.running_mean.clone(), self.running_var.clone()]
    }
}
