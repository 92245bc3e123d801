//! # Neural Network Layers Module
//!
//! Building blocks for the network. Each "layer" is a constructor that adds a
//! specific pattern of nodes (operations, parameters, buffers) to the ASG.
//!
//! ## Available Layers
//!
//! - [`Conv2d`]: 2D convolution with stride, padding, dilation and groups
//! - [`BatchNorm2d`]: per-channel batch normalization with running statistics
//! - [`SpatialDropout`]: channel-wise dropout for feature maps
//! - [`Resize`]: bilinear resizing
//! - [`AvgPool2d`]: average pooling
//! - [`ReLU`], [`Sigmoid`]: activations
//!
//! ## Example
//!
//! ```ignore
//! use fsfnet::nn::{Conv2d, Conv2dConfig, Module, ReLU};
//! use fsfnet::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let conv = Conv2d::from_config(&ctx, "conv1", Conv2dConfig::square(3, 32, 3))?;
//!
//! let x = Tensor::new_input(&ctx, "input");
//! let h = ReLU.forward(&conv.forward(&x));
//! ```

pub mod activations;
pub mod batchnorm;
pub mod conv;
pub mod dropout;
pub mod interpolate;
pub mod module;
pub mod pooling;

pub use activations::{ReLU, Sigmoid};
pub use batchnorm::BatchNorm2d;
pub use conv::{Conv2d, Conv2dConfig};
pub use dropout::SpatialDropout;
pub use interpolate::Resize;
pub use module::Module;
pub use pooling::AvgPool2d;

use thiserror::Error;

/// Errors raised while declaring layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Invalid convolution configuration: {0}")]
    InvalidConv(String),

    #[error("Dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f32),

    #[error("Residual block '{name}' needs matching channels, got {in_channels} -> {out_channels}")]
    ResidualChannelMismatch {
        name: String,
        in_channels: usize,
        out_channels: usize,
    },
}
