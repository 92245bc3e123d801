//! The FSFNet network, declared layer by layer into an ASG.
//!
//! Every component registers its parameters under the dotted names of the
//! reference module tree, e.g. `features.encoder.conv1_8.conv3x3_1.weight`.

pub mod encoder;
pub mod fsf;
pub mod fsfnet;
pub mod stem;

pub use encoder::{Encoder, EncoderOutput};
pub use fsf::{FsfBlock, FsfKind};
pub use fsfnet::{Classifier, Features, FsfNet, FsfNetOutputs, SigmoidHead};
pub use stem::Stem;

use crate::nn::BatchNorm2d;
use crate::tensor::GraphContext;
use std::cell::RefCell;
use std::rc::Rc;

/// Batch-norm settings shared by every layer of the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormSettings {
    pub eps: f32,
    pub momentum: f32,
}

impl NormSettings {
    pub(crate) fn batch_norm(
        &self,
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        channels: usize,
    ) -> BatchNorm2d {
        BatchNorm2d::new(ctx, name, channels)
            .with_eps(self.eps)
            .with_momentum(self.momentum)
    }
}

/// `prefix.name`, or `name` alone at the root.
pub(crate) fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
