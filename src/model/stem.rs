//! Stem: strided convolutions taking the input to 1/8 resolution.

use super::{scoped, NormSettings};
use crate::nn::{BatchNorm2d, Conv2d, Conv2dConfig, LayerError, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// `(stride, narrow)` of the five stem units. Narrow units output the stem
/// width, the others the stem output width.
const UNITS: [(usize, bool); 5] = [(2, true), (2, false), (1, false), (2, false), (1, false)];

/// Five conv3x3 -> BN -> ReLU units with strides 2, 2, 1, 2, 1.
#[derive(Debug, Clone)]
pub struct Stem {
    units: Vec<(Conv2d, BatchNorm2d)>,
}

impl Stem {
    /// `in_channels -> stem_channels -> out_channels`, registered as
    /// `{prefix}.conv_{i}` and `{prefix}.bn_{i}` for `i` in 1..=5.
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        prefix: &str,
        in_channels: usize,
        stem_channels: usize,
        out_channels: usize,
        norm: NormSettings,
    ) -> Result<Self, LayerError> {
        let mut units = Vec::with_capacity(UNITS.len());
        let mut channels = in_channels;

        for (i, &(stride, narrow)) in UNITS.iter().enumerate() {
            let out = if narrow { stem_channels } else { out_channels };
            let config = Conv2dConfig::square(channels, out, 3)
                .with_stride((stride, stride))
                .with_padding((1, 1));
            let conv = Conv2d::from_config(ctx, &scoped(prefix, &format!("conv_{}", i + 1)), config)?;
            let bn = norm.batch_norm(ctx, &scoped(prefix, &format!("bn_{}", i + 1)), out);
            units.push((conv, bn));
            channels = out;
        }

        Ok(Self { units })
    }

    /// Spatial size after the stem for an input of size `len`.
    pub fn output_len(len: usize) -> usize {
        UNITS.iter().fold(len, |l, &(stride, _)| match l {
            0 => 0,
            l => (l - 1) / stride + 1,
        })
    }
}

impl Module for Stem {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.units
            .iter()
            .fold(inputs.clone(), |x, (conv, bn)| bn.forward(&conv.forward(&x)).relu())
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.units
            .iter()
            .flat_map(|(conv, bn)| conv.parameters().into_iter().chain(bn.parameters()))
            .collect()
    }

    fn buffers(&self) -> Vec<Tensor> {
        self.units.iter().flat_map(|(_, bn)| bn.buffers()).collect()
    }
}
