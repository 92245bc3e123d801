//! Encoder: stem plus three cascades of FSF blocks.

use super::{scoped, FsfBlock, FsfKind, NormSettings, Stem};
use crate::config::{FsfNetConfig, StageConfig};
use crate::nn::{BatchNorm2d, Conv2d, Conv2dConfig, LayerError, Module, Resize};
use crate::tensor::{GraphContext, Tensor};
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

/// The three taps of the encoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// After the rate-8 cascade.
    pub out_8: Tensor,
    /// After the rate-16 cascade.
    pub out_16: Tensor,
    /// After the rate-32 cascade (and the prediction conv, when present),
    /// resized to the configured output size.
    pub out_32: Tensor,
}

/// Halves the map, then 1x1 conv -> BN -> ReLU to widen the channels.
#[derive(Debug, Clone)]
struct Transition {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl Transition {
    fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        conv_name: &str,
        bn_name: &str,
        in_channels: usize,
        out_channels: usize,
        norm: NormSettings,
    ) -> Result<Self, LayerError> {
        let conv = Conv2d::from_config(ctx, conv_name, Conv2dConfig::square(in_channels, out_channels, 1))?;
        let bn = norm.batch_norm(ctx, bn_name, out_channels);
        Ok(Self { conv, bn })
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let x = Resize::downscale(2).forward(x);
        self.bn.forward(&self.conv.forward(&x)).relu()
    }
}

fn cascade(
    ctx: &Rc<RefCell<GraphContext>>,
    prefix: &str,
    kind: FsfKind,
    rate: usize,
    stage: &StageConfig,
    norm: NormSettings,
) -> Result<Vec<FsfBlock>, LayerError> {
    stage
        .blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            FsfBlock::new(
                ctx,
                &scoped(prefix, &format!("conv{}_{}", i + 1, rate)),
                kind,
                stage.channels,
                stage.channels,
                block.dropout,
                block.dilation,
                stage.kernel_size,
                norm,
            )
        })
        .collect()
}

fn run_cascade(blocks: &[FsfBlock], x: Tensor) -> Tensor {
    blocks.iter().fold(x, |h, block| block.forward(&h))
}

#[derive(Debug, Clone)]
pub struct Encoder {
    stem: Stem,
    blocks_8: Vec<FsfBlock>,
    to_16: Transition,
    blocks_16: Vec<FsfBlock>,
    to_32: Transition,
    blocks_32: Vec<FsfBlock>,
    output_conv: Option<Conv2d>,
    output_size: (usize, usize),
}

impl Encoder {
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        prefix: &str,
        config: &FsfNetConfig,
    ) -> Result<Self, LayerError> {
        let norm = NormSettings { eps: config.bn_eps, momentum: config.bn_momentum };
        let (c8, c16, c32) = (config.stage_8.channels, config.stage_16.channels, config.stage_32.channels);

        let stem = Stem::new(
            ctx,
            &scoped(prefix, "stem"),
            config.in_channels,
            config.stem_channels,
            c8,
            norm,
        )?;
        let blocks_8 = cascade(ctx, prefix, FsfKind::Rate8, 8, &config.stage_8, norm)?;
        let to_16 = Transition::new(
            ctx,
            &scoped(prefix, "conv1x1_8_16_channel"),
            &scoped(prefix, "bn_conv1x1_8_16_channel"),
            c8,
            c16,
            norm,
        )?;
        let blocks_16 = cascade(ctx, prefix, FsfKind::Rate16, 16, &config.stage_16, norm)?;
        let to_32 = Transition::new(
            ctx,
            &scoped(prefix, "conv1x1_32_64_channel"),
            &scoped(prefix, "bn_conv1x1_32_64_channel"),
            c16,
            c32,
            norm,
        )?;
        let blocks_32 = cascade(ctx, prefix, FsfKind::Rate32, 32, &config.stage_32, norm)?;

        let output_conv = config
            .encoder_classes
            .map(|classes| {
                Conv2d::from_config(ctx, &scoped(prefix, "output_conv"), Conv2dConfig::square(c32, classes, 1))
            })
            .transpose()?;

        debug!(
            "encoder '{}': {} + {} + {} FSF blocks on {}/{}/{} channels",
            prefix,
            blocks_8.len(),
            blocks_16.len(),
            blocks_32.len(),
            c8,
            c16,
            c32
        );

        Ok(Self {
            stem,
            blocks_8,
            to_16,
            blocks_16,
            to_32,
            blocks_32,
            output_conv,
            output_size: config.output_size,
        })
    }

    /// Declares the full encoder pass and returns all three taps.
    pub fn forward_all(&self, inputs: &Tensor) -> EncoderOutput {
        let out_8 = run_cascade(&self.blocks_8, self.stem.forward(inputs));
        let out_16 = run_cascade(&self.blocks_16, self.to_16.forward(&out_8));
        let mut out_32 = run_cascade(&self.blocks_32, self.to_32.forward(&out_16));

        if let Some(conv) = &self.output_conv {
            out_32 = conv.forward(&out_32);
        }
        let (h, w) = self.output_size;
        let out_32 = Resize::fixed(h, w).forward(&out_32);

        EncoderOutput { out_8, out_16, out_32 }
    }

    fn blocks(&self) -> impl Iterator<Item = &FsfBlock> {
        self.blocks_8.iter().chain(&self.blocks_16).chain(&self.blocks_32)
    }
}

impl Module for Encoder {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.forward_all(inputs).out_32
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.stem.parameters();
        params.extend(self.blocks().flat_map(|b| b.parameters()));
        for t in [&self.to_16, &self.to_32] {
            params.extend(t.conv.parameters());
            params.extend(t.bn.parameters());
        }
        if let Some(conv) = &self.output_conv {
            params.extend(conv.parameters());
        }
        params
    }

    fn buffers(&self) -> Vec<Tensor> {
        let mut buffers = self.stem.buffers();
        buffers.extend(self.blocks().flat_map(|b| b.buffers()));
        buffers.extend(self.to_16.bn.buffers());
        buffers.extend(self.to_32.bn.buffers());
        buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_parameter_names() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let encoder = Encoder::new(&ctx, "features.encoder", &FsfNetConfig::new(3)).unwrap();

        let ctx = ctx.borrow();
        let names: Vec<_> = ctx.parameter_specs().iter().map(|s| s.name.as_str()).collect();
        for expected in [
            "features.encoder.stem.conv_1.weight",
            "features.encoder.conv4_8.conv3x3_2.bias",
            "features.encoder.conv1x1_8_16_channel.weight",
            "features.encoder.bn_conv1x1_8_16_channel.running_mean",
            "features.encoder.conv2_16.conv1x3_1.weight",
            "features.encoder.conv1x1_32_64_channel.bias",
            "features.encoder.conv4_32.bn2.running_var",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
        assert!(!names.iter().any(|n| n.contains("output_conv")));

        let total = encoder.parameters().len() + encoder.buffers().len();
        assert_eq!(total, names.len());
    }

    #[test]
    fn test_encoder_prediction_conv() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let config = FsfNetConfig::new(3).with_encoder_classes(5);
        Encoder::new(&ctx, "enc", &config).unwrap();
        let ctx = ctx.borrow();
        let spec = ctx
            .parameter_specs()
            .iter()
            .find(|s| s.name == "enc.output_conv.weight")
            .unwrap();
        assert_eq!(spec.shape, vec![5, 128, 1, 1]);
    }
}
