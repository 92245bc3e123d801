//! FSF residual blocks.
//!
//! Every block halves the spatial size of its input, refines the smaller map
//! with a short convolution body, resizes the result back to the input size
//! and adds it to the input:
//!
//! ```text
//! x -> downscale(2) -> body -> resize_like(x) -> [dropout] -> + x -> relu
//! ```
//!
//! The three variants differ only in their body.

use super::{scoped, NormSettings};
use crate::nn::{BatchNorm2d, Conv2d, Conv2dConfig, LayerError, Module, Resize, SpatialDropout};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Which body an FSF block uses, named after its downsampling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsfKind {
    /// Two full `k x k` convolutions.
    Rate8,
    /// Factorized `k x 1` / `1 x k` convolutions, then a dilated depthwise one.
    Rate16,
    /// Two pointwise convolutions, then a dilated depthwise one.
    Rate32,
}

#[derive(Debug, Clone)]
enum Body {
    Plain {
        conv3x3_1: Conv2d,
        bn1: BatchNorm2d,
        conv3x3_2: Conv2d,
        bn2: BatchNorm2d,
    },
    Factorized {
        conv3x1_0: Conv2d,
        conv1x3_1: Conv2d,
        bn1: BatchNorm2d,
        conv3x3_2: Conv2d,
        bn2: BatchNorm2d,
    },
}

/// Residual refinement block.
#[derive(Debug, Clone)]
pub struct FsfBlock {
    pub kind: FsfKind,
    pub dilation: usize,
    body: Body,
    dropout: SpatialDropout,
}

impl FsfBlock {
    /// Declares the block's layers under `name`.
    ///
    /// `dilation` is ignored by `Rate8`. Fails if the channel counts differ,
    /// since the residual sum needs them equal.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        name: &str,
        kind: FsfKind,
        in_channels: usize,
        out_channels: usize,
        dropout: f32,
        dilation: usize,
        kernel_size: usize,
        norm: NormSettings,
    ) -> Result<Self, LayerError> {
        if in_channels != out_channels {
            return Err(LayerError::ResidualChannelMismatch {
                name: name.to_string(),
                in_channels,
                out_channels,
            });
        }
        let dropout = SpatialDropout::new(dropout)?;
        let k = kernel_size;
        let layer = |suffix: &str| scoped(name, suffix);

        let body = match kind {
            FsfKind::Rate8 => Body::Plain {
                conv3x3_1: Conv2d::from_config(
                    ctx,
                    &layer("conv3x3_1"),
                    Conv2dConfig::square(in_channels, out_channels, k).with_padding((1, 1)),
                )?,
                bn1: norm.batch_norm(ctx, &layer("bn1"), out_channels),
                conv3x3_2: Conv2d::from_config(
                    ctx,
                    &layer("conv3x3_2"),
                    Conv2dConfig::square(out_channels, out_channels, k).with_padding((1, 1)),
                )?,
                bn2: norm.batch_norm(ctx, &layer("bn2"), out_channels),
            },
            FsfKind::Rate16 | FsfKind::Rate32 => {
                let (first, second) = if kind == FsfKind::Rate16 {
                    (
                        Conv2dConfig::new(in_channels, out_channels, (k, 1)).with_padding((1, 0)),
                        Conv2dConfig::new(out_channels, out_channels, (1, k)).with_padding((0, 1)),
                    )
                } else {
                    (
                        Conv2dConfig::square(in_channels, out_channels, 1),
                        Conv2dConfig::square(out_channels, out_channels, 1),
                    )
                };
                let depthwise = Conv2dConfig::square(out_channels, out_channels, k)
                    .with_padding((dilation, dilation))
                    .with_dilation((dilation, dilation))
                    .with_groups(out_channels);

                Body::Factorized {
                    conv3x1_0: Conv2d::from_config(ctx, &layer("conv3x1_0"), first)?,
                    conv1x3_1: Conv2d::from_config(ctx, &layer("conv1x3_1"), second)?,
                    bn1: norm.batch_norm(ctx, &layer("bn1"), out_channels),
                    conv3x3_2: Conv2d::from_config(ctx, &layer("conv3x3_2"), depthwise)?,
                    bn2: norm.batch_norm(ctx, &layer("bn2"), out_channels),
                }
            }
        };

        Ok(Self { kind, dilation, body, dropout })
    }

    pub fn dropout(&self) -> f32 {
        self.dropout.p
    }

    fn layers(&self) -> (Vec<&Conv2d>, Vec<&BatchNorm2d>) {
        match &self.body {
            Body::Plain { conv3x3_1, bn1, conv3x3_2, bn2 } => {
                (vec![conv3x3_1, conv3x3_2], vec![bn1, bn2])
            }
            Body::Factorized { conv3x1_0, conv1x3_1, bn1, conv3x3_2, bn2 } => {
                (vec![conv3x1_0, conv1x3_1, conv3x3_2], vec![bn1, bn2])
            }
        }
    }
}

impl Module for FsfBlock {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let x = Resize::downscale(2).forward(inputs);

        let y = match &self.body {
            Body::Plain { conv3x3_1, bn1, conv3x3_2, bn2 } => {
                let h = bn1.forward(&conv3x3_1.forward(&x)).relu();
                bn2.forward(&conv3x3_2.forward(&h))
            }
            Body::Factorized { conv3x1_0, conv1x3_1, bn1, conv3x3_2, bn2 } => {
                let h = conv3x1_0.forward(&x).relu();
                let h = bn1.forward(&conv1x3_1.forward(&h)).relu();
                bn2.forward(&conv3x3_2.forward(&h))
            }
        };

        let y = self.dropout.forward(&y.resize_like(inputs));
        (&y + inputs).relu()
    }

    fn parameters(&self) -> Vec<Tensor> {
        let (convs, bns) = self.layers();
        convs
            .into_iter()
            .flat_map(|c| c.parameters())
            .chain(bns.into_iter().flat_map(|b| b.parameters()))
            .collect()
    }

    fn buffers(&self) -> Vec<Tensor> {
        let (_, bns) = self.layers();
        bns.into_iter().flat_map(|b| b.buffers()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{Asg, NodeId, NodeType, ResizeTarget};

    const NORM: NormSettings = NormSettings { eps: 1e-3, momentum: 0.1 };

    fn names(ctx: &Rc<RefCell<GraphContext>>) -> Vec<String> {
        ctx.borrow().parameter_specs().iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_rate8_layers() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let block = FsfBlock::new(&ctx, "conv1_8", FsfKind::Rate8, 64, 64, 0.01, 1, 3, NORM).unwrap();
        let names = names(&ctx);
        assert!(names.contains(&"conv1_8.conv3x3_1.weight".to_string()));
        assert!(names.contains(&"conv1_8.bn2.running_mean".to_string()));
        assert!(!names.iter().any(|n| n.contains("conv3x1_0")));
        assert_eq!(block.parameters().len(), 8);
        assert_eq!(block.buffers().len(), 4);
    }

    #[test]
    fn test_rate16_and_rate32_weight_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        FsfBlock::new(&ctx, "b16", FsfKind::Rate16, 96, 96, 0.05, 4, 3, NORM).unwrap();
        FsfBlock::new(&ctx, "b32", FsfKind::Rate32, 128, 128, 0.05, 8, 1, NORM).unwrap();

        let ctx = ctx.borrow();
        let shape = |name: &str| {
            ctx.parameter_specs().iter().find(|s| s.name == name).unwrap().shape.clone()
        };
        assert_eq!(shape("b16.conv3x1_0.weight"), vec![96, 96, 3, 1]);
        assert_eq!(shape("b16.conv1x3_1.weight"), vec![96, 96, 1, 3]);
        assert_eq!(shape("b16.conv3x3_2.weight"), vec![96, 1, 3, 3]);
        assert_eq!(shape("b32.conv3x1_0.weight"), vec![128, 128, 1, 1]);
        assert_eq!(shape("b32.conv3x3_2.weight"), vec![128, 1, 1, 1]);
    }

    #[test]
    fn test_residual_channel_mismatch() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let err = FsfBlock::new(&ctx, "bad", FsfKind::Rate16, 64, 96, 0.0, 1, 3, NORM).unwrap_err();
        assert_eq!(
            err,
            LayerError::ResidualChannelMismatch { name: "bad".to_string(), in_channels: 64, out_channels: 96 }
        );
    }

    #[test]
    fn test_forward_ends_in_residual_relu() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let block = FsfBlock::new(&ctx, "b", FsfKind::Rate32, 8, 8, 0.0, 2, 1, NORM).unwrap();
        let y = block.forward(&x);

        let graph = ctx.borrow().main_graph().clone();
        let add = match graph.get_node(y.node_id).unwrap().node_type {
            NodeType::ReLU(add) => add,
            ref other => panic!("unexpected node {:?}", other),
        };
        match graph.get_node(add).unwrap().node_type {
            NodeType::Add(_, rhs) => assert_eq!(rhs, x.node_id),
            ref other => panic!("unexpected node {:?}", other),
        }
        // p = 0 adds no dropout node.
        assert!(!graph.nodes.values().any(|n| matches!(n.node_type, NodeType::Dropout2d { .. })));
    }

    #[test]
    fn test_invalid_dropout_registers_nothing() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let err = FsfBlock::new(&ctx, "bad", FsfKind::Rate8, 8, 8, 1.0, 1, 3, NORM).unwrap_err();
        assert_eq!(err, LayerError::InvalidDropout(1.0));
        assert!(ctx.borrow().parameter_specs().is_empty());
    }

    // --- Graph walks from the block output back to its input ---

    fn node(graph: &Asg, id: NodeId) -> NodeType {
        graph.get_node(id).unwrap().node_type.clone()
    }

    fn state_name(graph: &Asg, id: NodeId) -> String {
        match node(graph, id) {
            NodeType::Parameter { name } | NodeType::Buffer { name } => name,
            other => panic!("expected a parameter, found {:?}", other),
        }
    }

    fn relu_input(graph: &Asg, id: NodeId) -> NodeId {
        match node(graph, id) {
            NodeType::ReLU(input) => input,
            other => panic!("expected ReLU, found {:?}", other),
        }
    }

    fn bn_input(graph: &Asg, id: NodeId, layer: &str) -> NodeId {
        match node(graph, id) {
            NodeType::BatchNorm2d { input, gamma, running_var, .. } => {
                assert_eq!(state_name(graph, gamma), format!("{}.weight", layer));
                assert_eq!(state_name(graph, running_var), format!("{}.running_var", layer));
                input
            }
            other => panic!("expected {}, found {:?}", layer, other),
        }
    }

    /// Returns the conv input, its groups and its dilation.
    fn conv_input(graph: &Asg, id: NodeId, layer: &str) -> (NodeId, usize, (usize, usize)) {
        match node(graph, id) {
            NodeType::Conv2d { input, weight, bias, groups, dilation, .. } => {
                assert_eq!(state_name(graph, weight), format!("{}.weight", layer));
                assert!(bias.is_some());
                (input, groups, dilation)
            }
            other => panic!("expected {}, found {:?}", layer, other),
        }
    }

    /// Walks `relu(dropout(resize_like(body, x)) + x)` and returns the body output.
    fn skeleton_body(graph: &Asg, output: NodeId, x: NodeId, p: f32) -> NodeId {
        let (lhs, rhs) = match node(graph, relu_input(graph, output)) {
            NodeType::Add(lhs, rhs) => (lhs, rhs),
            other => panic!("expected Add, found {:?}", other),
        };
        assert_eq!(rhs, x);
        let resized = match node(graph, lhs) {
            NodeType::Dropout2d { input, p: rate } => {
                assert_eq!(rate, p);
                input
            }
            other => panic!("expected Dropout2d, found {:?}", other),
        };
        match node(graph, resized) {
            NodeType::ResizeBilinear { input, target, align_corners } => {
                assert_eq!(target, ResizeTarget::MatchNode(x));
                assert!(align_corners);
                input
            }
            other => panic!("expected the restoring resize, found {:?}", other),
        }
    }

    fn assert_halves(graph: &Asg, id: NodeId, x: NodeId) {
        assert_eq!(
            node(graph, id),
            NodeType::ResizeBilinear { input: x, target: ResizeTarget::Downscale(2), align_corners: true }
        );
    }

    #[test]
    fn test_rate8_operation_order() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let block = FsfBlock::new(&ctx, "b", FsfKind::Rate8, 4, 4, 0.03, 8, 3, NORM).unwrap();
        let y = block.forward(&x);
        let graph = ctx.borrow().main_graph().clone();

        // conv3x3_1 -> bn1 -> relu -> conv3x3_2 -> bn2
        let body = skeleton_body(&graph, y.node_id, x.node_id, 0.03);
        let (h, groups, dilation) = conv_input(&graph, bn_input(&graph, body, "b.bn2"), "b.conv3x3_2");
        assert_eq!((groups, dilation), (1, (1, 1)));
        let h = bn_input(&graph, relu_input(&graph, h), "b.bn1");
        let (d, _, dilation) = conv_input(&graph, h, "b.conv3x3_1");
        assert_eq!(dilation, (1, 1));
        assert_halves(&graph, d, x.node_id);
    }

    #[test]
    fn test_factorized_operation_order() {
        for (kind, kernel) in [(FsfKind::Rate16, 3), (FsfKind::Rate32, 1)] {
            let ctx = Rc::new(RefCell::new(GraphContext::new()));
            let x = Tensor::new_input(&ctx, "x");
            let block = FsfBlock::new(&ctx, "b", kind, 4, 4, 0.06, 2, kernel, NORM).unwrap();
            let y = block.forward(&x);
            let graph = ctx.borrow().main_graph().clone();

            // conv3x1_0 -> relu -> conv1x3_1 -> bn1 -> relu -> depthwise conv3x3_2 -> bn2
            let body = skeleton_body(&graph, y.node_id, x.node_id, 0.06);
            let (h, groups, dilation) = conv_input(&graph, bn_input(&graph, body, "b.bn2"), "b.conv3x3_2");
            assert_eq!((groups, dilation), (4, (2, 2)), "{:?}", kind);
            let h = bn_input(&graph, relu_input(&graph, h), "b.bn1");
            let (h, groups, _) = conv_input(&graph, h, "b.conv1x3_1");
            assert_eq!(groups, 1);
            let (d, _, _) = conv_input(&graph, relu_input(&graph, h), "b.conv3x1_0");
            assert_halves(&graph, d, x.node_id);
        }
    }
}
