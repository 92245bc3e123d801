//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape and data type of
//! every node from its operand shapes and operation type. Shape errors in the
//! network definition (channel mismatches, maps shrinking to nothing) surface
//! here, before any data is touched.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, ResizeTarget, Shape};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Channel mismatch at node {node_id} ({op}): expected {expected}, got {actual}.")]
    ChannelMismatch {
        node_id: NodeId,
        op: String,
        expected: usize,
        actual: usize,
    },

    #[error("Node {node_id} ({op}) would produce an empty spatial map: {detail}")]
    DegenerateSpatial {
        node_id: NodeId,
        op: String,
        detail: String,
    },

    #[error("Node {node_id} ({op}) has an invalid attribute: {detail}")]
    InvalidAttribute {
        node_id: NodeId,
        op: String,
        detail: String,
    },

    #[error("The graph contains a cycle through node {0}.")]
    CyclicGraph(NodeId),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the graph.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields
    /// for every node reachable from the outputs.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - Shapes and types of all `Input`, `Parameter`
    ///   and `Buffer` nodes, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?;
            let (shape, dtype) = Self::infer_node_shape(asg, node, initial_shapes)?;

            let node = asg.get_node_mut(node_id)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
        }

        Ok(())
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } | NodeType::Buffer { name } => {
                initial_shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone()))
            }

            NodeType::Add(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                if ls != rs {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Add".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok((ls, ld))
            }

            // Elementwise - shape unchanged
            NodeType::ReLU(id) | NodeType::Sigmoid(id) | NodeType::Dropout2d { input: id, .. } => {
                Self::get_shape_dtype(asg, *id)
            }

            // Conv2d: [N, C_in, H, W] -> [N, C_out, H_out, W_out]
            NodeType::Conv2d { input, weight, bias, stride, padding, dilation, groups } => {
                let (input_shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let (weight_shape, _) = Self::get_rank4(asg, node.id, *weight)?;

                let (n, c_in, h, w) = (input_shape[0], input_shape[1], input_shape[2], input_shape[3]);
                let (c_out, c_per_group, kernel_h, kernel_w) =
                    (weight_shape[0], weight_shape[1], weight_shape[2], weight_shape[3]);

                if c_per_group * groups != c_in {
                    return Err(ShapeInferenceError::ChannelMismatch {
                        node_id: node.id,
                        op: "Conv2d".to_string(),
                        expected: c_per_group * groups,
                        actual: c_in,
                    });
                }
                if let Some(b) = bias {
                    let (bias_shape, _) = Self::get_shape_dtype(asg, *b)?;
                    if bias_shape != [c_out] {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Conv2d bias".to_string(),
                            shape1: vec![c_out],
                            shape2: bias_shape,
                        });
                    }
                }

                Self::check_window(node.id, "Conv2d", "kernel", (kernel_h, kernel_w))?;
                Self::check_window(node.id, "Conv2d", "stride", *stride)?;
                Self::check_window(node.id, "Conv2d", "dilation", *dilation)?;

                // Effective kernel size with dilation
                let eff_kh = (kernel_h - 1) * dilation.0 + 1;
                let eff_kw = (kernel_w - 1) * dilation.1 + 1;
                let padded_h = h + 2 * padding.0;
                let padded_w = w + 2 * padding.1;
                if padded_h < eff_kh || padded_w < eff_kw {
                    return Err(ShapeInferenceError::DegenerateSpatial {
                        node_id: node.id,
                        op: "Conv2d".to_string(),
                        detail: format!(
                            "padded input {}x{} is smaller than the dilated kernel {}x{}",
                            padded_h, padded_w, eff_kh, eff_kw
                        ),
                    });
                }

                let out_h = (padded_h - eff_kh) / stride.0 + 1;
                let out_w = (padded_w - eff_kw) / stride.1 + 1;
                Ok((vec![n, c_out, out_h, out_w], dtype))
            }

            NodeType::BatchNorm2d { input, gamma, beta, running_mean, running_var, .. } => {
                let (input_shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let channels = input_shape[1];
                for id in [gamma, beta, running_mean, running_var] {
                    let (shape, _) = Self::get_shape_dtype(asg, *id)?;
                    if shape != [channels] {
                        return Err(ShapeInferenceError::ChannelMismatch {
                            node_id: node.id,
                            op: "BatchNorm2d".to_string(),
                            expected: channels,
                            actual: shape.iter().product(),
                        });
                    }
                }
                Ok((input_shape, dtype))
            }

            NodeType::ResizeBilinear { input, target, .. } => {
                let (mut shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let (out_h, out_w) = match target {
                    ResizeTarget::Fixed(h, w) => (*h, *w),
                    ResizeTarget::Downscale(factor) => {
                        if *factor == 0 {
                            return Err(ShapeInferenceError::DegenerateSpatial {
                                node_id: node.id,
                                op: "ResizeBilinear".to_string(),
                                detail: "downscale factor is zero".to_string(),
                            });
                        }
                        (shape[2] / factor, shape[3] / factor)
                    }
                    ResizeTarget::MatchNode(reference) => {
                        let (ref_shape, _) = Self::get_rank4(asg, node.id, *reference)?;
                        (ref_shape[2], ref_shape[3])
                    }
                };
                if out_h == 0 || out_w == 0 {
                    return Err(ShapeInferenceError::DegenerateSpatial {
                        node_id: node.id,
                        op: "ResizeBilinear".to_string(),
                        detail: format!("{}x{} resized to {}x{}", shape[2], shape[3], out_h, out_w),
                    });
                }
                shape[2] = out_h;
                shape[3] = out_w;
                Ok((shape, dtype))
            }

            // AvgPool2d: [N, C, H, W] -> [N, C, H_out, W_out]
            NodeType::AvgPool2d { input, kernel_size, stride, padding } => {
                let (input_shape, dtype) = Self::get_rank4(asg, node.id, *input)?;
                let (n, c, h, w) = (input_shape[0], input_shape[1], input_shape[2], input_shape[3]);
                Self::check_window(node.id, "AvgPool2d", "kernel", *kernel_size)?;
                Self::check_window(node.id, "AvgPool2d", "stride", *stride)?;

                if padding.0 * 2 > kernel_size.0 || padding.1 * 2 > kernel_size.1 {
                    return Err(ShapeInferenceError::DegenerateSpatial {
                        node_id: node.id,
                        op: "AvgPool2d".to_string(),
                        detail: "padding exceeds half of the kernel".to_string(),
                    });
                }
                if h + 2 * padding.0 < kernel_size.0 || w + 2 * padding.1 < kernel_size.1 {
                    return Err(ShapeInferenceError::DegenerateSpatial {
                        node_id: node.id,
                        op: "AvgPool2d".to_string(),
                        detail: format!(
                            "input {}x{} is smaller than the window {}x{}",
                            h, w, kernel_size.0, kernel_size.1
                        ),
                    });
                }

                let out_h = (h + 2 * padding.0 - kernel_size.0) / stride.0 + 1;
                let out_w = (w + 2 * padding.1 - kernel_size.1) / stride.1 + 1;
                Ok((vec![n, c, out_h, out_w], dtype))
            }
        }
    }

    /// Kernel sizes, strides and dilations must be non-zero on both axes.
    fn check_window(node_id: NodeId, op: &str, what: &str, value: (usize, usize)) -> Result<()> {
        if value.0 == 0 || value.1 == 0 {
            return Err(ShapeInferenceError::InvalidAttribute {
                node_id,
                op: op.to_string(),
                detail: format!("{} {:?} must be non-zero", what, value),
            });
        }
        Ok(())
    }

    /// Already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    fn get_rank4(asg: &Asg, consumer: NodeId, node_id: NodeId) -> Result<(Shape, DType)> {
        let (shape, dtype) = Self::get_shape_dtype(asg, node_id)?;
        if shape.len() != 4 {
            return Err(ShapeInferenceError::InvalidRank {
                node_id: consumer,
                expected: 4,
                actual: shape.len(),
            });
        }
        Ok((shape, dtype))
    }

    /// Orders the nodes reachable from the graph outputs so that every node
    /// comes after its operands.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        for output_id in &asg.outputs {
            Self::build_sorted_graph(*output_id, asg, &mut visited, &mut in_progress, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        in_progress: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }
        if !in_progress.insert(node_id) {
            return Err(ShapeInferenceError::CyclicGraph(node_id));
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.inputs() {
            Self::build_sorted_graph(input_id, asg, visited, in_progress, sorted)?;
        }

        in_progress.remove(&node_id);
        visited.insert(node_id);
        sorted.push(node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{BatchNorm2d, Conv2d, Conv2dConfig, Module};
    use crate::tensor::{GraphContext, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn shapes_for(ctx: &Rc<RefCell<GraphContext>>, input: Shape) -> HashMap<String, (Shape, DType)> {
        let mut shapes: HashMap<_, _> = ctx
            .borrow()
            .parameter_specs()
            .iter()
            .map(|s| (s.name.clone(), (s.shape.clone(), DType::F32)))
            .collect();
        shapes.insert("x".to_string(), (input, DType::F32));
        shapes
    }

    #[test]
    fn test_strided_conv_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let conv = Conv2d::from_config(
            &ctx,
            "c",
            Conv2dConfig::square(3, 32, 3).with_stride((2, 2)).with_padding((1, 1)),
        )
        .unwrap();
        let y = conv.forward(&x);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id]);
        ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![2, 3, 33, 64])).unwrap();
        assert_eq!(graph.get_node(y.node_id).unwrap().shape, Some(vec![2, 32, 17, 32]));
    }

    #[test]
    fn test_pointwise_kernel_with_dilated_padding_grows_map() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let conv = Conv2d::from_config(
            &ctx,
            "dw",
            Conv2dConfig::square(8, 8, 1)
                .with_padding((4, 4))
                .with_dilation((4, 4))
                .with_groups(8),
        )
        .unwrap();
        let y = conv.forward(&x);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id]);
        ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 8, 2, 3])).unwrap();
        assert_eq!(graph.get_node(y.node_id).unwrap().shape, Some(vec![1, 8, 10, 11]));
    }

    #[test]
    fn test_resize_targets() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let down = x.downscale(2);
        let up = down.resize_like(&x);
        let fixed = up.resize_bilinear(ResizeTarget::Fixed(224, 224), true);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![fixed.node_id]);
        ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 4, 7, 9])).unwrap();
        assert_eq!(graph.get_node(down.node_id).unwrap().shape, Some(vec![1, 4, 3, 4]));
        assert_eq!(graph.get_node(up.node_id).unwrap().shape, Some(vec![1, 4, 7, 9]));
        assert_eq!(graph.get_node(fixed.node_id).unwrap().shape, Some(vec![1, 4, 224, 224]));
    }

    #[test]
    fn test_downscale_to_nothing_is_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.downscale(2);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id]);
        let err = ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 4, 1, 8])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::DegenerateSpatial { .. }));
    }

    #[test]
    fn test_zero_stride_and_empty_kernel_are_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let pooled = x.avg_pool2d((2, 2), (0, 0), (0, 0));
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![pooled.node_id]);
        let err = ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 1, 4, 4])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::InvalidAttribute { ref op, .. } if op == "AvgPool2d"));

        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", vec![2, 2, 3, 3], crate::tensor::Init::Ones);
        let strided = x.conv2d(&w, None, (0, 1), (1, 1), (1, 1), 1);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![strided.node_id]);
        let err = ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 2, 5, 5])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::InvalidAttribute { ref op, .. } if op == "Conv2d"));

        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", vec![2, 2, 0, 3], crate::tensor::Init::Ones);
        let empty = x.conv2d(&w, None, (1, 1), (0, 0), (1, 1), 1);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![empty.node_id]);
        let err = ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 2, 5, 5])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::InvalidAttribute { ref detail, .. } if detail.starts_with("kernel")));
    }

    #[test]
    fn test_residual_mismatch_and_channel_mismatch() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let conv = Conv2d::from_config(&ctx, "c", Conv2dConfig::square(4, 6, 1)).unwrap();
        let y = &conv.forward(&x) + &x;

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id]);
        let err = ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 4, 5, 5])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::IncompatibleShapes { .. }));

        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let bn = BatchNorm2d::new(&ctx, "bn", 3);
        let y = bn.forward(&x);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id]);
        let err = ShapeInference::run(&mut graph, &shapes_for(&ctx, vec![1, 4, 5, 5])).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::ChannelMismatch { expected: 4, actual: 3, .. }));
    }

    #[test]
    fn test_missing_initial_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.relu();
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![y.node_id]);
        let err = ShapeInference::run(&mut graph, &HashMap::new()).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MissingInitialShape("x".to_string()));
    }

    #[test]
    fn test_topological_sort_detects_cycle() {
        let mut asg = Asg::new(0);
        let a = asg.add_node(None, NodeType::ReLU(1));
        let b = asg.add_node(None, NodeType::ReLU(a));
        asg.set_outputs(vec![b]);
        let err = ShapeInference::topological_sort(&asg).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::CyclicGraph(_)));
    }

    #[test]
    fn test_topological_sort_orders_operands_first() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let a = x.relu();
        let b = &a + &x;
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![b.node_id]);
        let order = ShapeInference::topological_sort(&graph).unwrap();
        assert_eq!(order, vec![x.node_id, a.node_id, b.node_id]);
    }
}
