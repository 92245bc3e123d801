//! Module defining `Tensor` and `GraphContext`.
//!
//! `Tensor` does not hold data. It is a lightweight handle to a node of the
//! abstract semantic graph (ASG). Every operation on a `Tensor` appends the
//! corresponding node to the graph instead of computing anything.
//!
//! `GraphContext` owns the graph under construction together with the
//! registry of parameters and buffers the layers declared, so that shapes
//! and initial values never have to be guessed from names later.

use crate::asg::{Asg, NodeId, NodeType, ResizeTarget, Shape};
use std::cell::RefCell;
use std::ops::Add;
use std::rc::Rc;

/// Initial value of a parameter or buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    /// Uniform in `[-bound, bound)`.
    Uniform(f32),
}

/// Whether a registered tensor is learned or carried state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Trainable,
    Buffer,
}

/// A tensor the graph expects to be supplied at execution time.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Shape,
    pub kind: StateKind,
    pub init: Init,
}

/// Owns the graph under construction.
///
/// Shared between all `Tensor` handles through `Rc<RefCell<_>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    specs: Vec<ParameterSpec>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self { main_graph: Asg::new(0), specs: Vec::new() }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// Parameters and buffers in declaration order.
    pub fn parameter_specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    fn register(&mut self, spec: ParameterSpec) {
        debug_assert!(
            self.specs.iter().all(|s| s.name != spec.name),
            "duplicate parameter name {}",
            spec.name
        );
        self.specs.push(spec);
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node in the computation graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates a graph input. Real data is bound to it by name at execution time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a trainable parameter and records its shape and initializer.
    pub fn new_parameter(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: Shape,
        init: Init,
    ) -> Self {
        Self::new_state(context, name, shape, init, StateKind::Trainable)
    }

    /// Creates a non-trainable buffer (running statistics).
    pub fn new_buffer(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: Shape,
        init: Init,
    ) -> Self {
        Self::new_state(context, name, shape, init, StateKind::Buffer)
    }

    fn new_state(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: Shape,
        init: Init,
        kind: StateKind,
    ) -> Self {
        let mut ctx = context.borrow_mut();
        let node_type = match kind {
            StateKind::Trainable => NodeType::Parameter { name: name.to_string() },
            StateKind::Buffer => NodeType::Buffer { name: name.to_string() },
        };
        let node_id = ctx.main_graph_mut().add_node(Some(name.to_string()), node_type);
        ctx.register(ParameterSpec { name: name.to_string(), shape, kind, init });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Name of the underlying node, if it has one.
    pub fn name(&self) -> Option<String> {
        let ctx = self.context.borrow();
        ctx.main_graph().get_node(self.node_id).ok().and_then(|n| n.name.clone())
    }

    fn derive(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(&self.context) }
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.derive(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.derive(NodeType::Sigmoid(self.node_id))
    }

    // --- Spatial operations ---

    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    ) -> Self {
        self.derive(NodeType::Conv2d {
            input: self.node_id,
            weight: weight.node_id,
            bias: bias.map(|b| b.node_id),
            stride,
            padding,
            dilation,
            groups,
        })
    }

    pub fn batch_norm2d(
        &self,
        gamma: &Tensor,
        beta: &Tensor,
        running_mean: &Tensor,
        running_var: &Tensor,
        eps: f32,
        momentum: f32,
    ) -> Self {
        self.derive(NodeType::BatchNorm2d {
            input: self.node_id,
            gamma: gamma.node_id,
            beta: beta.node_id,
            running_mean: running_mean.node_id,
            running_var: running_var.node_id,
            eps,
            momentum,
        })
    }

    pub fn resize_bilinear(&self, target: ResizeTarget, align_corners: bool) -> Self {
        self.derive(NodeType::ResizeBilinear { input: self.node_id, target, align_corners })
    }

    /// Bilinear resize to `floor(H / factor) x floor(W / factor)`, corners aligned.
    pub fn downscale(&self, factor: usize) -> Self {
        self.resize_bilinear(ResizeTarget::Downscale(factor), true)
    }

    /// Bilinear resize to the spatial size of `reference`, corners aligned.
    pub fn resize_like(&self, reference: &Tensor) -> Self {
        self.resize_bilinear(ResizeTarget::MatchNode(reference.node_id), true)
    }

    pub fn dropout2d(&self, p: f32) -> Self {
        self.derive(NodeType::Dropout2d { input: self.node_id, p })
    }

    pub fn avg_pool2d(
        &self,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        self.derive(NodeType::AvgPool2d { input: self.node_id, kernel_size, stride, padding })
    }
}

// `a + b` appends an Add node.
impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.derive(NodeType::Add(self.node_id, rhs.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_append_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = &x.relu() + &x;
        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.inputs, vec![x.node_id]);
        assert_eq!(graph.get_node(y.node_id).unwrap().node_type, NodeType::Add(1, 0));
    }

    #[test]
    fn test_state_registration() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "conv.weight", vec![8, 3, 3, 3], Init::Uniform(0.1));
        let _rm = Tensor::new_buffer(&ctx, "bn.running_mean", vec![8], Init::Zeros);

        let specs = ctx.borrow().parameter_specs().to_vec();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, StateKind::Trainable);
        assert_eq!(specs[1].kind, StateKind::Buffer);
        assert_eq!(w.name().as_deref(), Some("conv.weight"));
        assert!(ctx.borrow().main_graph().inputs.is_empty());
    }
}
