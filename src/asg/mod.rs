//! ASG: the abstract semantic graph the network is declared into.
//!
//! A graph is a flat map of nodes. Every node names its operands by
//! [`NodeId`], so the graph is a DAG whose edges point from operands to the
//! node consuming them. Shapes and dtypes start empty and are filled in by
//! [`crate::analysis::shape_inference::ShapeInference`].

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("No input named '{0}' in the graph")]
    InputNotFound(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
}

/// How the spatial size of a bilinear resize is determined.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeTarget {
    /// Exact `(height, width)`.
    Fixed(usize, usize),
    /// Floor-divide the input height and width by the factor.
    Downscale(usize),
    /// Take the spatial size of another node.
    MatchNode(NodeId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    /// Non-trainable state such as batch-norm running statistics.
    Buffer { name: String },

    // Elementwise
    Add(NodeId, NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),

    // Spatial
    Conv2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    },
    BatchNorm2d {
        input: NodeId,
        gamma: NodeId,
        beta: NodeId,
        running_mean: NodeId,
        running_var: NodeId,
        eps: f32,
        momentum: f32,
    },
    ResizeBilinear {
        input: NodeId,
        target: ResizeTarget,
        align_corners: bool,
    },
    Dropout2d { input: NodeId, p: f32 },
    AvgPool2d {
        input: NodeId,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    },
}

impl NodeType {
    /// Operands this node reads, in evaluation order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. } | NodeType::Parameter { .. } | NodeType::Buffer { .. } => {
                vec![]
            }
            NodeType::Add(a, b) => vec![*a, *b],
            NodeType::ReLU(a) | NodeType::Sigmoid(a) => vec![*a],
            NodeType::Conv2d { input, weight, bias, .. } => {
                let mut deps = vec![*input, *weight];
                if let Some(b) = bias {
                    deps.push(*b);
                }
                deps
            }
            NodeType::BatchNorm2d { input, gamma, beta, running_mean, running_var, .. } => {
                vec![*input, *gamma, *beta, *running_mean, *running_var]
            }
            NodeType::ResizeBilinear { input, target, .. } => match target {
                ResizeTarget::MatchNode(reference) => vec![*input, *reference],
                _ => vec![*input],
            },
            NodeType::Dropout2d { input, .. } | NodeType::AvgPool2d { input, .. } => vec![*input],
        }
    }

    /// Short operator name used in logs and graph exports.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Buffer { .. } => "Buffer",
            NodeType::Add(..) => "Add",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Sigmoid(_) => "Sigmoid",
            NodeType::Conv2d { .. } => "Conv2d",
            NodeType::BatchNorm2d { .. } => "BatchNorm2d",
            NodeType::ResizeBilinear { .. } => "ResizeBilinear",
            NodeType::Dropout2d { .. } => "Dropout2d",
            NodeType::AvgPool2d { .. } => "AvgPool2d",
        }
    }
}

/// Concrete data flowing through a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(ArrayD<f32>),
}

impl Value {
    pub fn as_tensor(&self) -> &ArrayD<f32> {
        let Value::Tensor(arr) = self;
        arr
    }

    pub fn into_tensor(self) -> ArrayD<f32> {
        let Value::Tensor(arr) = self;
        arr
    }

    pub fn shape(&self) -> &[usize] {
        self.as_tensor().shape()
    }
}

impl From<ArrayD<f32>> for Value {
    fn from(arr: ArrayD<f32>) -> Self {
        Value::Tensor(arr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId) -> Self {
        Self { id, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let node = Node { id: new_id, name, node_type, shape: None, dtype: None };
        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Looks up a graph input by name.
    pub fn find_input(&self, name: &str) -> AsgResult<NodeId> {
        self.inputs
            .iter()
            .copied()
            .find(|id| {
                matches!(
                    self.nodes.get(id).map(|n| &n.node_type),
                    Some(NodeType::Input { name: n }) if n == name
                )
            })
            .ok_or_else(|| AsgError::InputNotFound(name.to_string()))
    }

    /// Iterates over `(name, id)` of every Parameter and Buffer node.
    pub fn state_nodes(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.nodes.values().filter_map(|node| match &node.node_type {
            NodeType::Parameter { name } | NodeType::Buffer { name } => {
                Some((name.as_str(), node.id))
            }
            _ => None,
        })
    }
}
