//! Graphviz export of an ASG.

use crate::asg::{Asg, NodeId, NodeType};
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

fn label(node_id: NodeId, node_type: &NodeType, name: Option<&str>, shape: Option<&[usize]>) -> String {
    let mut text = match node_type {
        NodeType::Input { name } | NodeType::Parameter { name } | NodeType::Buffer { name } => {
            format!("{}: {}", node_type.op_name(), name)
        }
        NodeType::Conv2d { stride, padding, dilation, groups, .. } => format!(
            "#{} Conv2d s={:?} p={:?} d={:?} g={}",
            node_id, stride, padding, dilation, groups
        ),
        NodeType::Dropout2d { p, .. } => format!("#{} Dropout2d p={}", node_id, p),
        other => match name {
            Some(n) => format!("#{} {} ({})", node_id, other.op_name(), n),
            None => format!("#{} {}", node_id, other.op_name()),
        },
    };
    if let Some(shape) = shape {
        text.push_str(&format!("\n{:?}", shape));
    }
    text
}

/// Renders the graph in Graphviz DOT format.
///
/// Edges run from operand to consumer. Nodes with inferred shapes carry the
/// shape on a second label line. Node order follows node ids, so the output
/// is stable for a given graph.
pub fn to_dot(asg: &Asg) -> String {
    let mut graph = DiGraph::<String, &str>::new();
    let mut node_map: HashMap<NodeId, NodeIndex> = HashMap::new();

    let mut ids: Vec<NodeId> = asg.nodes.keys().copied().collect();
    ids.sort_unstable();

    for id in &ids {
        let node = &asg.nodes[id];
        let index = graph.add_node(label(
            node.id,
            &node.node_type,
            node.name.as_deref(),
            node.shape.as_deref(),
        ));
        node_map.insert(*id, index);
    }

    for id in &ids {
        let to_idx = node_map[id];
        for input_id in asg.nodes[id].node_type.inputs() {
            if let Some(&from_idx) = node_map.get(&input_id) {
                graph.add_edge(from_idx, to_idx, "");
            }
        }
    }

    format!("{}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
}
