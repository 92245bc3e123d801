//! # Graph Analysis Module
//!
//! This module contains analysis passes that process the ASG before execution.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates tensor shapes
//!   through the graph, detecting channel mismatches and collapsing feature
//!   maps before any data is touched.
//! - [`to_dot`](dot::to_dot): Renders the graph as Graphviz DOT text.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fsfnet::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//!
//! // Provide initial shapes for inputs and every parameter
//! let shapes = HashMap::from([
//!     ("input".to_string(), (vec![1, 3, 224, 224], DType::F32)),
//! ]);
//!
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod dot;
pub mod shape_inference;

pub use dot::to_dot;
pub use shape_inference::{ShapeInference, ShapeInferenceError};
