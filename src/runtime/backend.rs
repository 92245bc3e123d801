//! Module defining the abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur while executing a graph.
/// Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in graph {1}. Check that the graph was built correctly.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Graph cannot be executed: {0}")]
    InvalidGraph(String),

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node ID: {1}). Add it to the initial memo before calling backend.run().")]
    MissingInput(String, NodeId),

    #[error("Missing value for parameter '{0}' (node ID: {1}). Initialize or load parameters before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Cache of already computed node values.
/// The key is (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Selects the behaviour of the stateful operators.
///
/// In `Train` mode batch normalization uses batch statistics and reports
/// running-statistic updates, and spatial dropout is active. In `Eval` mode
/// both are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    Train,
    #[default]
    Eval,
}

/// Result of executing a graph.
#[derive(Debug, Clone)]
pub struct RunOutput<T> {
    /// Values of `Asg::outputs`, in order.
    pub outputs: Vec<T>,
    /// Final cache with every intermediate result.
    pub memo: Memo<T>,
    /// New values for buffers, keyed by buffer name. Empty in `Eval` mode.
    pub buffer_updates: HashMap<String, T>,
}

/// Common interface for an execution environment (backend).
///
/// Any structure implementing this trait can take an ASG and data,
/// run the computation and return the results.
pub trait Backend {
    /// Device-specific data representation.
    type DeviceData: std::fmt::Debug;

    /// Prepares data for execution: moves CPU values to the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes the graph, using and extending the computation cache.
    ///
    /// # Arguments
    /// * `main_asg` - Graph to execute.
    /// * `initial_memo` - Cache holding the initial data (inputs, parameters
    ///   and buffers) keyed by `(asg.id, node_id)`.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<RunOutput<Self::DeviceData>, RuntimeError>;

    /// Brings results back from the device as CPU values.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
