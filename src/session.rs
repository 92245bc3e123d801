//! Running FSFNet end to end.
//!
//! A [`Session`] declares the network into a graph once, owns the parameter
//! values and a CPU backend, and executes forward passes on concrete image
//! batches.

use crate::analysis::{self, ShapeInference};
use crate::asg::{Asg, DType, Shape, Value};
use crate::config::FsfNetConfig;
use crate::error::{Error, Result};
use crate::model::{FsfNet, FsfNetOutputs, Stem};
use crate::params::{ParameterError, ParameterStore};
use crate::runtime::{Backend, CpuBackend, ExecutionMode, Memo, RuntimeError};
use crate::tensor::{GraphContext, ParameterSpec, Tensor};
use log::{debug, info, warn};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

/// Name of the graph input holding the image batch.
pub const INPUT_NAME: &str = "input";

/// Smallest stem output that two transitions and a rate-32 block can halve.
const MIN_STEM_OUTPUT: usize = 8;

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// `[N, num_classes, out_h, out_w]`, values in (0, 1).
    pub probabilities: ArrayD<f32>,
    /// Classifier scores before the sigmoid.
    pub logits: ArrayD<f32>,
    /// Encoder output after resizing (and pooling, when configured).
    pub features: ArrayD<f32>,
    pub out_16: ArrayD<f32>,
    pub out_8: ArrayD<f32>,
}

pub struct Session {
    config: FsfNetConfig,
    model: FsfNet,
    outputs: FsfNetOutputs,
    graph: Asg,
    specs: Vec<ParameterSpec>,
    params: ParameterStore,
    backend: CpuBackend,
}

impl Session {
    /// Declares the network described by `config` and initializes its
    /// parameters from `config.seed`.
    pub fn new(config: FsfNetConfig) -> Result<Self> {
        config.validate()?;

        let context = Rc::new(RefCell::new(GraphContext::new()));
        let model = FsfNet::new(&context, &config)?;
        let input = Tensor::new_input(&context, INPUT_NAME);
        let outputs = model.declare(&input);

        let (graph, specs) = {
            let ctx = context.borrow();
            (ctx.main_graph().clone(), ctx.parameter_specs().to_vec())
        };
        let params = ParameterStore::initialize(&specs, config.seed);
        let backend = CpuBackend::new().with_seed(config.seed);

        info!(
            "session ready: {} graph nodes, {} tensors, {} values",
            graph.nodes.len(),
            params.len(),
            params.num_elements()
        );

        Ok(Self { config, model, outputs, graph, specs, params, backend })
    }

    /// Replaces the initialized parameters with `params`.
    pub fn with_parameters(mut self, params: ParameterStore) -> Result<Self> {
        params.validate(&self.specs)?;
        self.params = params;
        Ok(self)
    }

    pub fn config(&self) -> &FsfNetConfig {
        &self.config
    }

    pub fn model(&self) -> &FsfNet {
        &self.model
    }

    /// The declared graph, without shape information.
    pub fn graph(&self) -> &Asg {
        &self.graph
    }

    pub fn parameter_specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    pub fn mode(&self) -> ExecutionMode {
        self.backend.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.backend.set_mode(mode);
    }

    /// Accepts `[N, in_channels, H, W]` with every dimension non-zero and
    /// `H`, `W` large enough to reach the 1/64 resolution level.
    pub fn check_input_shape(&self, shape: &[usize]) -> Result<()> {
        if shape.len() != 4 {
            return Err(Error::InvalidInput(format!(
                "expected a 4D [N, C, H, W] tensor, got shape {:?}",
                shape
            )));
        }
        if shape[1] != self.config.in_channels {
            return Err(Error::InvalidInput(format!(
                "expected {} input channels, got {}",
                self.config.in_channels, shape[1]
            )));
        }
        if shape.contains(&0) {
            return Err(Error::InvalidInput(format!("empty input tensor {:?}", shape)));
        }
        let (h, w) = (Stem::output_len(shape[2]), Stem::output_len(shape[3]));
        if h < MIN_STEM_OUTPUT || w < MIN_STEM_OUTPUT {
            return Err(Error::InvalidInput(format!(
                "input {}x{} shrinks to {}x{} after the stem, at least {}x{} is needed",
                shape[2], shape[3], h, w, MIN_STEM_OUTPUT, MIN_STEM_OUTPUT
            )));
        }
        Ok(())
    }

    /// Runs shape inference for an input of `input_shape` and returns the
    /// annotated graph.
    pub fn infer_shapes(&self, input_shape: &[usize]) -> Result<Asg> {
        self.check_input_shape(input_shape)?;

        let mut initial_shapes: HashMap<String, (Shape, DType)> = self
            .specs
            .iter()
            .map(|s| (s.name.clone(), (s.shape.clone(), DType::F32)))
            .collect();
        initial_shapes.insert(INPUT_NAME.to_string(), (input_shape.to_vec(), DType::F32));

        let mut graph = self.graph.clone();
        ShapeInference::run(&mut graph, &initial_shapes)?;
        Ok(graph)
    }

    /// Runs the network on `input`.
    ///
    /// In [`ExecutionMode::Train`] the batch-norm running statistics of the
    /// session are updated.
    pub fn forward(&mut self, input: &ArrayD<f32>) -> Result<Prediction> {
        let shaped = self.infer_shapes(input.shape())?;
        let taps = [
            ("out_8", &self.outputs.out_8),
            ("out_16", &self.outputs.out_16),
            ("features", &self.outputs.features),
            ("probabilities", &self.outputs.probabilities),
        ];
        for (label, tap) in taps {
            let shape = shaped.get_node(tap.node_id)?.shape.clone().unwrap_or_default();
            debug!("{}: {:?}", label, shape);
        }

        let mut memo: Memo<Value> = HashMap::new();
        let input_id = self.graph.find_input(INPUT_NAME)?;
        memo.insert((self.graph.id, input_id), Value::Tensor(input.clone()));
        for (name, node_id) in self.graph.state_nodes() {
            let value = self
                .params
                .get(name)
                .ok_or_else(|| ParameterError::Missing(name.to_string()))?;
            memo.insert((self.graph.id, node_id), Value::Tensor(value.clone()));
        }

        let run = self.backend.run(&self.graph, memo)?;
        if !run.buffer_updates.is_empty() {
            debug!("updating {} running statistics", run.buffer_updates.len());
            self.params.apply_updates(run.buffer_updates)?;
        }

        let mut values = self.backend.retrieve_data(&run.outputs)?.into_iter().map(Value::into_tensor);
        let mut next = || {
            values
                .next()
                .ok_or_else(|| RuntimeError::ComputationError("graph produced fewer outputs than declared".to_string()))
        };
        Ok(Prediction {
            probabilities: next()?,
            logits: next()?,
            features: next()?,
            out_16: next()?,
            out_8: next()?,
        })
    }

    /// Writes all parameters and buffers with the configuration in the header.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.params.save_safetensors(path, Some(&self.config))
    }

    /// Replaces the session's parameters with those stored in `path`.
    ///
    /// Tensors the network does not declare are ignored. Every declared tensor
    /// must be present with its declared shape. Returns the configuration
    /// found in the file header.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<Option<FsfNetConfig>> {
        let (mut store, stored_config) = ParameterStore::load_safetensors(path)?;

        for name in store.retain_declared(&self.specs) {
            warn!("ignoring tensor '{}' not used by the network", name);
        }
        store.validate(&self.specs)?;

        if let Some(stored) = &stored_config {
            if stored != &self.config {
                warn!("weights were saved with a different configuration");
            }
        }

        self.params = store;
        Ok(stored_config)
    }

    /// Graphviz rendering of the declared graph.
    pub fn to_dot(&self) -> String {
        analysis::to_dot(&self.graph)
    }
}
