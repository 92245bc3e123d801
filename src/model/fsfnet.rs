//! Top-level network: features, classifier and sigmoid head.

use super::{scoped, Encoder, EncoderOutput};
use crate::config::FsfNetConfig;
use crate::nn::{AvgPool2d, Conv2d, Conv2dConfig, LayerError, Module, Sigmoid};
use crate::tensor::{GraphContext, Tensor};
use log::info;
use std::cell::RefCell;
use std::rc::Rc;

/// Encoder followed by an optional sliding average pool.
#[derive(Debug, Clone)]
pub struct Features {
    pub encoder: Encoder,
    pool: Option<AvgPool2d>,
}

impl Features {
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        prefix: &str,
        config: &FsfNetConfig,
    ) -> Result<Self, LayerError> {
        Ok(Self {
            encoder: Encoder::new(ctx, &scoped(prefix, "encoder"), config)?,
            pool: config.feature_pool.map(AvgPool2d::sliding),
        })
    }

    /// Encoder taps plus the feature tensor.
    pub fn forward_all(&self, inputs: &Tensor) -> (EncoderOutput, Tensor) {
        let taps = self.encoder.forward_all(inputs);
        let features = match &self.pool {
            Some(pool) => pool.forward(&taps.out_32),
            None => taps.out_32.clone(),
        };
        (taps, features)
    }
}

impl Module for Features {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.forward_all(inputs).1
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.encoder.parameters()
    }

    fn buffers(&self) -> Vec<Tensor> {
        self.encoder.buffers()
    }
}

/// Per-pixel 1x1 convolution to class scores.
#[derive(Debug, Clone)]
pub struct Classifier {
    pub outconv: Conv2d,
}

impl Classifier {
    pub fn new(
        ctx: &Rc<RefCell<GraphContext>>,
        prefix: &str,
        in_channels: usize,
        num_classes: usize,
    ) -> Result<Self, LayerError> {
        let outconv = Conv2d::from_config(
            ctx,
            &scoped(prefix, "outconv"),
            Conv2dConfig::square(in_channels, num_classes, 1),
        )?;
        Ok(Self { outconv })
    }
}

impl Module for Classifier {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.outconv.forward(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.outconv.parameters()
    }
}

/// Maps scores to independent per-class probabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigmoidHead {
    act: Sigmoid,
}

impl SigmoidHead {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for SigmoidHead {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.act.forward(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Every tensor of interest produced by one declared forward pass.
#[derive(Debug, Clone)]
pub struct FsfNetOutputs {
    pub out_8: Tensor,
    pub out_16: Tensor,
    pub features: Tensor,
    pub logits: Tensor,
    pub probabilities: Tensor,
}

impl FsfNetOutputs {
    /// In the order a graph's outputs are set by [`FsfNet::declare`].
    pub fn as_vec(&self) -> Vec<&Tensor> {
        vec![&self.probabilities, &self.logits, &self.features, &self.out_16, &self.out_8]
    }
}

/// FSFNet: features -> classifier -> sigmoid.
///
/// Produces `[N, num_classes, out_h, out_w]` probabilities for an
/// `[N, in_channels, H, W]` image batch.
#[derive(Debug, Clone)]
pub struct FsfNet {
    pub features: Features,
    pub classifier: Classifier,
    pub head: SigmoidHead,
}

impl FsfNet {
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, config: &FsfNetConfig) -> Result<Self, LayerError> {
        let features = Features::new(ctx, "features", config)?;
        let classifier = Classifier::new(ctx, "classifier", config.feature_channels(), config.num_classes)?;
        let model = Self { features, classifier, head: SigmoidHead::new() };

        info!(
            "FSFNet declared: {} classes, {} parameter tensors, {} buffers",
            config.num_classes,
            model.parameters().len(),
            model.buffers().len()
        );
        Ok(model)
    }

    pub fn forward_all(&self, inputs: &Tensor) -> FsfNetOutputs {
        let (taps, features) = self.features.forward_all(inputs);
        let logits = self.classifier.forward(&features);
        let probabilities = self.head.forward(&logits);
        FsfNetOutputs { out_8: taps.out_8, out_16: taps.out_16, features, logits, probabilities }
    }

    /// Declares the forward pass on `inputs` and marks every tap as a graph
    /// output, probabilities first.
    pub fn declare(&self, inputs: &Tensor) -> FsfNetOutputs {
        let outputs = self.forward_all(inputs);
        let ids = outputs.as_vec().iter().map(|t| t.node_id).collect();
        inputs.context.borrow_mut().main_graph_mut().set_outputs(ids);
        outputs
    }
}

impl Module for FsfNet {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.forward_all(inputs).probabilities
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.features.parameters();
        params.extend(self.classifier.parameters());
        params
    }

    fn buffers(&self) -> Vec<Tensor> {
        self.features.buffers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn test_fsfnet_declares_full_state_dict() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let model = FsfNet::new(&ctx, &FsfNetConfig::new(4)).unwrap();

        let ctx_ref = ctx.borrow();
        let specs = ctx_ref.parameter_specs();
        assert_eq!(model.parameters().len() + model.buffers().len(), specs.len());

        let outconv = specs.iter().find(|s| s.name == "classifier.outconv.weight").unwrap();
        assert_eq!(outconv.shape, vec![4, 128, 1, 1]);
        assert!(specs.iter().any(|s| s.name == "features.encoder.stem.bn_1.running_var"));
    }

    #[test]
    fn test_declare_sets_outputs() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let model = FsfNet::new(&ctx, &FsfNetConfig::new(2).with_feature_pool(3)).unwrap();
        let x = Tensor::new_input(&ctx, "input");
        let outputs = model.declare(&x);

        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.outputs.len(), 5);
        assert_eq!(graph.outputs[0], outputs.probabilities.node_id);
        assert_eq!(
            graph.get_node(outputs.probabilities.node_id).unwrap().node_type,
            NodeType::Sigmoid(outputs.logits.node_id)
        );
        assert!(matches!(
            graph.get_node(outputs.features.node_id).unwrap().node_type,
            NodeType::AvgPool2d { kernel_size: (3, 3), .. }
        ));
    }
}
