//! Convolutional layer.

use crate::nn::module::Module;
use crate::nn::LayerError;
use crate::tensor::{GraphContext, Init, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Hyperparameters of a [`Conv2d`] layer, PyTorch conventions.
///
/// Padding is applied symmetrically; `groups == in_channels == out_channels`
/// gives a depthwise convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
    pub bias: bool,
}

impl Conv2dConfig {
    /// Stride 1, no padding, no dilation, one group, with bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            bias: true,
        }
    }

    pub fn square(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self::new(in_channels, out_channels, (kernel, kernel))
    }

    pub fn with_stride(self, stride: (usize, usize)) -> Self {
        Self { stride, ..self }
    }

    pub fn with_padding(self, padding: (usize, usize)) -> Self {
        Self { padding, ..self }
    }

    pub fn with_dilation(self, dilation: (usize, usize)) -> Self {
        Self { dilation, ..self }
    }

    pub fn with_groups(self, groups: usize) -> Self {
        Self { groups, ..self }
    }

    /// Weight shape `[C_out, C_in / groups, kH, kW]`.
    pub fn weight_shape(&self) -> Vec<usize> {
        vec![
            self.out_channels,
            self.in_channels / self.groups.max(1),
            self.kernel_size.0,
            self.kernel_size.1,
        ]
    }

    /// Fan-in used by the default initializer.
    pub fn fan_in(&self) -> usize {
        (self.in_channels / self.groups.max(1)) * self.kernel_size.0 * self.kernel_size.1
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        let zero = |what: &str, v: usize| {
            if v == 0 {
                Err(LayerError::InvalidConv(format!("{} must be non-zero", what)))
            } else {
                Ok(())
            }
        };
        zero("in_channels", self.in_channels)?;
        zero("out_channels", self.out_channels)?;
        zero("kernel height", self.kernel_size.0)?;
        zero("kernel width", self.kernel_size.1)?;
        zero("stride height", self.stride.0)?;
        zero("stride width", self.stride.1)?;
        zero("dilation height", self.dilation.0)?;
        zero("dilation width", self.dilation.1)?;
        zero("groups", self.groups)?;
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(LayerError::InvalidConv(format!(
                "channels {} -> {} are not divisible by groups {}",
                self.in_channels, self.out_channels, self.groups
            )));
        }
        Ok(())
    }
}

/// 2D convolution over `[N, C_in, H, W]` producing `[N, C_out, H_out, W_out]`.
///
/// Weights and bias are drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
///
/// # Example
///
/// ```rust,ignore
/// use fsfnet::nn::{Conv2d, Conv2dConfig, Module};
///
/// let conv = Conv2d::from_config(&ctx, "conv1", Conv2dConfig::square(3, 32, 3).with_padding((1, 1)))?;
/// let output = conv.forward(&input);
/// ```
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub config: Conv2dConfig,
}

impl Conv2d {
    pub fn from_config(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        config: Conv2dConfig,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        let bound = 1.0 / (config.fan_in() as f32).sqrt();

        let weight = Tensor::new_parameter(
            context,
            &format!("{}.weight", name),
            config.weight_shape(),
            Init::Uniform(bound),
        );
        let bias = config.bias.then(|| {
            Tensor::new_parameter(
                context,
                &format!("{}.bias", name),
                vec![config.out_channels],
                Init::Uniform(bound),
            )
        });

        Ok(Self { weight, bias, config })
    }
}

impl Module for Conv2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.conv2d(
            &self.weight,
            self.bias.as_ref(),
            self.config.stride,
            self.config.padding,
            self.config.dilation,
            self.config.groups,
        )
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn test_conv2d_registers_weight_and_bias() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let config = Conv2dConfig::square(3, 64, 3).with_padding((1, 1)).with_stride((2, 2));
        let conv = Conv2d::from_config(&context, "conv1", config).unwrap();

        assert_eq!(conv.parameters().len(), 2);

        let specs = context.borrow().parameter_specs().to_vec();
        assert_eq!(specs[0].name, "conv1.weight");
        assert_eq!(specs[0].shape, vec![64, 3, 3, 3]);
        assert_eq!(specs[1].shape, vec![64]);
        assert_eq!(specs[0].init, Init::Uniform(1.0 / 27f32.sqrt()));
    }

    #[test]
    fn test_conv2d_forward_records_attributes() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "input");
        let config = Conv2dConfig::square(16, 16, 3)
            .with_padding((2, 2))
            .with_dilation((2, 2))
            .with_groups(16);
        let conv = Conv2d::from_config(&context, "dw", config).unwrap();
        let output = conv.forward(&input);

        let graph = context.borrow().main_graph().clone();
        match &graph.get_node(output.node_id).unwrap().node_type {
            NodeType::Conv2d { dilation, groups, bias, .. } => {
                assert_eq!(*dilation, (2, 2));
                assert_eq!(*groups, 16);
                assert!(bias.is_some());
            }
            other => panic!("unexpected node {:?}", other),
        }
        // Depthwise weight keeps one input channel per group.
        assert_eq!(context.borrow().parameter_specs()[0].shape, vec![16, 1, 3, 3]);
    }

    #[test]
    fn test_conv2d_rejects_bad_groups() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let config = Conv2dConfig::square(6, 4, 3).with_groups(4);
        let err = Conv2d::from_config(&context, "bad", config).unwrap_err();
        assert!(matches!(err, LayerError::InvalidConv(_)));
        assert!(context.borrow().parameter_specs().is_empty());
    }
}
