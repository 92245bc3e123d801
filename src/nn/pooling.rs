//! Pooling layers.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Average Pooling 2D layer.
///
/// Averages each window of a `[N, C, H, W]` tensor. Zero padding counts
/// towards the divisor.
///
/// # Example
///
/// ```rust,ignore
/// let pool = AvgPool2d::new((7, 7), (1, 1), (0, 0));
/// let output = pool.forward(&input); // H -> H - 6
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvgPool2d {
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl AvgPool2d {
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize), padding: (usize, usize)) -> Self {
        Self { kernel_size, stride, padding }
    }

    /// Square window, stride 1, no padding.
    pub fn sliding(size: usize) -> Self {
        Self::new((size, size), (1, 1), (0, 0))
    }
}

impl Module for AvgPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.avg_pool2d(self.kernel_size, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_sliding_pool_node() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = AvgPool2d::sliding(7).forward(&x);

        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(
            graph.get_node(y.node_id).unwrap().node_type,
            NodeType::AvgPool2d {
                input: x.node_id,
                kernel_size: (7, 7),
                stride: (1, 1),
                padding: (0, 0)
            }
        );
    }
}
