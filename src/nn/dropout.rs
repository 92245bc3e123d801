//! Spatial dropout for convolutional feature maps.

use crate::nn::{LayerError, Module};
use crate::tensor::Tensor;

/// Zeroes entire channels (feature maps) with probability `p` during training.
///
/// Surviving channels are scaled by `1/(1-p)`. In eval mode the node is the
/// identity. A probability of zero adds no node to the graph at all.
#[derive(Debug, Clone, Copy)]
pub struct SpatialDropout {
    pub p: f32,
}

impl SpatialDropout {
    /// Fails unless `p` is in `[0, 1)`.
    pub fn new(p: f32) -> Result<Self, LayerError> {
        if !(0.0..1.0).contains(&p) {
            return Err(LayerError::InvalidDropout(p));
        }
        Ok(Self { p })
    }

    pub fn is_active(&self) -> bool {
        self.p != 0.0
    }
}

impl Module for SpatialDropout {
    fn forward(&self, x: &Tensor) -> Tensor {
        if self.is_active() {
            x.dropout2d(self.p)
        } else {
            x.clone()
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_zero_probability_is_passthrough() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = SpatialDropout::new(0.0).unwrap().forward(&x);
        assert_eq!(y.node_id, x.node_id);
        assert_eq!(ctx.borrow().main_graph().nodes.len(), 1);
    }

    #[test]
    fn test_active_dropout_adds_node() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = SpatialDropout::new(0.05).unwrap().forward(&x);
        assert_ne!(y.node_id, x.node_id);
    }

    #[test]
    fn test_dropout_invalid_p() {
        assert_eq!(SpatialDropout::new(1.5).unwrap_err(), LayerError::InvalidDropout(1.5));
        assert!(SpatialDropout::new(1.0).is_err());
        assert!(SpatialDropout::new(-0.1).is_err());
    }
}
