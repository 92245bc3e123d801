//! Bilinear resizing as a layer.

use crate::asg::ResizeTarget;
use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Bilinear resize of the spatial axes of `[N, C, H, W]`.
///
/// Resizing to the size of another tensor is only available through
/// [`Tensor::resize_like`], since a `Module` sees a single input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resize {
    pub target: ResizeTarget,
    pub align_corners: bool,
}

impl Resize {
    /// Resize to a fixed `(height, width)` with aligned corners.
    pub fn fixed(height: usize, width: usize) -> Self {
        Self { target: ResizeTarget::Fixed(height, width), align_corners: true }
    }

    /// Resize to `floor(H / factor) x floor(W / factor)` with aligned corners.
    pub fn downscale(factor: usize) -> Self {
        Self { target: ResizeTarget::Downscale(factor), align_corners: true }
    }

    pub fn with_align_corners(mut self, align_corners: bool) -> Self {
        self.align_corners = align_corners;
        self
    }
}

impl Module for Resize {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.resize_bilinear(self.target, self.align_corners)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
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
    fn test_resize_records_target() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Resize::fixed(7, 9).with_align_corners(false).forward(&x);
        let z = Resize::downscale(2).forward(&y);

        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(
            graph.get_node(y.node_id).unwrap().node_type,
            NodeType::ResizeBilinear {
                input: x.node_id,
                target: ResizeTarget::Fixed(7, 9),
                align_corners: false
            }
        );
        assert_eq!(
            graph.get_node(z.node_id).unwrap().node_type,
            NodeType::ResizeBilinear {
                input: y.node_id,
                target: ResizeTarget::Downscale(2),
                align_corners: true
            }
        );
    }
}
