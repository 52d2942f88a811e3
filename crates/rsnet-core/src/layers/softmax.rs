use crate::device::{Element, MathHandles};
use crate::tensor::{Layout, Shape};

/// チャネル方向の softmax 層（形状は入力と同じ）
#[derive(Debug, Clone)]
pub struct SoftMaxLayer {
    shape: Shape,
    layout: Layout,
}

impl SoftMaxLayer {
    pub fn new(layout: Layout, input_shape: Shape) -> Self {
        Self {
            shape: input_shape,
            layout,
        }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn eval<T: Element>(&self, n: usize, output: &mut [T], input: &[T], handles: &MathHandles) {
        handles
            .dnn
            .softmax_forward(self.layout, n, self.shape.c, self.shape.plane(), input, output);
    }
}
