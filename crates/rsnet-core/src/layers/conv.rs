//! 直接畳み込み層（任意の奇数フィルタサイズ）

use super::stage;
use crate::device::{Device, DeviceBuffer, Element, MathHandles};
use crate::error::Result;
use crate::kernels::Activation;
use crate::tensor::{Layout, Shape};
use crate::workspace::{ScratchRequirement, Workspace};

/// DNN ハンドル経由の畳み込み（"same" パディング、ストライド 1）
///
/// 3x3 以外のフィルタと、Winograd 経路の数値基準として使う。
#[derive(Debug)]
pub struct ConvLayer<T: Element> {
    shape: Shape,
    layout: Layout,
    c_input: usize,
    filter_size: usize,
    use_relu: bool,
    use_bias: bool,
    /// [C][Cin][size][size]
    weights: DeviceBuffer<T>,
    biases: DeviceBuffer<T>,
}

impl<T: Element> ConvLayer<T> {
    /// 新規作成
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        layout: Layout,
        c: usize,
        h: usize,
        w: usize,
        filter_size: usize,
        c_input: usize,
        relu: bool,
        bias: bool,
    ) -> Result<Self> {
        assert!(filter_size % 2 == 1, "filter size must be odd");
        let weights = device.alloc_zeroed(c * c_input * filter_size * filter_size)?;
        let biases = if bias { device.alloc_zeroed(c)? } else { DeviceBuffer::default() };
        Ok(Self {
            shape: Shape::new(c, h, w),
            layout,
            c_input,
            filter_size,
            use_relu: relu,
            use_bias: bias,
            weights,
            biases,
        })
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn scratch_requirement(&self) -> ScratchRequirement {
        ScratchRequirement {
            load: self.weights.len(),
            ..ScratchRequirement::NONE
        }
    }

    pub fn weights_bytes(&self) -> usize {
        self.weights.size_in_bytes() + self.biases.size_in_bytes()
    }

    /// `filter`: [C][Cin][size][size]、`bias`: [C]（bias なしなら無視）
    pub fn load_weights(&mut self, filter: &[f32], bias: &[f32], scratch: &mut [T]) {
        debug_assert_eq!(filter.len(), self.weights.len(), "conv filter length");
        self.weights.copy_from_slice(stage(scratch, filter));
        if self.use_bias {
            debug_assert_eq!(bias.len(), self.shape.c, "conv bias length");
            self.biases.copy_from_host(bias);
        }
    }

    pub fn eval(
        &self,
        n: usize,
        output: &mut [T],
        input: &[T],
        _ws: &mut Workspace<T>,
        handles: &MathHandles,
    ) {
        let Shape { c, h, w } = self.shape;
        handles.dnn.convolution_forward(
            self.layout,
            n,
            self.c_input,
            c,
            h,
            w,
            self.filter_size,
            input,
            &self.weights,
            output,
        );
        if self.use_bias || self.use_relu {
            let activation = if self.use_relu { Activation::Relu } else { Activation::None };
            let bias = self.use_bias.then_some(&self.biases[..]);
            handles
                .dnn
                .add_bias_activation(self.layout, n, c, h * w, output, bias, activation);
        }
    }
}
