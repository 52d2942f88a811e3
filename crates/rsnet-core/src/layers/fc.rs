//! 全結合層

use super::stage;
use crate::device::{Device, DeviceBuffer, Element, GemmPath, MathHandles, Transpose};
use crate::error::Result;
use crate::kernels::Activation;
use crate::tensor::{self, Layout, Shape};
use crate::workspace::ScratchRequirement;

/// 全結合層 `out = act(W · x + b)`
///
/// 入力は 1 サンプルを平坦化したベクトル（長さ = 入力形状の C*H*W）。
/// NHWC では平坦化順が HWC になるため、ロード時に重みの列を並べ替えておく。
#[derive(Debug)]
pub struct FcLayer<T: Element> {
    shape: Shape,
    input_shape: Shape,
    layout: Layout,
    use_bias: bool,
    activation: Activation,
    /// [out][in]
    weights: DeviceBuffer<T>,
    biases: DeviceBuffer<T>,
}

impl<T: Element> FcLayer<T> {
    /// 新規作成
    ///
    /// `relu` / `tanh` / `sigmoid` は高々 1 つ。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        layout: Layout,
        input_shape: Shape,
        c: usize,
        h: usize,
        w: usize,
        relu: bool,
        bias: bool,
        tanh: bool,
        sigmoid: bool,
    ) -> Result<Self> {
        let activation = Activation::from_flags(relu, tanh, sigmoid);
        let shape = Shape::new(c, h, w);
        Ok(Self {
            shape,
            input_shape,
            layout,
            use_bias: bias,
            activation,
            weights: device.alloc_zeroed(shape.numel() * input_shape.numel())?,
            biases: if bias { device.alloc_zeroed(shape.numel())? } else { DeviceBuffer::default() },
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

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
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

    /// `weights`: [out][in]（in は CHW 平坦化順）、`bias`: [out]
    pub fn load_weights(&mut self, weights: &[f32], bias: &[f32], scratch: &mut [T]) {
        let rows = self.shape.numel();
        debug_assert_eq!(weights.len(), self.weights.len(), "fc weights length");

        if self.layout == Layout::Nhwc && self.input_shape.plane() > 1 {
            let permuted = tensor::permute_columns_chw_to_hwc(weights, rows, self.input_shape);
            self.weights.copy_from_slice(stage(scratch, &permuted));
        } else {
            self.weights.copy_from_slice(stage(scratch, weights));
        }

        if self.use_bias {
            debug_assert_eq!(bias.len(), rows, "fc bias length");
            self.biases.copy_from_host(bias);
        }
    }

    pub fn eval(&self, n: usize, output: &mut [T], input: &[T], handles: &MathHandles) {
        let out = self.shape.numel();
        let inp = self.input_shape.numel();
        handles.blas.gemm_batched(
            GemmPath::StridedBatched,
            Transpose::Yes,
            n,
            out,
            inp,
            input,
            &self.weights,
            output,
            1,
        );
        if self.use_bias || self.activation != Activation::None {
            let bias = self.use_bias.then_some(&self.biases[..]);
            handles
                .dnn
                .add_bias_activation(Layout::Nchw, n, out, 1, output, bias, self.activation);
        }
    }
}
