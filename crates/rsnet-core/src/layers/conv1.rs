//! 1x1 畳み込み層（GEMM）

use super::stage;
use crate::device::{Device, DeviceBuffer, Element, GemmPath, MathHandles, Transpose};
use crate::error::Result;
use crate::kernels::Activation;
use crate::tensor::{Layout, Shape};
use crate::workspace::ScratchRequirement;

/// 1x1 畳み込み + bias + (ReLU)
///
/// ```text
/// NCHW: out[s] (C × HW)     = W (C × Cin) · in[s] (Cin × HW)   サンプルごと
/// NHWC: out (N·HW × C)      = in (N·HW × Cin) · Wᵀ              1 回
/// ```
#[derive(Debug)]
pub struct Conv1Layer<T: Element> {
    shape: Shape,
    layout: Layout,
    c_input: usize,
    use_relu: bool,
    use_bias: bool,
    gemm_path: GemmPath,
    /// [C][Cin]
    weights: DeviceBuffer<T>,
    biases: DeviceBuffer<T>,
}

impl<T: Element> Conv1Layer<T> {
    /// 新規作成
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        layout: Layout,
        c: usize,
        h: usize,
        w: usize,
        c_input: usize,
        relu: bool,
        bias: bool,
        use_gemm_ex: bool,
    ) -> Result<Self> {
        Ok(Self {
            shape: Shape::new(c, h, w),
            layout,
            c_input,
            use_relu: relu,
            use_bias: bias,
            gemm_path: GemmPath::select(use_gemm_ex),
            weights: device.alloc_zeroed(c * c_input)?,
            biases: if bias { device.alloc_zeroed(c)? } else { DeviceBuffer::default() },
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

    /// `filter`: [C][Cin]、`bias`: [C]
    pub fn load_weights(&mut self, filter: &[f32], bias: &[f32], scratch: &mut [T]) {
        debug_assert_eq!(filter.len(), self.weights.len(), "conv1 filter length");
        self.weights.copy_from_slice(stage(scratch, filter));
        if self.use_bias {
            debug_assert_eq!(bias.len(), self.shape.c, "conv1 bias length");
            self.biases.copy_from_host(bias);
        }
    }

    pub fn eval(&self, n: usize, output: &mut [T], input: &[T], handles: &MathHandles) {
        let c = self.shape.c;
        let hw = self.shape.plane();
        let cin = self.c_input;

        match self.layout {
            Layout::Nchw => {
                for s in 0..n {
                    handles.blas.gemm_batched(
                        self.gemm_path,
                        Transpose::No,
                        c,
                        hw,
                        cin,
                        &self.weights,
                        &input[s * cin * hw..(s + 1) * cin * hw],
                        &mut output[s * c * hw..(s + 1) * c * hw],
                        1,
                    );
                }
            }
            Layout::Nhwc => {
                handles.blas.gemm_batched(
                    self.gemm_path,
                    Transpose::Yes,
                    n * hw,
                    c,
                    cin,
                    input,
                    &self.weights,
                    output,
                    1,
                );
            }
        }

        if self.use_bias || self.use_relu {
            let activation = if self.use_relu { Activation::Relu } else { Activation::None };
            let bias = self.use_bias.then_some(&self.biases[..]);
            handles.dnn.add_bias_activation(self.layout, n, c, hw, output, bias, activation);
        }
    }
}
