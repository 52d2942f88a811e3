//! 単独の Squeeze-Excitation 層
//!
//! (前段 bias 加算 +) 全体平均 → FC1 → ReLU → FC2 → ゲート → スキップ加算 → ReLU

use super::stage;
use crate::device::{Device, DeviceBuffer, Element};
use crate::error::Result;
use crate::kernels::Activation;
use crate::kernels::se::{SeWeights, se_forward};
use crate::tensor::{Layout, Shape};
use crate::workspace::ScratchRequirement;

/// SE ユニットの所有バッファ（単独層と融合畳み込みで共用）
#[derive(Debug, Default)]
pub(crate) struct SeParams<T: Element> {
    pub fc1_out: usize,
    w1: DeviceBuffer<T>,
    b1: DeviceBuffer<T>,
    w2: DeviceBuffer<T>,
    b2: DeviceBuffer<T>,
}

impl<T: Element> SeParams<T> {
    pub fn new(device: &Device, c: usize, fc1_out: usize) -> Result<Self> {
        Ok(Self {
            fc1_out,
            w1: device.alloc_zeroed(fc1_out * c)?,
            b1: device.alloc_zeroed(fc1_out)?,
            w2: device.alloc_zeroed(2 * c * fc1_out)?,
            b2: device.alloc_zeroed(2 * c)?,
        })
    }

    /// `w1`: [K][C]、`b1`: [K]、`w2`: [2C][K]、`b2`: [2C]
    pub fn load(&mut self, w1: &[f32], b1: &[f32], w2: &[f32], b2: &[f32], scratch: &mut [T]) {
        debug_assert_eq!(w1.len(), self.w1.len(), "se w1 length");
        debug_assert_eq!(b1.len(), self.b1.len(), "se b1 length");
        debug_assert_eq!(w2.len(), self.w2.len(), "se w2 length");
        debug_assert_eq!(b2.len(), self.b2.len(), "se b2 length");
        self.w1.copy_from_slice(stage(scratch, w1));
        self.b1.copy_from_slice(stage(scratch, b1));
        self.w2.copy_from_slice(stage(scratch, w2));
        self.b2.copy_from_slice(stage(scratch, b2));
    }

    pub fn view(&self, channels: usize) -> SeWeights<'_, T> {
        SeWeights {
            channels,
            fc1_out: self.fc1_out,
            w1: &self.w1,
            b1: &self.b1,
            w2: &self.w2,
            b2: &self.b2,
        }
    }

    /// ロード時に最も大きいステージング量
    pub fn load_len(&self) -> usize {
        self.w2.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.w1.size_in_bytes()
            + self.b1.size_in_bytes()
            + self.w2.size_in_bytes()
            + self.b2.size_in_bytes()
    }
}

/// 単独 SE 層
///
/// スキップテンソルは `input2` で必ず与える。
/// `add_prev_layer_bias` のとき、bias なしの前段畳み込みに代わってここで bias を足す。
#[derive(Debug)]
pub struct SeLayer<T: Element> {
    shape: Shape,
    layout: Layout,
    add_prev_layer_bias: bool,
    params: SeParams<T>,
    prev_bias: DeviceBuffer<T>,
}

impl<T: Element> SeLayer<T> {
    /// 新規作成（形状は入力と同じ）
    pub fn new(
        device: &Device,
        layout: Layout,
        input_shape: Shape,
        fc1_out: usize,
        add_prev_layer_bias: bool,
    ) -> Result<Self> {
        let c = input_shape.c;
        Ok(Self {
            shape: input_shape,
            layout,
            add_prev_layer_bias,
            params: SeParams::new(device, c, fc1_out)?,
            prev_bias: if add_prev_layer_bias {
                device.alloc_zeroed(c)?
            } else {
                DeviceBuffer::default()
            },
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
            load: self.params.load_len(),
            ..ScratchRequirement::NONE
        }
    }

    pub fn weights_bytes(&self) -> usize {
        self.params.size_in_bytes() + self.prev_bias.size_in_bytes()
    }

    /// `prev_layer_bias` は `add_prev_layer_bias` のときのみ使う
    #[allow(clippy::too_many_arguments)]
    pub fn load_weights(
        &mut self,
        w1: &[f32],
        b1: &[f32],
        w2: &[f32],
        b2: &[f32],
        prev_layer_bias: Option<&[f32]>,
        scratch: &mut [T],
    ) {
        self.params.load(w1, b1, w2, b2, scratch);
        if self.add_prev_layer_bias {
            let Some(bias) = prev_layer_bias else {
                panic!("SE layer expects the previous layer bias");
            };
            debug_assert_eq!(bias.len(), self.shape.c, "se prev bias length");
            self.prev_bias.copy_from_host(bias);
        }
    }

    pub fn eval(&self, n: usize, output: &mut [T], input: &[T], input2: Option<&[T]>) {
        let Some(skip) = input2 else {
            panic!("SE layer requires the skip tensor in input2");
        };
        let prev_bias = self.add_prev_layer_bias.then_some(&self.prev_bias[..]);
        se_forward(
            &self.params.view(self.shape.c),
            self.layout,
            n,
            self.shape.plane(),
            input,
            output,
            Some(skip),
            prev_bias,
            Activation::Relu,
        );
    }
}
