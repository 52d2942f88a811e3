//! Winograd F(4x4, 3x3) 融合畳み込み層（+ SE）
//!
//! ```text
//! input ─▶ 入力変換 ─▶ V ─▶ 36 バッチ GEMM ─▶ M ─▶ 出力変換 + bias (+ SE) (+ skip) + act ─▶ output
//!                            ▲
//!                 ロード時に変換済みの重み U
//! ```
//!
//! スクラッチは `[V: 36 × tiles × Cin_pad][M: 36 × tiles × C]`。

use super::se::SeParams;
use super::stage;
use crate::device::{Device, DeviceBuffer, Element, GemmPath, MathHandles, Transpose, round_up};
use crate::error::Result;
use crate::kernels::Activation;
use crate::kernels::winograd::{
    self, Destination, Epilogue, TILE_ELEMS, WeightOrder, WinogradGeom,
};
use crate::tensor::{Layout, Shape};
use crate::workspace::{ScratchRequirement, Workspace, require_scratch};

// =============================================================================
// 変換済み重み（残差ブロックと共用）
// =============================================================================

/// Winograd 変換済みの 3x3 フィルタ
#[derive(Debug)]
pub(super) struct WinogradWeights<T: Element> {
    c_out: usize,
    c_in: usize,
    c_in_pad: usize,
    order: WeightOrder,
    transformed: DeviceBuffer<T>,
}

impl<T: Element> WinogradWeights<T> {
    pub fn new(device: &Device, c_out: usize, c_in: usize) -> Result<Self> {
        let order = WeightOrder::for_element::<T>();
        let c_in_pad = round_up(c_in, T::LANES);
        Ok(Self {
            c_out,
            c_in,
            c_in_pad,
            order,
            transformed: device.alloc_zeroed(TILE_ELEMS * c_in_pad * c_out)?,
        })
    }

    #[inline]
    pub fn geom(&self, h: usize, w: usize) -> WinogradGeom {
        WinogradGeom::new(self.c_in, self.c_in_pad, self.c_out, h, w)
    }

    /// ロード時のスクラッチ量（生フィルタ + channel-major 変換結果）
    #[inline]
    pub fn load_len(&self) -> usize {
        self.c_out * self.c_in * 9 + TILE_ELEMS * self.c_out * self.c_in
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.transformed.size_in_bytes()
    }

    /// `filter`: [C][Cin][3][3]
    pub fn load(&mut self, filter: &[f32], scratch: &mut [T]) {
        let raw_len = self.c_out * self.c_in * 9;
        let tf_len = TILE_ELEMS * self.c_out * self.c_in;
        debug_assert_eq!(filter.len(), raw_len, "winograd filter length");
        require_scratch(scratch.len(), raw_len + tf_len);

        let (raw, rest) = scratch.split_at_mut(raw_len);
        let raw = stage(raw, filter);
        let tf = &mut rest[..tf_len];
        winograd::filter_transform(self.c_out, self.c_in, raw, tf);

        match self.order {
            WeightOrder::ChannelMajor => self.transformed.copy_from_slice(tf),
            WeightOrder::ChannelMinor => winograd::to_channel_minor(
                self.c_out,
                self.c_in,
                self.c_in_pad,
                tf,
                &mut self.transformed,
            ),
        }
    }

    /// `M[e] = V[e] · U[e]`（e = 0..36）
    #[allow(clippy::too_many_arguments)]
    pub fn gemm(
        &self,
        handles: &MathHandles,
        path: GemmPath,
        geom: &WinogradGeom,
        n: usize,
        v: &[T],
        m: &mut [T],
    ) {
        let trans_b = match self.order {
            WeightOrder::ChannelMajor => Transpose::Yes,
            WeightOrder::ChannelMinor => Transpose::No,
        };
        handles.blas.gemm_batched(
            path,
            trans_b,
            n * geom.tiles_per_sample(),
            self.c_out,
            self.c_in_pad,
            v,
            &self.transformed,
            m,
            TILE_ELEMS,
        );
    }
}

// =============================================================================
// 融合畳み込み層
// =============================================================================

/// 3x3 / ストライド 1 / "same" パディングの融合 Winograd 畳み込み
#[derive(Debug)]
pub struct FusedWinogradConvLayer<T: Element> {
    shape: Shape,
    layout: Layout,
    use_relu: bool,
    use_bias: bool,
    skip_add: bool,
    gemm_path: GemmPath,
    weights: WinogradWeights<T>,
    biases: DeviceBuffer<T>,
    se: Option<SeParams<T>>,
}

impl<T: Element> FusedWinogradConvLayer<T> {
    /// 新規作成
    ///
    /// `se` が真なら `se_k` は SE の FC1 出力数。
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
        skip_add: bool,
        se: bool,
        se_k: usize,
        use_gemm_ex: bool,
    ) -> Result<Self> {
        let se = if se { Some(SeParams::new(device, c, se_k)?) } else { None };
        Ok(Self {
            shape: Shape::new(c, h, w),
            layout,
            use_relu: relu,
            use_bias: bias,
            skip_add,
            gemm_path: GemmPath::select(use_gemm_ex),
            weights: WinogradWeights::new(device, c, c_input)?,
            biases: device.alloc_zeroed(c)?,
            se,
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

    pub fn scratch_requirement(&self, max_batch: usize) -> ScratchRequirement {
        let geom = self.weights.geom(self.shape.h, self.shape.w);
        let se_load = self.se.as_ref().map_or(0, SeParams::load_len);
        ScratchRequirement {
            eval: geom.transformed_input_len(max_batch) + geom.transformed_output_len(max_batch),
            load: self.weights.load_len().max(se_load),
            carry: 0,
        }
    }

    pub fn weights_bytes(&self) -> usize {
        self.weights.size_in_bytes()
            + self.biases.size_in_bytes()
            + self.se.as_ref().map_or(0, SeParams::size_in_bytes)
    }

    /// `filter`: [C][Cin][3][3]、`bias`: [C]
    pub fn load_weights(&mut self, filter: &[f32], bias: &[f32], scratch: &mut [T]) {
        self.weights.load(filter, scratch);
        if self.use_bias {
            debug_assert_eq!(bias.len(), self.shape.c, "conv bias length");
            self.biases.copy_from_slice(stage(scratch, bias));
        }
    }

    /// `w1`: [K][C]、`b1`: [K]、`w2`: [2C][K]、`b2`: [2C]
    pub fn load_se_weights(&mut self, w1: &[f32], b1: &[f32], w2: &[f32], b2: &[f32], scratch: &mut [T]) {
        let Some(se) = self.se.as_mut() else {
            panic!("layer was constructed without SE");
        };
        se.load(w1, b1, w2, b2, scratch);
    }

    pub fn eval(
        &self,
        n: usize,
        output: &mut [T],
        input: &[T],
        input2: Option<&[T]>,
        ws: &mut Workspace<T>,
        handles: &MathHandles,
    ) {
        let geom = self.weights.geom(self.shape.h, self.shape.w);
        let v_len = geom.transformed_input_len(n);
        let m_len = geom.transformed_output_len(n);
        require_scratch(ws.scratch.len(), v_len + m_len);

        let (v, rest) = ws.scratch.split_at_mut(v_len);
        let m = &mut rest[..m_len];

        winograd::input_transform(&geom, self.layout, n, input, v);
        self.weights.gemm(handles, self.gemm_path, &geom, n, v, m);

        let skip = if self.skip_add {
            let Some(skip) = input2 else {
                panic!("skip-add convolution requires input2");
            };
            Some(skip)
        } else {
            None
        };
        let epilogue = Epilogue {
            bias: self.use_bias.then_some(&self.biases[..]),
            skip,
            se: self.se.as_ref().map(|p| p.view(self.shape.c)),
            activation: if self.use_relu { Activation::Relu } else { Activation::None },
        };
        winograd::output_transform(
            &geom,
            self.layout,
            n,
            m,
            Destination::Tensor(output),
            &epilogue,
            None,
        );
    }
}
