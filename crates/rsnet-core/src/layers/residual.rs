//! 融合残差ブロック
//!
//! ```text
//! x ─▶ conv0 (bias + ReLU) ─▶ conv1 (bias, SE?) ─▶ + x ─▶ ReLU ─▶ out
//! ```
//!
//! 2 つの Winograd 畳み込みを、出力変換と次の入力変換を融合して 1 本のパスにつなぐ。
//! 中間の空間テンソルはサンプル 1 個分のステージング領域にしか現れない。
//!
//! # キャリー
//!
//! 最終ブロック以外は、出力パスで次ブロックの入力変換まで済ませてワークスペースの
//! `carry` に書く。次ブロック（`first == false`）は `input` を読まずに `carry` から始める。
//! そのため `first == false` のブロックではスキップテンソルを `input2` で必ず受け取る。
//!
//! # スクラッチ配置
//!
//! ```text
//! [V: 36 × tiles × Cin_pad][M: 36 × tiles × C][staging: C × H × W]
//! ```

use super::fused_winograd::WinogradWeights;
use super::se::SeParams;
use super::stage;
use crate::device::{Device, DeviceBuffer, Element, GemmPath, MathHandles};
use crate::error::Result;
use crate::kernels::Activation;
use crate::kernels::winograd::{self, Destination, Epilogue, FusedInputTransform};
use crate::tensor::{Layout, Shape};
use crate::workspace::{ScratchRequirement, Workspace, require_scratch};

#[derive(Debug)]
pub struct ResidualBlock<T: Element> {
    shape: Shape,
    layout: Layout,
    first: bool,
    last: bool,
    gemm_path: GemmPath,
    weights0: WinogradWeights<T>,
    weights1: WinogradWeights<T>,
    biases0: DeviceBuffer<T>,
    biases1: DeviceBuffer<T>,
    se: Option<SeParams<T>>,
}

impl<T: Element> ResidualBlock<T> {
    /// 新規作成（入出力とも `C × H × W`）
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        layout: Layout,
        c: usize,
        h: usize,
        w: usize,
        se: bool,
        se_k: usize,
        use_gemm_ex: bool,
        first: bool,
        last: bool,
    ) -> Result<Self> {
        let se = if se { Some(SeParams::new(device, c, se_k)?) } else { None };
        Ok(Self {
            shape: Shape::new(c, h, w),
            layout,
            first,
            last,
            gemm_path: GemmPath::select(use_gemm_ex),
            weights0: WinogradWeights::new(device, c, c)?,
            weights1: WinogradWeights::new(device, c, c)?,
            biases0: device.alloc_zeroed(c)?,
            biases1: device.alloc_zeroed(c)?,
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

    #[inline]
    pub fn is_first(&self) -> bool {
        self.first
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn scratch_requirement(&self, max_batch: usize) -> ScratchRequirement {
        let geom = self.weights0.geom(self.shape.h, self.shape.w);
        let v_len = geom.transformed_input_len(max_batch);
        let se_load = self.se.as_ref().map_or(0, SeParams::load_len);
        ScratchRequirement {
            eval: v_len + geom.transformed_output_len(max_batch) + self.shape.numel(),
            load: self.weights0.load_len().max(se_load),
            carry: if self.first && self.last { 0 } else { v_len },
        }
    }

    pub fn weights_bytes(&self) -> usize {
        self.weights0.size_in_bytes()
            + self.weights1.size_in_bytes()
            + self.biases0.size_in_bytes()
            + self.biases1.size_in_bytes()
            + self.se.as_ref().map_or(0, SeParams::size_in_bytes)
    }

    /// 1 つ目の畳み込み（`filter`: [C][C][3][3]、`bias`: [C]）
    pub fn load_weights0(&mut self, filter: &[f32], bias: &[f32], scratch: &mut [T]) {
        debug_assert_eq!(bias.len(), self.shape.c, "block bias0 length");
        self.weights0.load(filter, scratch);
        self.biases0.copy_from_slice(stage(scratch, bias));
    }

    /// 2 つ目の畳み込み
    pub fn load_weights1(&mut self, filter: &[f32], bias: &[f32], scratch: &mut [T]) {
        debug_assert_eq!(bias.len(), self.shape.c, "block bias1 length");
        self.weights1.load(filter, scratch);
        self.biases1.copy_from_slice(stage(scratch, bias));
    }

    pub fn load_se_weights(&mut self, w1: &[f32], b1: &[f32], w2: &[f32], b2: &[f32], scratch: &mut [T]) {
        let Some(se) = self.se.as_mut() else {
            panic!("residual block was constructed without SE");
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
        let skip = if self.first {
            input
        } else {
            let Some(skip) = input2 else {
                panic!("non-first residual block requires the skip tensor in input2");
            };
            skip
        };

        let geom = self.weights0.geom(self.shape.h, self.shape.w);
        let v_len = geom.transformed_input_len(n);
        let m_len = geom.transformed_output_len(n);
        let per = self.shape.numel();

        let Workspace { scratch, carry } = ws;
        require_scratch(scratch.len(), v_len + m_len + per);
        if !self.first || !self.last {
            require_scratch(carry.len(), v_len);
        }

        let (v, rest) = scratch.split_at_mut(v_len);
        let (m, rest) = rest.split_at_mut(m_len);
        let staging = &mut rest[..per];

        // conv0
        if self.first {
            winograd::input_transform(&geom, self.layout, n, input, v);
            self.weights0.gemm(handles, self.gemm_path, &geom, n, v, m);
        } else {
            self.weights0.gemm(handles, self.gemm_path, &geom, n, &carry[..v_len], m);
        }
        let epilogue0 = Epilogue {
            bias: Some(&self.biases0[..]),
            skip: None,
            se: None,
            activation: Activation::Relu,
        };
        winograd::output_transform(
            &geom,
            self.layout,
            n,
            m,
            Destination::Staging(staging),
            &epilogue0,
            Some(FusedInputTransform { geom, dst: &mut *v }),
        );

        // conv1
        self.weights1.gemm(handles, self.gemm_path, &geom, n, v, m);
        let epilogue1 = Epilogue {
            bias: Some(&self.biases1[..]),
            skip: Some(skip),
            se: self.se.as_ref().map(|p| p.view(self.shape.c)),
            activation: Activation::Relu,
        };
        let next = if self.last {
            None
        } else {
            Some(FusedInputTransform {
                geom,
                dst: &mut carry[..v_len],
            })
        };
        winograd::output_transform(
            &geom,
            self.layout,
            n,
            m,
            Destination::Tensor(output),
            &epilogue1,
            next,
        );
    }
}
