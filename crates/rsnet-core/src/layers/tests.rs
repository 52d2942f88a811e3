//! 層の統合テスト
//!
//! 融合 Winograd 経路を直接畳み込み（f32 ホスト計算）と突き合わせる。

use super::*;
use crate::device::Device;
use crate::error::Error;
use crate::kernels::{self, Activation, sigmoid};
use crate::tensor::{nchw_to_nhwc, nhwc_to_nchw};
use crate::workspace::ScratchPlan;
use half::f16;
use proptest::prelude::*;

// =============================================================================
// ヘルパー
// =============================================================================

/// [-1, 1) の決定的な疑似乱数列
fn pattern(len: usize, seed: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7919 + seed * 104_729) % 2001) as f32 / 1000.0 - 1.0)
        .map(|v| v * scale)
        .collect()
}

/// 要素型で表現できる値に丸める
fn quantize<T: Element>(v: &[f32]) -> Vec<f32> {
    v.iter().map(|&x| T::from_f32(x).to_f32()).collect()
}

fn to_layout(v: &[f32], n: usize, shape: Shape, layout: Layout) -> Vec<f32> {
    match layout {
        Layout::Nchw => v.to_vec(),
        Layout::Nhwc => nchw_to_nhwc(v, n, shape),
    }
}

fn from_layout(v: &[f32], n: usize, shape: Shape, layout: Layout) -> Vec<f32> {
    match layout {
        Layout::Nchw => v.to_vec(),
        Layout::Nhwc => nhwc_to_nchw(v, n, shape),
    }
}

fn assert_close(actual: &[f32], expected: &[f32], abs: f32, rel: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = abs + rel * e.abs();
        assert!((a - e).abs() <= tol, "mismatch at {i}: {a} vs {e} (tol {tol})");
    }
}

/// 精度ごとの許容誤差 (abs, rel)
fn tolerance<T: Element>() -> (f32, f32) {
    match T::PRECISION {
        crate::device::Precision::Fp32 => (1e-3, 1e-3),
        crate::device::Precision::Fp16 => (3e-2, 2e-2),
    }
}

/// NCHW の 3x3 畳み込み + bias
#[allow(clippy::too_many_arguments)]
fn reference_conv(
    n: usize,
    c_in: usize,
    c: usize,
    h: usize,
    w: usize,
    input: &[f32],
    filter: &[f32],
    bias: &[f32],
) -> Vec<f32> {
    let mut out = vec![0.0f32; n * c * h * w];
    kernels::conv_direct(Layout::Nchw, n, c_in, c, h, w, 3, input, filter, &mut out);
    for (i, v) in out.iter_mut().enumerate() {
        *v += bias[(i / (h * w)) % c];
    }
    out
}

/// NCHW 上の SE ゲート（skip・活性化なし）
struct HostSe {
    k: usize,
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: Vec<f32>,
}

impl HostSe {
    fn new(c: usize, k: usize, seed: usize) -> Self {
        Self {
            k,
            w1: pattern(k * c, seed, 0.3),
            b1: pattern(k, seed + 1, 0.1),
            w2: pattern(2 * c * k, seed + 2, 0.3),
            b2: pattern(2 * c, seed + 3, 0.1),
        }
    }

    fn quantized<T: Element>(&self) -> Self {
        Self {
            k: self.k,
            w1: quantize::<T>(&self.w1),
            b1: quantize::<T>(&self.b1),
            w2: quantize::<T>(&self.w2),
            b2: quantize::<T>(&self.b2),
        }
    }

    fn gate(&self, n: usize, c: usize, hw: usize, x: &mut [f32]) {
        for sample in x.chunks_exact_mut(c * hw).take(n) {
            let pooled: Vec<f32> = (0..c)
                .map(|ch| sample[ch * hw..(ch + 1) * hw].iter().sum::<f32>() / hw as f32)
                .collect();
            let hidden: Vec<f32> = (0..self.k)
                .map(|j| {
                    let dot: f32 = (0..c).map(|i| self.w1[j * c + i] * pooled[i]).sum();
                    (dot + self.b1[j]).max(0.0)
                })
                .collect();
            let gates: Vec<f32> = (0..2 * c)
                .map(|i| {
                    let dot: f32 = (0..self.k).map(|j| self.w2[i * self.k + j] * hidden[j]).sum();
                    dot + self.b2[i]
                })
                .collect();
            for ch in 0..c {
                let scale = sigmoid(gates[ch]);
                let shift = gates[c + ch];
                for v in &mut sample[ch * hw..(ch + 1) * hw] {
                    *v = scale * *v + shift;
                }
            }
        }
    }
}

// =============================================================================
// 出力サイズ
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_output_size_matches_shape(
        c in 1usize..12,
        cin in 1usize..12,
        h in 1usize..10,
        w in 1usize..10,
        n in 0usize..17,
    ) {
        let device = Device::new();
        let layout = Layout::Nchw;
        let in_shape = Shape::new(cin, h, w);
        let layers: Vec<(Layer<f32>, Shape)> = vec![
            (Layer::Conv(ConvLayer::new(&device, layout, c, h, w, 3, cin, true, true).unwrap()), Shape::new(c, h, w)),
            (Layer::Conv1(Conv1Layer::new(&device, layout, c, h, w, cin, true, true, false).unwrap()), Shape::new(c, h, w)),
            (Layer::FullyConnected(FcLayer::new(&device, layout, in_shape, c, 1, 1, false, true, true, false).unwrap()), Shape::new(c, 1, 1)),
            (Layer::SoftMax(SoftMaxLayer::new(layout, in_shape)), in_shape),
            (Layer::PolicyMap(PolicyMapLayer::new(&device, layout, in_shape, c, 1, 1, in_shape.numel()).unwrap()), Shape::new(c, 1, 1)),
            (Layer::SqueezeExcite(SeLayer::new(&device, layout, in_shape, 2, true).unwrap()), in_shape),
            (Layer::FusedWinogradConv(FusedWinogradConvLayer::new(&device, layout, c, h, w, cin, true, true, false, true, 2, false).unwrap()), Shape::new(c, h, w)),
            (Layer::ResidualBlock(ResidualBlock::new(&device, layout, c, h, w, false, 0, true, true, false).unwrap()), Shape::new(c, h, w)),
        ];
        for (layer, shape) in &layers {
            prop_assert_eq!(layer.shape(), *shape);
            prop_assert_eq!(layer.output_size(n), n * shape.c * shape.h * shape.w * 4);
        }

        let half_conv = Layer::<f16>::Conv1(Conv1Layer::new(&device, layout, c, h, w, cin, false, false, true).unwrap());
        prop_assert_eq!(half_conv.output_size(n), n * c * h * w * 2);
    }
}

// =============================================================================
// 融合 Winograd 畳み込み
// =============================================================================

#[derive(Clone, Copy)]
struct ConvCase {
    n: usize,
    c_in: usize,
    c: usize,
    h: usize,
    w: usize,
    skip: bool,
    se: bool,
}

struct ConvData {
    input: Vec<f32>,
    filter: Vec<f32>,
    bias: Vec<f32>,
    skip: Vec<f32>,
    se: HostSe,
}

impl ConvCase {
    fn data(&self) -> ConvData {
        ConvData {
            input: pattern(self.n * self.c_in * self.h * self.w, 1, 1.0),
            filter: pattern(self.c * self.c_in * 9, 2, 0.2),
            bias: pattern(self.c, 3, 0.5),
            skip: pattern(self.n * self.c * self.h * self.w, 4, 1.0),
            se: HostSe::new(self.c, 4, 10),
        }
    }

    /// 直接畳み込みによる基準値（NCHW）
    fn reference<T: Element>(&self, d: &ConvData) -> Vec<f32> {
        let mut out = reference_conv(
            self.n,
            self.c_in,
            self.c,
            self.h,
            self.w,
            &quantize::<T>(&d.input),
            &quantize::<T>(&d.filter),
            &quantize::<T>(&d.bias),
        );
        if self.se {
            d.se
                .quantized::<T>()
                .gate(self.n, self.c, self.h * self.w, &mut out);
        }
        if self.skip {
            for (v, s) in out.iter_mut().zip(quantize::<T>(&d.skip)) {
                *v += s;
            }
        }
        out.iter().map(|v| v.max(0.0)).collect()
    }

    /// 融合層の出力（NCHW に戻して返す）
    fn run<T: Element>(&self, d: &ConvData, layout: Layout, use_gemm_ex: bool) -> Vec<f32> {
        let device = Device::new();
        let handles = MathHandles::new();
        let mut layer = FusedWinogradConvLayer::<T>::new(
            &device, layout, self.c, self.h, self.w, self.c_in, true, true, self.skip, self.se, d.se.k,
            use_gemm_ex,
        )
        .unwrap();
        let req = layer.scratch_requirement(self.n);
        let mut ws = Workspace::<T>::scratch_only(&device, req.scratch_len()).unwrap();
        layer.load_weights(&d.filter, &d.bias, &mut ws.scratch);
        if self.se {
            layer.load_se_weights(&d.se.w1, &d.se.b1, &d.se.w2, &d.se.b2, &mut ws.scratch);
        }

        let in_shape = Shape::new(self.c_in, self.h, self.w);
        let out_shape = Shape::new(self.c, self.h, self.w);
        let input = device
            .upload::<T>(&to_layout(&d.input, self.n, in_shape, layout))
            .unwrap();
        let skip = if self.skip {
            Some(device.upload::<T>(&to_layout(&d.skip, self.n, out_shape, layout)).unwrap())
        } else {
            None
        };
        let mut output = device.alloc_zeroed::<T>(self.n * out_shape.numel()).unwrap();
        layer.eval(self.n, &mut output, &input, skip.as_deref(), &mut ws, &handles);
        from_layout(&output.to_host(), self.n, out_shape, layout)
    }
}

const CASES: [ConvCase; 4] = [
    ConvCase { n: 2, c_in: 5, c: 6, h: 7, w: 7, skip: false, se: false },
    ConvCase { n: 2, c_in: 5, c: 6, h: 8, w: 8, skip: true, se: false },
    ConvCase { n: 3, c_in: 4, c: 4, h: 5, w: 9, skip: false, se: true },
    ConvCase { n: 2, c_in: 6, c: 3, h: 8, w: 8, skip: true, se: true },
];

fn check_fused_against_direct<T: Element>() {
    let (abs, rel) = tolerance::<T>();
    for case in CASES {
        let d = case.data();
        let expected = case.reference::<T>(&d);
        for layout in [Layout::Nchw, Layout::Nhwc] {
            let actual = case.run::<T>(&d, layout, false);
            assert_close(&actual, &expected, abs, rel);
        }
    }
}

#[test]
fn test_fused_winograd_matches_direct_f32() {
    check_fused_against_direct::<f32>();
}

#[test]
fn test_fused_winograd_matches_direct_f16() {
    check_fused_against_direct::<f16>();
}

#[test]
fn test_fused_winograd_gemm_paths_identical() {
    for case in CASES {
        let d = case.data();
        for layout in [Layout::Nchw, Layout::Nhwc] {
            assert_eq!(case.run::<f32>(&d, layout, false), case.run::<f32>(&d, layout, true));
            assert_eq!(case.run::<f16>(&d, layout, false), case.run::<f16>(&d, layout, true));
        }
    }
}

/// 中心タップだけの恒等フィルタ・全 1 入力 → 全 1 出力
fn check_identity<T: Element>(tol: f32) {
    let (c, h, w) = (256, 8, 8);
    let device = Device::new();
    let handles = MathHandles::new();
    let mut layer =
        FusedWinogradConvLayer::<T>::new(&device, Layout::Nchw, c, h, w, c, true, true, false, false, 0, false)
            .unwrap();
    let mut filter = vec![0.0f32; c * c * 9];
    for k in 0..c {
        filter[(k * c + k) * 9 + 4] = 1.0;
    }
    let bias = vec![0.0f32; c];
    let mut ws = Workspace::<T>::scratch_only(&device, layer.scratch_requirement(1).scratch_len()).unwrap();
    layer.load_weights(&filter, &bias, &mut ws.scratch);

    let input = device.upload::<T>(&vec![1.0f32; c * h * w]).unwrap();
    let mut output = device.alloc_zeroed::<T>(c * h * w).unwrap();
    layer.eval(1, &mut output, &input, None, &mut ws, &handles);
    for v in output.to_host() {
        assert!((v - 1.0).abs() < tol, "identity output {v}");
    }
}

#[test]
fn test_identity_filter_all_ones_f32() {
    check_identity::<f32>(1e-4);
}

#[test]
fn test_identity_filter_all_ones_f16() {
    check_identity::<f16>(1e-2);
}

#[test]
fn test_larger_workspace_is_tolerated() {
    let case = CASES[3];
    let d = case.data();
    let device = Device::new();
    let handles = MathHandles::new();
    let mut layer = FusedWinogradConvLayer::<f32>::new(
        &device, Layout::Nchw, case.c, case.h, case.w, case.c_in, true, true, true, true, d.se.k, false,
    )
    .unwrap();
    let need = layer.scratch_requirement(case.n).scratch_len();
    let mut ws = Workspace::<f32>::scratch_only(&device, need * 2 + 17).unwrap();
    layer.load_weights(&d.filter, &d.bias, &mut ws.scratch);
    layer.load_se_weights(&d.se.w1, &d.se.b1, &d.se.w2, &d.se.b2, &mut ws.scratch);
    let input = device.upload::<f32>(&d.input).unwrap();
    let skip = device.upload::<f32>(&d.skip).unwrap();
    let mut output = device.alloc_zeroed::<f32>(case.n * case.c * case.h * case.w).unwrap();
    layer.eval(case.n, &mut output, &input, Some(&skip), &mut ws, &handles);
    assert_close(&output.to_host(), &case.run::<f32>(&d, Layout::Nchw, false), 0.0, 0.0);
}

#[test]
#[should_panic(expected = "scratch too small")]
fn test_undersized_scratch_panics() {
    let device = Device::new();
    let handles = MathHandles::new();
    let layer =
        FusedWinogradConvLayer::<f32>::new(&device, Layout::Nchw, 4, 8, 8, 4, true, true, false, false, 0, false)
            .unwrap();
    let need = layer.scratch_requirement(2).eval;
    let mut ws = Workspace::<f32>::scratch_only(&device, need - 1).unwrap();
    let input = vec![0.0f32; 2 * 4 * 64];
    let mut output = vec![0.0f32; 2 * 4 * 64];
    layer.eval(2, &mut output, &input, None, &mut ws, &handles);
}

// =============================================================================
// SE
// =============================================================================

/// bias なし畳み込み + SE(前段 bias 加算) == bias あり畳み込み + SE
#[test]
fn test_se_prev_bias_placement_is_invisible() {
    let (n, c, h, w) = (2, 6, 8, 8);
    let device = Device::new();
    let handles = MathHandles::new();
    let shape = Shape::new(c, h, w);
    let filter = pattern(c * c * 9, 21, 0.2);
    let bias = pattern(c, 22, 0.5);
    let se = HostSe::new(c, 3, 30);
    let input = device.upload::<f32>(&pattern(n * c * h * w, 23, 1.0)).unwrap();
    let skip = device.upload::<f32>(&pattern(n * c * h * w, 24, 1.0)).unwrap();
    let mut ws = Workspace::<f32>::scratch_only(&device, c * c * 9).unwrap();

    let run = |conv_bias: bool, layout: Layout, ws: &mut Workspace<f32>| {
        let mut conv = ConvLayer::<f32>::new(&device, layout, c, h, w, 3, c, false, conv_bias).unwrap();
        conv.load_weights(&filter, &bias, &mut ws.scratch);
        let mut se_layer = SeLayer::<f32>::new(&device, layout, shape, se.k, !conv_bias).unwrap();
        se_layer.load_weights(
            &se.w1,
            &se.b1,
            &se.w2,
            &se.b2,
            (!conv_bias).then_some(&bias[..]),
            &mut ws.scratch,
        );
        let mut mid = device.alloc_zeroed::<f32>(n * shape.numel()).unwrap();
        let mut out = device.alloc_zeroed::<f32>(n * shape.numel()).unwrap();
        conv.eval(n, &mut mid, &input, ws, &handles);
        se_layer.eval(n, &mut out, &mid, Some(&skip));
        out.to_host()
    };

    let with_prev_bias = run(false, Layout::Nchw, &mut ws);
    let with_conv_bias = run(true, Layout::Nchw, &mut ws);
    assert_close(&with_prev_bias, &with_conv_bias, 1e-5, 1e-5);

    // 基準: bias あり畳み込み → ゲート → skip → ReLU
    let mut expected = reference_conv(
        n,
        c,
        c,
        h,
        w,
        &pattern(n * c * h * w, 23, 1.0),
        &filter,
        &bias,
    );
    se.gate(n, c, h * w, &mut expected);
    let skip_host = pattern(n * c * h * w, 24, 1.0);
    for (v, s) in expected.iter_mut().zip(&skip_host) {
        *v = (*v + s).max(0.0);
    }
    assert_close(&with_conv_bias, &expected, 1e-4, 1e-4);
}

#[test]
#[should_panic(expected = "requires the skip tensor")]
fn test_standalone_se_requires_input2() {
    let device = Device::new();
    let layer = SeLayer::<f32>::new(&device, Layout::Nchw, Shape::new(2, 2, 2), 1, false).unwrap();
    let input = [0.0f32; 8];
    let mut output = [0.0f32; 8];
    layer.eval(1, &mut output, &input, None);
}

// =============================================================================
// 残差ブロック
// =============================================================================

struct BlockData {
    filter0: Vec<f32>,
    bias0: Vec<f32>,
    filter1: Vec<f32>,
    bias1: Vec<f32>,
    se: HostSe,
}

impl BlockData {
    fn new(c: usize, seed: usize) -> Self {
        Self {
            filter0: pattern(c * c * 9, seed, 0.15),
            bias0: pattern(c, seed + 1, 0.3),
            filter1: pattern(c * c * 9, seed + 2, 0.15),
            bias1: pattern(c, seed + 3, 0.3),
            se: HostSe::new(c, 3, seed + 4),
        }
    }

    fn reference(&self, n: usize, c: usize, h: usize, w: usize, se: bool, x: &[f32]) -> Vec<f32> {
        let mid: Vec<f32> = reference_conv(n, c, c, h, w, x, &self.filter0, &self.bias0)
            .into_iter()
            .map(|v| v.max(0.0))
            .collect();
        let mut y = reference_conv(n, c, c, h, w, &mid, &self.filter1, &self.bias1);
        if se {
            self.se.gate(n, c, h * w, &mut y);
        }
        y.iter().zip(x).map(|(v, s)| (v + s).max(0.0)).collect()
    }
}

fn build_tower<T: Element>(
    device: &Device,
    layout: Layout,
    blocks: &[BlockData],
    c: usize,
    h: usize,
    w: usize,
    se: bool,
    use_gemm_ex: bool,
) -> (Vec<ResidualBlock<T>>, Workspace<T>) {
    let count = blocks.len();
    let mut tower: Vec<ResidualBlock<T>> = (0..count)
        .map(|i| {
            ResidualBlock::new(device, layout, c, h, w, se, 3, use_gemm_ex, i == 0, i + 1 == count).unwrap()
        })
        .collect();
    let plan: ScratchPlan = tower.iter().map(|b| b.scratch_requirement(4)).collect();
    let mut ws = Workspace::<T>::new(device, &plan).unwrap();
    for (block, data) in tower.iter_mut().zip(blocks) {
        block.load_weights0(&data.filter0, &data.bias0, &mut ws.scratch);
        block.load_weights1(&data.filter1, &data.bias1, &mut ws.scratch);
        if se {
            block.load_se_weights(&data.se.w1, &data.se.b1, &data.se.w2, &data.se.b2, &mut ws.scratch);
        }
    }
    (tower, ws)
}

/// ブロック列を評価し、NCHW で返す
fn run_tower<T: Element>(
    layout: Layout,
    blocks: &[BlockData],
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    se: bool,
    input: &[f32],
) -> Vec<f32> {
    let device = Device::new();
    let handles = MathHandles::new();
    let shape = Shape::new(c, h, w);
    let (tower, mut ws) = build_tower::<T>(&device, layout, blocks, c, h, w, se, false);

    let mut cur = device.upload::<T>(&to_layout(input, n, shape, layout)).unwrap();
    for block in &tower {
        let mut next = device.alloc_zeroed::<T>(n * shape.numel()).unwrap();
        let input2 = (!block.is_first()).then_some(&cur[..]);
        block.eval(n, &mut next, &cur, input2, &mut ws, &handles);
        cur = next;
    }
    from_layout(&cur.to_host(), n, shape, layout)
}

#[test]
fn test_residual_tower_matches_composed_reference() {
    let (n, c, h, w) = (2, 8, 8, 8);
    let input = pattern(n * c * h * w, 40, 1.0);
    for se in [false, true] {
        let blocks: Vec<BlockData> = (0..3).map(|i| BlockData::new(c, 50 + i * 10)).collect();
        let mut expected = input.clone();
        for data in &blocks {
            expected = data.reference(n, c, h, w, se, &expected);
        }
        for layout in [Layout::Nchw, Layout::Nhwc] {
            let actual = run_tower::<f32>(layout, &blocks, n, c, h, w, se, &input);
            assert_close(&actual, &expected, 1e-3, 1e-3);
        }
    }
}

#[test]
fn test_residual_single_block_f16() {
    let (n, c, h, w) = (1, 8, 8, 8);
    let input = quantize::<f16>(&pattern(n * c * h * w, 41, 1.0));
    let blocks = vec![BlockData::new(c, 90)];
    let expected = blocks[0].reference(n, c, h, w, true, &input);
    let actual = run_tower::<f16>(Layout::Nhwc, &blocks, n, c, h, w, true, &input);
    assert_close(&actual, &expected, 5e-2, 3e-2);
}

#[test]
fn test_first_block_ignores_input2() {
    let (n, c, h, w) = (2, 4, 8, 8);
    let device = Device::new();
    let handles = MathHandles::new();
    let blocks = vec![BlockData::new(c, 70)];
    let (tower, mut ws) = build_tower::<f32>(&device, Layout::Nchw, &blocks, c, h, w, false, false);
    let input = pattern(n * c * h * w, 71, 1.0);
    let garbage = vec![1.0e6f32; n * c * h * w];

    let mut a = vec![0.0f32; n * c * h * w];
    let mut b = vec![0.0f32; n * c * h * w];
    tower[0].eval(n, &mut a, &input, None, &mut ws, &handles);
    tower[0].eval(n, &mut b, &input, Some(&garbage), &mut ws, &handles);
    assert_eq!(a, b);
}

#[test]
#[should_panic(expected = "requires the skip tensor in input2")]
fn test_non_first_block_requires_input2() {
    let (n, c, h, w) = (1, 4, 8, 8);
    let device = Device::new();
    let handles = MathHandles::new();
    let blocks: Vec<BlockData> = (0..2).map(|i| BlockData::new(c, 80 + i)).collect();
    let (tower, mut ws) = build_tower::<f32>(&device, Layout::Nchw, &blocks, c, h, w, false, false);
    let input = vec![0.5f32; n * c * h * w];
    let mut out = vec![0.0f32; n * c * h * w];
    tower[1].eval(n, &mut out, &input, None, &mut ws, &handles);
}

#[test]
fn test_residual_carry_requirement() {
    let device = Device::new();
    let (c, h, w) = (8, 8, 8);
    let only = ResidualBlock::<f32>::new(&device, Layout::Nchw, c, h, w, false, 0, false, true, true).unwrap();
    let head = ResidualBlock::<f32>::new(&device, Layout::Nchw, c, h, w, false, 0, false, true, false).unwrap();
    let tail = ResidualBlock::<f32>::new(&device, Layout::Nchw, c, h, w, false, 0, false, false, true).unwrap();
    // 36 × (n × 4 tiles) × C
    let v_len = 36 * 3 * 4 * c;
    assert_eq!(only.scratch_requirement(3).carry, 0);
    assert_eq!(head.scratch_requirement(3).carry, v_len);
    assert_eq!(tail.scratch_requirement(3).carry, v_len);
    assert_eq!(head.scratch_requirement(3).eval, 2 * v_len + c * h * w);
}

// =============================================================================
// 単純な層
// =============================================================================

#[test]
fn test_conv1_matches_direct_both_layouts() {
    let (n, c_in, c, h, w) = (3, 5, 4, 3, 4);
    let device = Device::new();
    let handles = MathHandles::new();
    let filter = pattern(c * c_in, 60, 0.5);
    let bias = pattern(c, 61, 0.5);
    let input = pattern(n * c_in * h * w, 62, 1.0);

    let mut expected = vec![0.0f32; n * c * h * w];
    kernels::conv_direct(Layout::Nchw, n, c_in, c, h, w, 1, &input, &filter, &mut expected);
    for (i, v) in expected.iter_mut().enumerate() {
        *v = (*v + bias[(i / (h * w)) % c]).max(0.0);
    }

    for layout in [Layout::Nchw, Layout::Nhwc] {
        for gemm_ex in [false, true] {
            let mut layer = Conv1Layer::<f32>::new(&device, layout, c, h, w, c_in, true, true, gemm_ex).unwrap();
            let mut ws = Workspace::<f32>::scratch_only(&device, layer.scratch_requirement().scratch_len()).unwrap();
            layer.load_weights(&filter, &bias, &mut ws.scratch);
            let x = to_layout(&input, n, Shape::new(c_in, h, w), layout);
            let mut out = vec![0.0f32; n * c * h * w];
            layer.eval(n, &mut out, &x, &handles);
            let out = from_layout(&out, n, Shape::new(c, h, w), layout);
            assert_close(&out, &expected, 1e-5, 1e-5);
        }
    }
}

#[test]
fn test_fc_nhwc_weight_permutation() {
    let n = 2;
    let in_shape = Shape::new(3, 2, 2);
    let (out_c, device, handles) = (5, Device::new(), MathHandles::new());
    let weights = pattern(out_c * in_shape.numel(), 63, 0.5);
    let bias = pattern(out_c, 64, 0.5);
    let input = pattern(n * in_shape.numel(), 65, 1.0);

    let mut results = Vec::new();
    for layout in [Layout::Nchw, Layout::Nhwc] {
        let mut fc = FcLayer::<f32>::new(&device, layout, in_shape, out_c, 1, 1, false, true, true, false).unwrap();
        assert_eq!(fc.activation(), Activation::Tanh);
        let mut ws = Workspace::<f32>::scratch_only(&device, fc.scratch_requirement().scratch_len()).unwrap();
        fc.load_weights(&weights, &bias, &mut ws.scratch);
        let x = to_layout(&input, n, in_shape, layout);
        let mut out = vec![0.0f32; n * out_c];
        fc.eval(n, &mut out, &x, &handles);
        results.push(out);
    }
    assert_close(&results[1], &results[0], 1e-6, 1e-6);

    // サンプル 0 の出力 0 を手計算
    let dot: f32 = (0..in_shape.numel()).map(|i| weights[i] * input[i]).sum();
    assert!((results[0][0] - (dot + bias[0]).tanh()).abs() < 1e-5);
}

#[test]
fn test_softmax_layer_rows_sum_to_one() {
    let handles = MathHandles::new();
    let layer = SoftMaxLayer::new(Layout::Nchw, Shape::new(3, 1, 1));
    let input = [1.0f32, 2.0, 3.0, -5.0, 0.0, 5.0];
    let mut out = [0.0f32; 6];
    layer.eval(2, &mut out, &input, &handles);
    for row in out.chunks(3) {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}

// =============================================================================
// ポリシーマップ
// =============================================================================

/// 入力 4×2×2（有効 3 チャネル）→ 出力 10
fn policy_fixture(device: &Device, layout: Layout) -> PolicyMapLayer {
    let in_shape = Shape::new(4, 2, 2);
    let mut layer = PolicyMapLayer::new(device, layout, in_shape, 10, 1, 1, 12).unwrap();
    // 偶数位置 i → 出力 i / 2。used_size 以降にも有効な値を置いておく
    let mut table: Vec<i16> = (0..12).map(|i| if i % 2 == 0 { i / 2 } else { -1 }).collect();
    table.extend([9, 8, 7, 6]);
    layer.load_weights(&table);
    layer
}

#[test]
fn test_policy_map_zero_input_never_reads_padding() {
    let device = Device::new();
    let n = 2;
    for layout in [Layout::Nchw, Layout::Nhwc] {
        let layer = policy_fixture(&device, layout);
        assert_eq!(layer.used_size(), 12);
        let expected_len = if layout == Layout::Nchw { 12 } else { 16 };
        assert_eq!(layer.table_len(), expected_len);

        // 有効部分は 0、パディングチャネル（c = 3）は毒値
        let mut input = vec![0.0f32; n * 16];
        for s in 0..n {
            for hw in 0..4 {
                let idx = Layout::offset_hw(layout, 3, hw, 4, 4);
                input[s * 16 + idx] = f32::NAN;
            }
        }
        let mut output = vec![5.0f32; n * 10];
        layer.eval(n, &mut output, &input);
        assert!(output.iter().all(|&v| v == 0.0), "{output:?}");
    }
}

#[test]
fn test_policy_map_layouts_agree() {
    let device = Device::new();
    let n = 2;
    let in_shape = Shape::new(4, 2, 2);
    let input = pattern(n * 16, 66, 1.0);
    let nchw = policy_fixture(&device, Layout::Nchw);
    let nhwc = policy_fixture(&device, Layout::Nhwc);
    let mut a = vec![0.0f32; n * 10];
    let mut b = vec![0.0f32; n * 10];
    nchw.eval(n, &mut a, &input);
    nhwc.eval(n, &mut b, &nchw_to_nhwc(&input, n, in_shape));
    assert_eq!(a, b);
    // 位置 4 → 出力 2
    assert_eq!(a[2], input[4]);
}

// =============================================================================
// デバイスメモリ
// =============================================================================

#[test]
fn test_dropping_layers_returns_memory() {
    let device = Device::new();
    {
        let layers: Vec<Layer<f16>> = vec![
            Layer::ResidualBlock(
                ResidualBlock::new(&device, Layout::Nhwc, 16, 8, 8, true, 4, false, true, false).unwrap(),
            ),
            Layer::FusedWinogradConv(
                FusedWinogradConvLayer::new(&device, Layout::Nhwc, 16, 8, 8, 13, true, true, false, true, 4, true)
                    .unwrap(),
            ),
            Layer::PolicyMap(PolicyMapLayer::new(&device, Layout::Nhwc, Shape::new(16, 8, 8), 100, 1, 1, 900).unwrap()),
        ];
        let owned: usize = layers.iter().map(Layer::weights_bytes).sum();
        assert!(owned > 0);
        assert_eq!(device.bytes_in_use(), owned);
    }
    assert_eq!(device.bytes_in_use(), 0);
}

#[test]
fn test_construction_out_of_memory() {
    let device = Device::with_capacity(64 * 1024);
    // SE の小さなバッファは確保でき、変換済み重みで予算を超える
    let result = FusedWinogradConvLayer::<f32>::new(
        &device, Layout::Nchw, 64, 8, 8, 64, true, true, false, true, 8, false,
    );
    assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    assert_eq!(device.bytes_in_use(), 0);
}

#[test]
fn test_layer_kind_names() {
    let layer = Layer::<f32>::SoftMax(SoftMaxLayer::new(Layout::Nhwc, Shape::new(3, 1, 1)));
    assert_eq!(layer.kind(), "SoftMax");
    assert_eq!(layer.layout(), Layout::Nhwc);
    assert_eq!(layer.scratch_requirement(8), ScratchRequirement::NONE);
}
