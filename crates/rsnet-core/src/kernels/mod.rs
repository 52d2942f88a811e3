//! デバイスカーネル
//!
//! - `winograd`: F(4x4, 3x3) のフィルタ／入力／出力変換（エピローグ融合込み）
//! - `se`: Squeeze-Excitation のプーリング・FC・ゲーティング
//! - 本ファイル: 活性化、バイアス加算、直接畳み込み、softmax、ポリシー gather
//!
//! 全カーネルは要素を f32 に展開して計算し、書き込み時に要素型へ丸める。

pub mod se;
pub mod winograd;

use crate::device::Element;
use crate::stats::{KernelKind, count_launch};
use crate::tensor::{Layout, Shape};
use serde::{Deserialize, Serialize};

/// 活性化関数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    /// FC 層のフラグ群から活性化を決める（排他）
    pub fn from_flags(relu: bool, tanh: bool, sigmoid: bool) -> Self {
        assert!(
            (relu as u8 + tanh as u8 + sigmoid as u8) <= 1,
            "relu/tanh/sigmoid are mutually exclusive"
        );
        if relu {
            Self::Relu
        } else if tanh {
            Self::Tanh
        } else if sigmoid {
            Self::Sigmoid
        } else {
            Self::None
        }
    }

    #[inline(always)]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Self::None => v,
            Self::Relu => v.max(0.0),
            Self::Tanh => v.tanh(),
            Self::Sigmoid => sigmoid(v),
        }
    }
}

#[inline(always)]
pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// チャネルごとのバイアス加算と活性化（インプレース）
pub fn add_bias_activation<T: Element>(
    layout: Layout,
    n: usize,
    c: usize,
    hw: usize,
    data: &mut [T],
    bias: Option<&[T]>,
    activation: Activation,
) {
    let per = c * hw;
    for sample in data[..n * per].chunks_exact_mut(per) {
        for ch in 0..c {
            let b = bias.map_or(0.0, |b| b[ch].to_f32());
            for p in 0..hw {
                let idx = layout.offset_hw(ch, p, c, hw);
                sample[idx] = T::from_f32(activation.apply(sample[idx].to_f32() + b));
            }
        }
    }
}

/// 直接畳み込み（"same" パディング、ストライド 1、奇数フィルタ）
///
/// `filter`: [c_out][c_in][size][size]。Winograd 経路の数値的な基準実装を兼ねる。
#[allow(clippy::too_many_arguments)]
pub fn conv_direct<T: Element>(
    layout: Layout,
    n: usize,
    c_in: usize,
    c_out: usize,
    h: usize,
    w: usize,
    size: usize,
    input: &[T],
    filter: &[T],
    output: &mut [T],
) {
    assert!(size % 2 == 1, "filter size must be odd");
    let pad = (size / 2) as isize;
    let in_shape = Shape::new(c_in, h, w);
    let out_shape = Shape::new(c_out, h, w);
    debug_assert!(filter.len() >= c_out * c_in * size * size);

    for s in 0..n {
        let src = &input[s * in_shape.numel()..(s + 1) * in_shape.numel()];
        let dst = &mut output[s * out_shape.numel()..(s + 1) * out_shape.numel()];
        for k in 0..c_out {
            for y in 0..h {
                for x in 0..w {
                    let mut acc = 0.0f32;
                    for ci in 0..c_in {
                        let f = &filter[(k * c_in + ci) * size * size..];
                        for ky in 0..size {
                            let iy = y as isize + ky as isize - pad;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..size {
                                let ix = x as isize + kx as isize - pad;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let v = src[layout.offset(ci, iy as usize, ix as usize, in_shape)];
                                acc += v.to_f32() * f[ky * size + kx].to_f32();
                            }
                        }
                    }
                    dst[layout.offset(k, y, x, out_shape)] = T::from_f32(acc);
                }
            }
        }
    }
}

/// チャネル方向の数値安定な softmax
///
/// (n, h, w) ごとに最大値を引いてから指数を取る。
pub fn softmax<T: Element>(
    layout: Layout,
    n: usize,
    c: usize,
    hw: usize,
    input: &[T],
    output: &mut [T],
) {
    let per = c * hw;
    for s in 0..n {
        let src = &input[s * per..(s + 1) * per];
        let dst = &mut output[s * per..(s + 1) * per];
        for p in 0..hw {
            let mut max = f32::NEG_INFINITY;
            for ch in 0..c {
                max = max.max(src[layout.offset_hw(ch, p, c, hw)].to_f32());
            }
            let mut sum = 0.0f32;
            for ch in 0..c {
                sum += (src[layout.offset_hw(ch, p, c, hw)].to_f32() - max).exp();
            }
            for ch in 0..c {
                let idx = layout.offset_hw(ch, p, c, hw);
                dst[idx] = T::from_f32((src[idx].to_f32() - max).exp() / sum);
            }
        }
    }
}

/// ポリシーマップの gather
///
/// 出力をゼロクリアしてから、`table[i] >= 0` の入力位置 `i` を `table[i]` へ書き込む。
/// 入力位置は `table.len()` 未満しか読まない。
pub fn policy_map<T: Element>(
    n: usize,
    input: &[T],
    input_stride: usize,
    table: &[i16],
    output: &mut [T],
    output_stride: usize,
) {
    count_launch(KernelKind::PolicyMap);
    debug_assert!(table.len() <= input_stride);
    for s in 0..n {
        let src = &input[s * input_stride..s * input_stride + table.len()];
        let dst = &mut output[s * output_stride..(s + 1) * output_stride];
        dst.fill(T::zero());
        for (&idx, &v) in table.iter().zip(src) {
            if idx >= 0 {
                dst[idx as usize] = v;
            }
        }
    }
}
