//! Squeeze-Excitation カーネル
//!
//! ```text
//! pooled[c] = mean_hw(x[c] (+ prev_bias[c]))
//! hidden    = ReLU(W1 · pooled + b1)          W1: [K][C]
//! gates     = W2 · hidden + b2                W2: [2C][K] → scale = gates[..C], shift = gates[C..]
//! out       = act(sigmoid(scale) * (x (+ prev_bias)) + shift (+ skip))
//! ```

use super::{Activation, sigmoid};
use crate::device::Element;
use crate::stats::{KernelKind, count_launch};
use crate::tensor::Layout;
use smallvec::SmallVec;

/// サンプルごとのゲートベクトル
pub type Gates = SmallVec<[f32; 512]>;

/// SE の重み（借用ビュー）
#[derive(Debug, Clone, Copy)]
pub struct SeWeights<'a, T: Element> {
    /// チャネル数 C
    pub channels: usize,
    /// FC1 の出力数 K
    pub fc1_out: usize,
    /// [K][C]
    pub w1: &'a [T],
    /// [K]
    pub b1: &'a [T],
    /// [2C][K]
    pub w2: &'a [T],
    /// [2C]
    pub b2: &'a [T],
}

/// 1 サンプル分のゲート（scale は sigmoid 適用済み）を計算する
pub fn compute_gates<T: Element>(
    se: &SeWeights<'_, T>,
    layout: Layout,
    hw: usize,
    sample: &[T],
    prev_bias: Option<&[T]>,
) -> (Gates, Gates) {
    let c = se.channels;
    let k = se.fc1_out;
    debug_assert!(se.w1.len() >= k * c && se.w2.len() >= 2 * c * k);

    let mut pooled: Gates = SmallVec::with_capacity(c);
    for ch in 0..c {
        let pb = prev_bias.map_or(0.0, |b| b[ch].to_f32());
        let mut sum = 0.0f32;
        for p in 0..hw {
            sum += sample[layout.offset_hw(ch, p, c, hw)].to_f32() + pb;
        }
        pooled.push(sum / hw as f32);
    }

    let mut hidden: Gates = SmallVec::with_capacity(k);
    for j in 0..k {
        let row = &se.w1[j * c..(j + 1) * c];
        let mut acc = se.b1[j].to_f32();
        for (w, &p) in row.iter().zip(&pooled) {
            acc += w.to_f32() * p;
        }
        hidden.push(acc.max(0.0));
    }

    let mut scale: Gates = SmallVec::with_capacity(c);
    let mut shift: Gates = SmallVec::with_capacity(c);
    for i in 0..2 * c {
        let row = &se.w2[i * k..(i + 1) * k];
        let mut acc = se.b2[i].to_f32();
        for (w, &h) in row.iter().zip(&hidden) {
            acc += w.to_f32() * h;
        }
        if i < c {
            scale.push(sigmoid(acc));
        } else {
            shift.push(acc);
        }
    }
    (scale, shift)
}

/// 1 サンプル分にゲートを掛ける
///
/// `src` が `None` なら `dst` をその場で読み替える。
#[allow(clippy::too_many_arguments)]
pub fn apply_gates<T: Element>(
    layout: Layout,
    c: usize,
    hw: usize,
    src: Option<&[T]>,
    dst: &mut [T],
    prev_bias: Option<&[T]>,
    skip: Option<&[T]>,
    activation: Activation,
    scale: &[f32],
    shift: &[f32],
) {
    for ch in 0..c {
        let pb = prev_bias.map_or(0.0, |b| b[ch].to_f32());
        for p in 0..hw {
            let idx = layout.offset_hw(ch, p, c, hw);
            let x = match src {
                Some(s) => s[idx].to_f32(),
                None => dst[idx].to_f32(),
            };
            let mut v = scale[ch] * (x + pb) + shift[ch];
            if let Some(sk) = skip {
                v += sk[idx].to_f32();
            }
            dst[idx] = T::from_f32(activation.apply(v));
        }
    }
}

/// 単独 SE 層の順伝播（`n` サンプル）
#[allow(clippy::too_many_arguments)]
pub fn se_forward<T: Element>(
    se: &SeWeights<'_, T>,
    layout: Layout,
    n: usize,
    hw: usize,
    input: &[T],
    output: &mut [T],
    skip: Option<&[T]>,
    prev_bias: Option<&[T]>,
    activation: Activation,
) {
    count_launch(KernelKind::SqueezeExcite);
    let per = se.channels * hw;
    for s in 0..n {
        let src = &input[s * per..(s + 1) * per];
        let (scale, shift) = compute_gates(se, layout, hw, src, prev_bias);
        apply_gates(
            layout,
            se.channels,
            hw,
            Some(src),
            &mut output[s * per..(s + 1) * per],
            prev_bias,
            skip.map(|sk| &sk[s * per..(s + 1) * per]),
            activation,
            &scale,
            &shift,
        );
    }
}
