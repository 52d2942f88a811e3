//! Winograd F(4x4, 3x3) 変換カーネル
//!
//! 6x6 タイルを 4x4 刻みで平面に敷き詰め、平面外は 0 として読む。
//!
//! ```text
//! フィルタ変換: U = G g Gᵀ         g: 3x3 → U: 6x6（ロード時に 1 回だけ）
//! 入力変換:     V = Bᵀ d B         d: 6x6 → V: 6x6
//! 積:           M[e] = V[e] · U[e]  e = 0..36 の 36 バッチ GEMM（チャネル方向の内積）
//! 出力変換:     Y = Aᵀ M A         M: 6x6 → Y: 4x4（ここでエピローグを融合）
//! ```
//!
//! # 変換済みテンソルのレイアウト
//!
//! ```text
//! 入力: [36][tiles][c_in_pad]   tiles = N * tiles_h * tiles_w
//! 出力: [36][tiles][c_out]
//! 重み: [36][c_out][c_in]       channel-major（f32）
//!       [36][c_in_pad][c_out]   channel-minor（f16、c_in_pad はベクトル幅の倍数）
//! ```

use super::Activation;
use super::se::{self, SeWeights};
use crate::device::Element;
use crate::stats::{KernelKind, count_launch};
use crate::tensor::{Layout, Shape};

/// 変換タイルの一辺
pub const TILE: usize = 6;

/// 変換領域の要素数（= GEMM のバッチ数）
pub const TILE_ELEMS: usize = TILE * TILE;

/// 出力タイルの一辺
pub const OUT_TILE: usize = 4;

const G: [[f32; 3]; 6] = [
    [1.0 / 4.0, 0.0, 0.0],
    [-1.0 / 6.0, -1.0 / 6.0, -1.0 / 6.0],
    [-1.0 / 6.0, 1.0 / 6.0, -1.0 / 6.0],
    [1.0 / 24.0, 1.0 / 12.0, 1.0 / 6.0],
    [1.0 / 24.0, -1.0 / 12.0, 1.0 / 6.0],
    [0.0, 0.0, 1.0],
];

const BT: [[f32; 6]; 6] = [
    [4.0, 0.0, -5.0, 0.0, 1.0, 0.0],
    [0.0, -4.0, -4.0, 1.0, 1.0, 0.0],
    [0.0, 4.0, -4.0, -1.0, 1.0, 0.0],
    [0.0, -2.0, -1.0, 2.0, 1.0, 0.0],
    [0.0, 2.0, -1.0, -2.0, 1.0, 0.0],
    [0.0, 4.0, 0.0, -5.0, 0.0, 1.0],
];

const AT: [[f32; 6]; 4] = [
    [1.0, 1.0, 1.0, 1.0, 1.0, 0.0],
    [0.0, 1.0, -1.0, 2.0, -2.0, 0.0],
    [0.0, 1.0, 1.0, 4.0, 4.0, 0.0],
    [0.0, 1.0, -1.0, 8.0, -8.0, 1.0],
];

/// 変換済み重みの並び
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightOrder {
    /// [36][c_out][c_in]
    ChannelMajor,
    /// [36][c_in_pad][c_out]
    ChannelMinor,
}

impl WeightOrder {
    /// 要素型に応じた並び（ベクトル幅 > 1 なら channel-minor）
    #[inline]
    pub fn for_element<T: Element>() -> Self {
        if T::LANES > 1 { Self::ChannelMinor } else { Self::ChannelMajor }
    }
}

/// Winograd 畳み込み 1 回分の幾何情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinogradGeom {
    pub c_in: usize,
    pub c_in_pad: usize,
    pub c_out: usize,
    pub h: usize,
    pub w: usize,
    pub tiles_h: usize,
    pub tiles_w: usize,
}

impl WinogradGeom {
    pub fn new(c_in: usize, c_in_pad: usize, c_out: usize, h: usize, w: usize) -> Self {
        debug_assert!(c_in_pad >= c_in);
        Self {
            c_in,
            c_in_pad,
            c_out,
            h,
            w,
            tiles_h: h.div_ceil(OUT_TILE),
            tiles_w: w.div_ceil(OUT_TILE),
        }
    }

    /// 1 サンプルあたりのタイル数
    #[inline]
    pub fn tiles_per_sample(&self) -> usize {
        self.tiles_h * self.tiles_w
    }

    /// 変換済み入力の要素数
    #[inline]
    pub fn transformed_input_len(&self, n: usize) -> usize {
        TILE_ELEMS * n * self.tiles_per_sample() * self.c_in_pad
    }

    /// 変換済み出力の要素数
    #[inline]
    pub fn transformed_output_len(&self, n: usize) -> usize {
        TILE_ELEMS * n * self.tiles_per_sample() * self.c_out
    }

    /// 変換済み重みの要素数
    #[inline]
    pub fn transformed_weights_len(&self) -> usize {
        TILE_ELEMS * self.c_in_pad * self.c_out
    }

    #[inline]
    fn in_shape(&self) -> Shape {
        Shape::new(self.c_in, self.h, self.w)
    }

    #[inline]
    fn out_shape(&self) -> Shape {
        Shape::new(self.c_out, self.h, self.w)
    }
}

// =============================================================================
// フィルタ変換（ロード時）
// =============================================================================

/// フィルタ変換
///
/// `filter`: [c_out][c_in][3][3]（フィルタ優先） → `dst`: [36][c_out][c_in]
pub fn filter_transform<T: Element>(c_out: usize, c_in: usize, filter: &[T], dst: &mut [T]) {
    debug_assert!(filter.len() >= c_out * c_in * 9);
    debug_assert!(dst.len() >= TILE_ELEMS * c_out * c_in);

    for k in 0..c_out {
        for ci in 0..c_in {
            let g = &filter[(k * c_in + ci) * 9..(k * c_in + ci + 1) * 9];

            // tmp = G · g（6x3）
            let mut tmp = [[0.0f32; 3]; TILE];
            for (i, row) in tmp.iter_mut().enumerate() {
                for (j, v) in row.iter_mut().enumerate() {
                    *v = (0..3).map(|l| G[i][l] * g[l * 3 + j].to_f32()).sum();
                }
            }

            // U = tmp · Gᵀ（6x6）
            for i in 0..TILE {
                for j in 0..TILE {
                    let u: f32 = (0..3).map(|l| tmp[i][l] * G[j][l]).sum();
                    dst[(i * TILE + j) * c_out * c_in + k * c_in + ci] = T::from_f32(u);
                }
            }
        }
    }
}

/// channel-major の変換済み重みを channel-minor へ並べ替える（CHW → HWC）
///
/// `src`: [36][c_out][c_in] → `dst`: [36][c_in_pad][c_out]。パディングチャネルは 0。
pub fn to_channel_minor<T: Element>(
    c_out: usize,
    c_in: usize,
    c_in_pad: usize,
    src: &[T],
    dst: &mut [T],
) {
    debug_assert!(dst.len() >= TILE_ELEMS * c_in_pad * c_out);
    for e in 0..TILE_ELEMS {
        let s = &src[e * c_out * c_in..(e + 1) * c_out * c_in];
        let d = &mut dst[e * c_in_pad * c_out..(e + 1) * c_in_pad * c_out];
        d.fill(T::zero());
        for k in 0..c_out {
            for ci in 0..c_in {
                d[ci * c_out + k] = s[k * c_in + ci];
            }
        }
    }
}

// =============================================================================
// 入力変換
// =============================================================================

/// 1 サンプル分の入力変換
///
/// `sample`: 空間領域の 1 サンプル（c_in × h × w） → `dst` の `tile_base..` のタイル列
pub fn input_transform_sample<T: Element>(
    geom: &WinogradGeom,
    layout: Layout,
    sample: &[T],
    tile_base: usize,
    total_tiles: usize,
    dst: &mut [T],
) {
    let shape = geom.in_shape();
    let cp = geom.c_in_pad;

    for ty in 0..geom.tiles_h {
        for tx in 0..geom.tiles_w {
            let tile = tile_base + ty * geom.tiles_w + tx;
            for ci in 0..geom.c_in {
                // d: 平面外は 0
                let mut d = [[0.0f32; TILE]; TILE];
                for (i, row) in d.iter_mut().enumerate() {
                    let y = (ty * OUT_TILE + i) as isize - 1;
                    if y < 0 || y >= geom.h as isize {
                        continue;
                    }
                    for (j, v) in row.iter_mut().enumerate() {
                        let x = (tx * OUT_TILE + j) as isize - 1;
                        if x < 0 || x >= geom.w as isize {
                            continue;
                        }
                        *v = sample[layout.offset(ci, y as usize, x as usize, shape)].to_f32();
                    }
                }

                // tmp = Bᵀ · d
                let mut tmp = [[0.0f32; TILE]; TILE];
                for i in 0..TILE {
                    for j in 0..TILE {
                        tmp[i][j] = (0..TILE).map(|l| BT[i][l] * d[l][j]).sum();
                    }
                }

                // V = tmp · B
                for i in 0..TILE {
                    for j in 0..TILE {
                        let v: f32 = (0..TILE).map(|l| tmp[i][l] * BT[j][l]).sum();
                        dst[((i * TILE + j) * total_tiles + tile) * cp + ci] = T::from_f32(v);
                    }
                }
            }
            for ci in geom.c_in..cp {
                for e in 0..TILE_ELEMS {
                    dst[(e * total_tiles + tile) * cp + ci] = T::zero();
                }
            }
        }
    }
}

/// `n` サンプル分の入力変換
pub fn input_transform<T: Element>(
    geom: &WinogradGeom,
    layout: Layout,
    n: usize,
    input: &[T],
    dst: &mut [T],
) {
    count_launch(KernelKind::InputTransform);
    let per = geom.in_shape().numel();
    let tps = geom.tiles_per_sample();
    let total_tiles = n * tps;
    debug_assert!(dst.len() >= geom.transformed_input_len(n));
    for s in 0..n {
        input_transform_sample(geom, layout, &input[s * per..(s + 1) * per], s * tps, total_tiles, dst);
    }
}

// =============================================================================
// 出力変換（エピローグ融合）
// =============================================================================

/// 出力変換に融合する後処理
///
/// 適用順: `x = conv + bias` → SE ゲート → `x += skip` → 活性化
pub struct Epilogue<'a, T: Element> {
    pub bias: Option<&'a [T]>,
    /// 出力と同じ形状・レイアウトのスキップテンソル（n サンプル分）
    pub skip: Option<&'a [T]>,
    pub se: Option<SeWeights<'a, T>>,
    pub activation: Activation,
}

/// 出力変換の書き込み先
pub enum Destination<'a, T: Element> {
    /// n サンプル分の出力テンソル
    Tensor(&'a mut [T]),
    /// 1 サンプル分の作業領域（サンプルごとに上書きする）
    Staging(&'a mut [T]),
}

/// 次の畳み込みの入力変換を出力パスに融合するときの書き込み先
pub struct FusedInputTransform<'a, T: Element> {
    pub geom: WinogradGeom,
    pub dst: &'a mut [T],
}

/// 出力変換
///
/// サンプルごとに 4x4 タイルを空間領域へ戻し、エピローグを適用する。
/// SE がある場合はサンプル全体の書き込み後にゲートを掛ける（プーリングが平面全体を要するため）。
/// `next` が与えられたら、完成したサンプルをそのまま次の畳み込みの変換領域へ送る。
#[allow(clippy::too_many_arguments)]
pub fn output_transform<T: Element>(
    geom: &WinogradGeom,
    layout: Layout,
    n: usize,
    src: &[T],
    mut dst: Destination<'_, T>,
    epilogue: &Epilogue<'_, T>,
    mut next: Option<FusedInputTransform<'_, T>>,
) {
    count_launch(KernelKind::OutputTransform);
    let shape = geom.out_shape();
    let per = shape.numel();
    let tps = geom.tiles_per_sample();
    let total_tiles = n * tps;
    debug_assert!(src.len() >= geom.transformed_output_len(n));

    // SE がある場合、変換パスでは bias のみ適用し、skip と活性化はゲート後に回す
    let (pass_skip, pass_act) = if epilogue.se.is_some() {
        (false, Activation::None)
    } else {
        (epilogue.skip.is_some(), epilogue.activation)
    };

    for s in 0..n {
        let sample: &mut [T] = match &mut dst {
            Destination::Tensor(t) => &mut t[s * per..(s + 1) * per],
            Destination::Staging(b) => &mut b[..per],
        };
        let skip = epilogue.skip.map(|sk| &sk[s * per..(s + 1) * per]);

        for ty in 0..geom.tiles_h {
            for tx in 0..geom.tiles_w {
                let tile = s * tps + ty * geom.tiles_w + tx;
                for k in 0..geom.c_out {
                    let mut m = [[0.0f32; TILE]; TILE];
                    for (i, row) in m.iter_mut().enumerate() {
                        for (j, v) in row.iter_mut().enumerate() {
                            *v = src[((i * TILE + j) * total_tiles + tile) * geom.c_out + k].to_f32();
                        }
                    }

                    // tmp = Aᵀ · m（4x6）
                    let mut tmp = [[0.0f32; TILE]; OUT_TILE];
                    for i in 0..OUT_TILE {
                        for j in 0..TILE {
                            tmp[i][j] = (0..TILE).map(|l| AT[i][l] * m[l][j]).sum();
                        }
                    }

                    let b = epilogue.bias.map_or(0.0, |b| b[k].to_f32());
                    for i in 0..OUT_TILE {
                        let y = ty * OUT_TILE + i;
                        if y >= geom.h {
                            break;
                        }
                        for j in 0..OUT_TILE {
                            let x = tx * OUT_TILE + j;
                            if x >= geom.w {
                                break;
                            }
                            // Y = tmp · A
                            let mut v: f32 = (0..TILE).map(|l| tmp[i][l] * AT[j][l]).sum();
                            v += b;
                            let idx = layout.offset(k, y, x, shape);
                            if pass_skip {
                                if let Some(sk) = skip {
                                    v += sk[idx].to_f32();
                                }
                            }
                            sample[idx] = T::from_f32(pass_act.apply(v));
                        }
                    }
                }
            }
        }

        if let Some(se_w) = &epilogue.se {
            count_launch(KernelKind::SqueezeExcite);
            let (scale, shift) = se::compute_gates(se_w, layout, shape.plane(), sample, None);
            se::apply_gates(
                layout,
                shape.c,
                shape.plane(),
                None,
                sample,
                None,
                skip,
                epilogue.activation,
                &scale,
                &shift,
            );
        }

        if let Some(fused) = next.as_mut() {
            debug_assert_eq!(fused.geom.c_in, geom.c_out);
            let fused_geom = fused.geom;
            input_transform_sample(&fused_geom, layout, sample, s * tps, total_tiles, &mut *fused.dst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::conv_direct;

    fn pattern(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (((i * 31 + seed * 17) % 23) as f32 - 11.0) / 8.0)
            .collect()
    }

    /// 変換 → 要素積 → 逆変換が 3x3 相関と一致する（1 チャネル、1 タイル）
    #[test]
    fn test_single_tile_matches_direct() {
        let geom = WinogradGeom::new(1, 1, 1, 4, 4);
        let input = pattern(16, 1);
        let filter = pattern(9, 2);

        let mut u = vec![0.0f32; TILE_ELEMS];
        filter_transform(1, 1, &filter, &mut u);
        let mut v = vec![0.0f32; geom.transformed_input_len(1)];
        input_transform(&geom, Layout::Nchw, 1, &input, &mut v);
        let m: Vec<f32> = v.iter().zip(&u).map(|(a, b)| a * b).collect();

        let mut out = vec![0.0f32; 16];
        let epi = Epilogue {
            bias: None,
            skip: None,
            se: None,
            activation: Activation::None,
        };
        output_transform(&geom, Layout::Nchw, 1, &m, Destination::Tensor(&mut out), &epi, None);

        let mut reference = vec![0.0f32; 16];
        conv_direct(Layout::Nchw, 1, 1, 1, 4, 4, 3, &input, &filter, &mut reference);
        for (a, b) in out.iter().zip(&reference) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_geometry_non_multiple_of_four() {
        let geom = WinogradGeom::new(3, 8, 5, 9, 6);
        assert_eq!(geom.tiles_h, 3);
        assert_eq!(geom.tiles_w, 2);
        assert_eq!(geom.tiles_per_sample(), 6);
        assert_eq!(geom.transformed_input_len(2), 36 * 12 * 8);
        assert_eq!(geom.transformed_output_len(2), 36 * 12 * 5);
        assert_eq!(geom.transformed_weights_len(), 36 * 8 * 5);
    }

    #[test]
    fn test_to_channel_minor_pads_with_zero() {
        let (c_out, c_in, c_in_pad) = (2, 3, 8);
        let src: Vec<f32> = (0..TILE_ELEMS * c_out * c_in).map(|v| v as f32 + 1.0).collect();
        let mut dst = vec![-1.0f32; TILE_ELEMS * c_in_pad * c_out];
        to_channel_minor(c_out, c_in, c_in_pad, &src, &mut dst);
        // e=0, k=1, ci=2 → src[1*3+2]=6
        assert_eq!(dst[2 * c_out + 1], 6.0);
        // パディングチャネル
        for ci in c_in..c_in_pad {
            assert_eq!(dst[ci * c_out], 0.0);
            assert_eq!(dst[ci * c_out + 1], 0.0);
        }
    }

    #[test]
    fn test_input_transform_zero_pads_channels() {
        let geom = WinogradGeom::new(2, 8, 2, 4, 4);
        let input = vec![1.0f32; 2 * 16];
        let mut dst = vec![9.0f32; geom.transformed_input_len(1)];
        input_transform(&geom, Layout::Nchw, 1, &input, &mut dst);
        for e in 0..TILE_ELEMS {
            for ci in 2..8 {
                assert_eq!(dst[e * 8 + ci], 0.0);
            }
        }
    }

    #[test]
    fn test_weight_order_by_precision() {
        assert_eq!(WeightOrder::for_element::<f32>(), WeightOrder::ChannelMajor);
        assert_eq!(WeightOrder::for_element::<half::f16>(), WeightOrder::ChannelMinor);
    }
}
