//! テンソル形状とメモリレイアウト
//!
//! テンソルは常に呼び出し側が所有し、層には 1 回の `eval` の間だけスライスで渡される。
//!
//! ```text
//! NCHW: offset = ((n * C + c) * H + h) * W + w    チャネルが遅く変化
//! NHWC: offset = ((n * H + h) * W + w) * C + c    チャネルが最も速く変化
//! ```

use serde::{Deserialize, Serialize};

/// 物理レイアウト
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// channel-major
    #[default]
    Nchw,
    /// channel-minor
    Nhwc,
}

impl Layout {
    /// 1 サンプル内のオフセット
    #[inline(always)]
    pub fn offset(self, c: usize, y: usize, x: usize, shape: Shape) -> usize {
        match self {
            Self::Nchw => (c * shape.h + y) * shape.w + x,
            Self::Nhwc => (y * shape.w + x) * shape.c + c,
        }
    }

    /// 平面位置 `hw`（= y * W + x）とチャネルからのオフセット
    #[inline(always)]
    pub fn offset_hw(self, c: usize, hw: usize, channels: usize, plane: usize) -> usize {
        match self {
            Self::Nchw => c * plane + hw,
            Self::Nhwc => hw * channels + c,
        }
    }
}

/// 1 サンプルあたりの出力形状 `(C, H, W)`（N は呼び出しごとに与えられる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Shape {
    pub const fn new(c: usize, h: usize, w: usize) -> Self {
        Self { c, h, w }
    }

    /// 平面の要素数 H*W
    #[inline]
    pub const fn plane(&self) -> usize {
        self.h * self.w
    }

    /// 1 サンプルの要素数 C*H*W
    #[inline]
    pub const fn numel(&self) -> usize {
        self.c * self.h * self.w
    }

    /// `n` サンプル分のバイト数
    #[inline]
    pub const fn bytes(&self, n: usize, elem_size: usize) -> usize {
        n * self.numel() * elem_size
    }
}

/// CHW 順で並んだ `[rows][c*h*w]` 行列の列を HWC 順へ並べ替える
///
/// FC 層の重み（列 = 入力の平坦化位置）を NHWC 入力用に変換するときに使う。
pub fn permute_columns_chw_to_hwc(src: &[f32], rows: usize, shape: Shape) -> Vec<f32> {
    let cols = shape.numel();
    debug_assert_eq!(src.len(), rows * cols);
    let mut dst = vec![0.0f32; src.len()];
    for r in 0..rows {
        let row_src = &src[r * cols..(r + 1) * cols];
        let row_dst = &mut dst[r * cols..(r + 1) * cols];
        for c in 0..shape.c {
            for hw in 0..shape.plane() {
                row_dst[hw * shape.c + c] = row_src[c * shape.plane() + hw];
            }
        }
    }
    dst
}

/// NCHW テンソルを NHWC へ変換する
pub fn nchw_to_nhwc<T: Copy + Default>(src: &[T], n: usize, shape: Shape) -> Vec<T> {
    convert_layout(src, n, shape, Layout::Nchw, Layout::Nhwc)
}

/// NHWC テンソルを NCHW へ変換する
pub fn nhwc_to_nchw<T: Copy + Default>(src: &[T], n: usize, shape: Shape) -> Vec<T> {
    convert_layout(src, n, shape, Layout::Nhwc, Layout::Nchw)
}

fn convert_layout<T: Copy + Default>(
    src: &[T],
    n: usize,
    shape: Shape,
    from: Layout,
    to: Layout,
) -> Vec<T> {
    let per = shape.numel();
    assert!(src.len() >= n * per, "tensor shorter than n*C*H*W");
    let mut dst = vec![T::default(); n * per];
    for s in 0..n {
        let base = s * per;
        for c in 0..shape.c {
            for y in 0..shape.h {
                for x in 0..shape.w {
                    dst[base + to.offset(c, y, x, shape)] = src[base + from.offset(c, y, x, shape)];
                }
            }
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        let shape = Shape::new(3, 2, 4);
        assert_eq!(Layout::Nchw.offset(1, 1, 2, shape), 8 + 4 + 2);
        assert_eq!(Layout::Nhwc.offset(1, 1, 2, shape), (4 + 2) * 3 + 1);
        assert_eq!(Layout::Nchw.offset_hw(2, 5, 3, 8), 21);
        assert_eq!(Layout::Nhwc.offset_hw(2, 5, 3, 8), 17);
    }

    #[test]
    fn test_layout_conversion_roundtrip() {
        let shape = Shape::new(3, 2, 2);
        let src: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let nhwc = nchw_to_nhwc(&src, 2, shape);
        // サンプル 0 の (y=0, x=0) の全チャネル
        assert_eq!(&nhwc[0..3], &[0.0, 4.0, 8.0]);
        assert_eq!(nhwc_to_nchw(&nhwc, 2, shape), src);
    }

    #[test]
    fn test_permute_columns() {
        // 2 チャネル × 2 位置、1 行
        let shape = Shape::new(2, 1, 2);
        let w = [10.0, 11.0, 20.0, 21.0]; // c0:(hw0, hw1), c1:(hw0, hw1)
        let p = permute_columns_chw_to_hwc(&w, 1, shape);
        assert_eq!(p, vec![10.0, 20.0, 11.0, 21.0]);
    }

    #[test]
    fn test_shape_bytes() {
        let s = Shape::new(256, 8, 8);
        assert_eq!(s.numel(), 16384);
        assert_eq!(s.bytes(3, 4), 3 * 16384 * 4);
    }
}
