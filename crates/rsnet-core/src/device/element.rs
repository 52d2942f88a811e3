//! テンソル要素型
//!
//! 計算は常に f32 で行い、格納時のみ要素型へ丸める。

use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// 数値精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32bit 浮動小数点
    Fp32,
    /// 16bit 浮動小数点
    Fp16,
}

/// デバイスバッファに置ける値（ゼロ初期化可能な POD）
pub trait DeviceRepr: Copy + Default + Debug + Send + Sync + 'static {}

impl DeviceRepr for f32 {}
impl DeviceRepr for f16 {}
impl DeviceRepr for i16 {}

/// テンソル要素型
pub trait Element: DeviceRepr + PartialEq {
    /// 対応する精度
    const PRECISION: Precision;

    /// ベクトル化アクセスの幅（チャネル方向のパディング単位）
    const LANES: usize;

    fn from_f32(v: f32) -> Self;

    fn to_f32(self) -> f32;

    #[inline]
    fn zero() -> Self {
        Self::default()
    }
}

impl Element for f32 {
    const PRECISION: Precision = Precision::Fp32;
    const LANES: usize = 1;

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f16 {
    const PRECISION: Precision = Precision::Fp16;
    const LANES: usize = 8;

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

/// `n` を `lanes` の倍数に切り上げる
#[inline]
pub const fn round_up(n: usize, lanes: usize) -> usize {
    n.div_ceil(lanes) * lanes
}
