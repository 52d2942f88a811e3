//! 推論グラフの層
//!
//! 層の種類は閉じた集合なので、仮想ディスパッチではなく列挙型 [`Layer`] の
//! `match` 1 箇所で振り分ける。
//!
//! # ライフサイクル
//!
//! ```text
//! new（パラメータバッファ確保） → load_*（1 回だけ） → eval（何度でも） → Drop（全バッファ返却）
//! ```
//!
//! # eval の規約
//!
//! - `output` / `input` / `input2` は呼び出し側所有のテンソル（`n` サンプル分以上）
//! - `input2` はスキップ加算を融合する層だけが使う
//! - ワークスペースは申告量以上なら何でもよい。不足は panic（前提条件違反）
//!
//! グラフの辺は構築時パラメータ（入力チャネル数・空間サイズ）だけで表し、
//! 前段の層への参照は持たない。

mod conv;
mod conv1;
mod fc;
mod fused_winograd;
mod policy_map;
mod residual;
mod se;
mod softmax;

pub use conv::ConvLayer;
pub use conv1::Conv1Layer;
pub use fc::FcLayer;
pub use fused_winograd::FusedWinogradConvLayer;
pub use policy_map::PolicyMapLayer;
pub use residual::ResidualBlock;
pub use se::SeLayer;
pub use softmax::SoftMaxLayer;

use crate::device::{Element, MathHandles};
use crate::tensor::{Layout, Shape};
use crate::workspace::{ScratchRequirement, Workspace};

/// 推論グラフの層（閉じた列挙）
#[derive(Debug)]
pub enum Layer<T: Element> {
    Conv(ConvLayer<T>),
    FullyConnected(FcLayer<T>),
    SoftMax(SoftMaxLayer),
    PolicyMap(PolicyMapLayer),
    SqueezeExcite(SeLayer<T>),
    FusedWinogradConv(FusedWinogradConvLayer<T>),
    Conv1(Conv1Layer<T>),
    ResidualBlock(ResidualBlock<T>),
}

impl<T: Element> Layer<T> {
    /// 層の種類名（ログ用）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conv(_) => "Conv",
            Self::FullyConnected(_) => "FC",
            Self::SoftMax(_) => "SoftMax",
            Self::PolicyMap(_) => "PolicyMap",
            Self::SqueezeExcite(_) => "SE",
            Self::FusedWinogradConv(_) => "FusedWinogradConv",
            Self::Conv1(_) => "Conv1",
            Self::ResidualBlock(_) => "ResidualBlock",
        }
    }

    /// 1 サンプルあたりの出力形状
    pub fn shape(&self) -> Shape {
        match self {
            Self::Conv(l) => l.shape(),
            Self::FullyConnected(l) => l.shape(),
            Self::SoftMax(l) => l.shape(),
            Self::PolicyMap(l) => l.shape(),
            Self::SqueezeExcite(l) => l.shape(),
            Self::FusedWinogradConv(l) => l.shape(),
            Self::Conv1(l) => l.shape(),
            Self::ResidualBlock(l) => l.shape(),
        }
    }

    /// テンソルレイアウト
    pub fn layout(&self) -> Layout {
        match self {
            Self::Conv(l) => l.layout(),
            Self::FullyConnected(l) => l.layout(),
            Self::SoftMax(l) => l.layout(),
            Self::PolicyMap(l) => l.layout(),
            Self::SqueezeExcite(l) => l.layout(),
            Self::FusedWinogradConv(l) => l.layout(),
            Self::Conv1(l) => l.layout(),
            Self::ResidualBlock(l) => l.layout(),
        }
    }

    /// `n` サンプル分の出力バイト数（`n * C * H * W * size_of::<T>()`）
    #[inline]
    pub fn output_size(&self, n: usize) -> usize {
        self.shape().bytes(n, size_of::<T>())
    }

    /// `max_batch` で必要なワークスペース量
    pub fn scratch_requirement(&self, max_batch: usize) -> ScratchRequirement {
        match self {
            Self::Conv(l) => l.scratch_requirement(),
            Self::FullyConnected(l) => l.scratch_requirement(),
            Self::SoftMax(_) | Self::PolicyMap(_) => ScratchRequirement::NONE,
            Self::SqueezeExcite(l) => l.scratch_requirement(),
            Self::FusedWinogradConv(l) => l.scratch_requirement(max_batch),
            Self::Conv1(l) => l.scratch_requirement(),
            Self::ResidualBlock(l) => l.scratch_requirement(max_batch),
        }
    }

    /// 層が所有するデバイスメモリのバイト数
    pub fn weights_bytes(&self) -> usize {
        match self {
            Self::Conv(l) => l.weights_bytes(),
            Self::FullyConnected(l) => l.weights_bytes(),
            Self::SoftMax(_) => 0,
            Self::PolicyMap(l) => l.weights_bytes(),
            Self::SqueezeExcite(l) => l.weights_bytes(),
            Self::FusedWinogradConv(l) => l.weights_bytes(),
            Self::Conv1(l) => l.weights_bytes(),
            Self::ResidualBlock(l) => l.weights_bytes(),
        }
    }

    /// `n` サンプルを順伝播
    pub fn eval(
        &self,
        n: usize,
        output: &mut [T],
        input: &[T],
        input2: Option<&[T]>,
        ws: &mut Workspace<T>,
        handles: &MathHandles,
    ) {
        match self {
            Self::Conv(l) => l.eval(n, output, input, ws, handles),
            Self::FullyConnected(l) => l.eval(n, output, input, handles),
            Self::SoftMax(l) => l.eval::<T>(n, output, input, handles),
            Self::PolicyMap(l) => l.eval::<T>(n, output, input),
            Self::SqueezeExcite(l) => l.eval(n, output, input, input2),
            Self::FusedWinogradConv(l) => l.eval(n, output, input, input2, ws, handles),
            Self::Conv1(l) => l.eval(n, output, input, handles),
            Self::ResidualBlock(l) => l.eval(n, output, input, input2, ws, handles),
        }
    }
}

/// ホストの f32 配列をスクラッチ先頭へ要素型でステージングする
///
/// 返り値はステージング済み領域。
#[track_caller]
pub(crate) fn stage<'a, T: Element>(scratch: &'a mut [T], host: &[f32]) -> &'a mut [T] {
    crate::workspace::require_scratch(scratch.len(), host.len());
    let dst = &mut scratch[..host.len()];
    for (d, &s) in dst.iter_mut().zip(host) {
        *d = T::from_f32(s);
    }
    dst
}

#[cfg(test)]
mod tests;
