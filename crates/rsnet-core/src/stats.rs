//! カーネル起動統計（デバッグ・チューニング用）
//!
//! 融合によって起動回数がどれだけ減っているかの確認に使用。
//! `kernel-stats` feature 有効時のみカウントを行う。
//!
//! # 使用方法
//!
//! ```bash
//! cargo test -p rsnet-core --features kernel-stats
//! ```

#[cfg(feature = "kernel-stats")]
use std::sync::atomic::{AtomicU64, Ordering};

/// カーネルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    /// バッチ行列積
    Gemm,
    /// 直接畳み込み
    Convolution,
    /// Winograd 入力変換
    InputTransform,
    /// Winograd 出力変換（エピローグ融合を含む）
    OutputTransform,
    /// SE ゲーティング
    SqueezeExcite,
    /// バイアス・活性化などの要素ごとの処理
    Elementwise,
    /// ポリシーマップの gather
    PolicyMap,
    /// softmax
    Softmax,
}

/// カーネル起動カウンタ
#[cfg(feature = "kernel-stats")]
pub struct KernelStats {
    pub gemm: AtomicU64,
    pub convolution: AtomicU64,
    pub input_transform: AtomicU64,
    pub output_transform: AtomicU64,
    pub squeeze_excite: AtomicU64,
    pub elementwise: AtomicU64,
    pub policy_map: AtomicU64,
    pub softmax: AtomicU64,
}

#[cfg(feature = "kernel-stats")]
impl KernelStats {
    /// 新規作成
    pub const fn new() -> Self {
        Self {
            gemm: AtomicU64::new(0),
            convolution: AtomicU64::new(0),
            input_transform: AtomicU64::new(0),
            output_transform: AtomicU64::new(0),
            squeeze_excite: AtomicU64::new(0),
            elementwise: AtomicU64::new(0),
            policy_map: AtomicU64::new(0),
            softmax: AtomicU64::new(0),
        }
    }

    fn counter(&self, kind: KernelKind) -> &AtomicU64 {
        match kind {
            KernelKind::Gemm => &self.gemm,
            KernelKind::Convolution => &self.convolution,
            KernelKind::InputTransform => &self.input_transform,
            KernelKind::OutputTransform => &self.output_transform,
            KernelKind::SqueezeExcite => &self.squeeze_excite,
            KernelKind::Elementwise => &self.elementwise,
            KernelKind::PolicyMap => &self.policy_map,
            KernelKind::Softmax => &self.softmax,
        }
    }

    /// 起動回数を取得
    pub fn get(&self, kind: KernelKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    /// 全種類の合計
    pub fn total(&self) -> u64 {
        [
            KernelKind::Gemm,
            KernelKind::Convolution,
            KernelKind::InputTransform,
            KernelKind::OutputTransform,
            KernelKind::SqueezeExcite,
            KernelKind::Elementwise,
            KernelKind::PolicyMap,
            KernelKind::Softmax,
        ]
        .into_iter()
        .map(|k| self.get(k))
        .sum()
    }

    /// カウンタをリセット
    pub fn reset(&self) {
        for counter in [
            &self.gemm,
            &self.convolution,
            &self.input_transform,
            &self.output_transform,
            &self.squeeze_excite,
            &self.elementwise,
            &self.policy_map,
            &self.softmax,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// 統計をログ出力
    pub fn log_summary(&self) {
        log::info!(
            "[KernelStats] gemm={} conv={} in_tf={} out_tf={} se={} elem={} policy={} softmax={} total={}",
            self.get(KernelKind::Gemm),
            self.get(KernelKind::Convolution),
            self.get(KernelKind::InputTransform),
            self.get(KernelKind::OutputTransform),
            self.get(KernelKind::SqueezeExcite),
            self.get(KernelKind::Elementwise),
            self.get(KernelKind::PolicyMap),
            self.get(KernelKind::Softmax),
            self.total()
        );
    }
}

#[cfg(feature = "kernel-stats")]
impl Default for KernelStats {
    fn default() -> Self {
        Self::new()
    }
}

/// グローバル統計インスタンス
#[cfg(feature = "kernel-stats")]
pub static KERNEL_STATS: KernelStats = KernelStats::new();

/// カーネル起動をカウント
#[cfg(feature = "kernel-stats")]
#[inline]
pub fn count_launch(kind: KernelKind) {
    KERNEL_STATS.counter(kind).fetch_add(1, Ordering::Relaxed);
}

/// カーネル起動をカウント（無効時は何もしない）
#[cfg(not(feature = "kernel-stats"))]
#[inline(always)]
pub fn count_launch(_kind: KernelKind) {}
