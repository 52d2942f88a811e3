//! ネットワーク構成
//!
//! TOML から読み込む。省略したキーは [`NetworkConfig::default`] の値になる。
//!
//! ```toml
//! filters = 128
//! blocks = 10
//! se = true
//! se_channels = 32
//! policy_head = "convolution"
//! value_head = "wdl"
//! layout = "nhwc"
//! precision = "fp16"
//! max_batch = 256
//! ```

use crate::device::Precision;
use crate::error::{Error, Result};
use crate::tensor::{Layout, Shape};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// ポリシーヘッドの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyHead {
    /// 3x3 畳み込み 2 段 + ポリシーマップ
    Convolution,
    /// 1x1 畳み込み + 全結合
    Classical,
}

/// バリューヘッドの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueHead {
    /// tanh のスカラー 1 出力
    Scalar,
    /// 勝ち・引き分け・負けの 3 出力（softmax）
    Wdl,
}

impl ValueHead {
    /// 出力数
    #[inline]
    pub fn outputs(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Wdl => 3,
        }
    }
}

/// ネットワーク構成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// 入力プレーン数
    pub input_channels: usize,
    /// 盤面の一辺
    pub board_size: usize,
    /// 残差タワーのチャネル数
    pub filters: usize,
    /// 残差ブロック数
    pub blocks: usize,
    /// 残差ブロックに SE を付けるか
    pub se: bool,
    /// SE の FC1 出力数
    pub se_channels: usize,

    pub policy_head: PolicyHead,
    /// 畳み込みポリシーヘッドの 2 段目のチャネル数（パディング込み）
    pub policy_conv_channels: usize,
    /// そのうち有効なチャネル数
    pub policy_used_channels: usize,
    /// 従来型ポリシーヘッドの 1x1 畳み込みチャネル数
    pub policy_channels: usize,
    /// ポリシー出力数
    pub policy_size: usize,

    pub value_head: ValueHead,
    /// バリューヘッドの 1x1 畳み込みチャネル数
    pub value_channels: usize,
    /// バリューヘッドの隠れ層の幅
    pub value_fc: usize,

    pub layout: Layout,
    pub precision: Precision,
    /// 拡張 GEMM 経路を使うか
    pub use_gemm_ex: bool,
    /// 1 回の評価の最大バッチ
    pub max_batch: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_channels: 112,
            board_size: 8,
            filters: 128,
            blocks: 10,
            se: true,
            se_channels: 32,
            policy_head: PolicyHead::Convolution,
            policy_conv_channels: 80,
            policy_used_channels: 73,
            policy_channels: 32,
            policy_size: 1858,
            value_head: ValueHead::Wdl,
            value_channels: 32,
            value_fc: 128,
            layout: Layout::Nchw,
            precision: Precision::Fp32,
            use_gemm_ex: false,
            max_batch: 256,
        }
    }
}

impl NetworkConfig {
    /// TOML 文字列から読み込んで検証する
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML ファイルから読み込んで検証する
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 入力テンソルの形状
    #[inline]
    pub fn input_shape(&self) -> Shape {
        Shape::new(self.input_channels, self.board_size, self.board_size)
    }

    /// タワーのテンソル形状
    #[inline]
    pub fn tower_shape(&self) -> Shape {
        Shape::new(self.filters, self.board_size, self.board_size)
    }

    /// バリュー出力数
    #[inline]
    pub fn value_size(&self) -> usize {
        self.value_head.outputs()
    }

    /// 構成の整合性を検証
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.input_channels == 0 || self.filters == 0 || self.board_size == 0 {
            return invalid("input_channels, filters and board_size must be non-zero".into());
        }
        if self.blocks == 0 {
            return invalid("at least one residual block is required".into());
        }
        if self.se && self.se_channels == 0 {
            return invalid("se_channels must be non-zero when se is enabled".into());
        }
        if self.max_batch == 0 {
            return invalid("max_batch must be non-zero".into());
        }
        if self.policy_size == 0 || self.policy_size > i16::MAX as usize {
            return invalid(format!("policy_size {} out of range", self.policy_size));
        }
        match self.policy_head {
            PolicyHead::Convolution => {
                if self.policy_used_channels == 0 || self.policy_used_channels > self.policy_conv_channels {
                    return invalid(format!(
                        "policy_used_channels {} must be in 1..={}",
                        self.policy_used_channels, self.policy_conv_channels
                    ));
                }
            }
            PolicyHead::Classical => {
                if self.policy_channels == 0 {
                    return invalid("policy_channels must be non-zero".into());
                }
            }
        }
        if self.value_channels == 0 || self.value_fc == 0 {
            return invalid("value_channels and value_fc must be non-zero".into());
        }
        Ok(())
    }
}
